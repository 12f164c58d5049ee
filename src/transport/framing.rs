//! Frame codec for the USB link.
//!
//! USB clients are reached through a forwarded TCP port, which is a plain
//! byte stream. Envelopes are delimited with a length prefix and a type byte:
//!
//! ```text
//! [u32 LE length] [u8 type] [payload: length-1 bytes]
//! ```
//!
//! Frame types:
//! - `0x01`: JSON envelope (UTF-8 text)
//! - `0x02`: Goodbye, sent before an orderly close (empty payload)

use anyhow::{anyhow, bail, Result};

use crate::constants::MAX_USB_FRAME_SIZE;

/// Frame type constants.
pub mod frame_type {
    /// JSON envelope.
    pub const JSON: u8 = 0x01;
    /// Orderly close.
    pub const GOODBYE: u8 = 0x02;
}

/// A decoded USB link frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UsbFrame {
    /// Serialized `{event, data}` envelope.
    Json(String),
    /// The peer is closing the link.
    Goodbye,
}

impl UsbFrame {
    /// Encode this frame into a wire-format byte vector.
    ///
    /// Returns `[u32 LE length][u8 type][payload]`.
    pub fn encode(&self) -> Vec<u8> {
        match self {
            Self::Json(text) => encode_raw(frame_type::JSON, text.as_bytes()),
            Self::Goodbye => encode_raw(frame_type::GOODBYE, &[]),
        }
    }
}

/// Encode a raw frame with type byte and payload.
fn encode_raw(frame_type: u8, payload: &[u8]) -> Vec<u8> {
    let length = (payload.len() + 1) as u32; // +1 for type byte
    let mut buf = Vec::with_capacity(4 + 1 + payload.len());
    buf.extend_from_slice(&length.to_le_bytes());
    buf.push(frame_type);
    buf.extend_from_slice(payload);
    buf
}

fn decode_frame(frame_type: u8, payload: &[u8]) -> Result<UsbFrame> {
    match frame_type {
        frame_type::JSON => {
            let text = std::str::from_utf8(payload)
                .map_err(|e| anyhow!("JSON frame is not UTF-8: {e}"))?;
            Ok(UsbFrame::Json(text.to_string()))
        }
        frame_type::GOODBYE => Ok(UsbFrame::Goodbye),
        _ => bail!("Unknown frame type: 0x{frame_type:02x}"),
    }
}

/// Incremental frame decoder that handles partial reads.
///
/// Feed bytes via [`FrameDecoder::feed`] and extract complete frames.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: Vec<u8>,
}

impl FrameDecoder {
    /// Create a new decoder with empty buffer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed bytes into the decoder and extract all complete frames.
    ///
    /// Incomplete data is buffered for the next call.
    ///
    /// # Errors
    ///
    /// Returns an error if a frame is malformed or exceeds the size limit.
    /// The stream cannot be resynchronized after that.
    pub fn feed(&mut self, bytes: &[u8]) -> Result<Vec<UsbFrame>> {
        self.buf.extend_from_slice(bytes);
        let mut frames = Vec::new();

        loop {
            if self.buf.len() < 4 {
                break;
            }

            let length = u32::from_le_bytes([self.buf[0], self.buf[1], self.buf[2], self.buf[3]]);

            if length == 0 {
                bail!("Invalid frame: zero length");
            }
            if length > MAX_USB_FRAME_SIZE {
                bail!("Frame too large: {length} bytes (max {MAX_USB_FRAME_SIZE})");
            }

            let total = 4 + length as usize;
            if self.buf.len() < total {
                break;
            }

            let frame = decode_frame(self.buf[4], &self.buf[5..total])?;
            frames.push(frame);
            self.buf.drain(..total);
        }

        Ok(frames)
    }

    /// Returns true if the decoder has buffered partial data.
    pub fn has_partial(&self) -> bool {
        !self.buf.is_empty()
    }
}
