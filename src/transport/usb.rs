//! USB links.
//!
//! A USB-attached runtime reaches the relay through a forwarded TCP port
//! (`adb forward`/`adb reverse` or an equivalent). Each accepted stream
//! carries length-prefixed frames (see [`super::framing`]).

// Rust guideline compliant 2026-02

use std::collections::VecDeque;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;

use super::framing::{FrameDecoder, UsbFrame};
use super::{FrameSink, FrameSource, TransportError};

/// Read buffer size for the USB link.
const READ_BUF_SIZE: usize = 64 * 1024;

/// Write half of a USB link.
#[derive(Debug)]
pub struct UsbWriter {
    write: OwnedWriteHalf,
}

/// Read half of a USB link.
#[derive(Debug)]
pub struct UsbReader {
    read: OwnedReadHalf,
    decoder: FrameDecoder,
    pending: VecDeque<UsbFrame>,
    buf: Box<[u8]>,
}

/// Split a forwarded TCP stream into framed halves.
pub fn split(stream: TcpStream) -> (UsbWriter, UsbReader) {
    if let Err(e) = stream.set_nodelay(true) {
        log::debug!("[USB] set_nodelay failed: {e}");
    }
    let (read, write) = stream.into_split();
    (
        UsbWriter { write },
        UsbReader {
            read,
            decoder: FrameDecoder::new(),
            pending: VecDeque::new(),
            buf: vec![0u8; READ_BUF_SIZE].into_boxed_slice(),
        },
    )
}

/// Dial a forwarded port. Used by runtime-side tooling and tests.
pub async fn connect(addr: &str) -> Result<(UsbWriter, UsbReader), TransportError> {
    let stream = TcpStream::connect(addr)
        .await
        .map_err(|e| TransportError::Connect(format!("{addr}: {e}")))?;
    Ok(split(stream))
}

#[async_trait]
impl FrameSink for UsbWriter {
    async fn send_text(&mut self, text: &str) -> Result<(), TransportError> {
        self.write
            .write_all(&UsbFrame::Json(text.to_string()).encode())
            .await
            .map_err(|e| TransportError::Io(format!("USB write failed: {e}")))
    }

    async fn close(&mut self) {
        if let Err(e) = self.write.write_all(&UsbFrame::Goodbye.encode()).await {
            log::trace!("[USB] goodbye: {e}");
        }
        if let Err(e) = self.write.shutdown().await {
            log::trace!("[USB] shutdown: {e}");
        }
    }
}

#[async_trait]
impl FrameSource for UsbReader {
    async fn recv_text(&mut self) -> Option<Result<String, TransportError>> {
        loop {
            match self.pending.pop_front() {
                Some(UsbFrame::Json(text)) => return Some(Ok(text)),
                Some(UsbFrame::Goodbye) => {
                    log::debug!("[USB] Peer said goodbye");
                    return None;
                }
                None => {}
            }

            let n = match self.read.read(&mut self.buf).await {
                Ok(0) => return None,
                Ok(n) => n,
                Err(e) => return Some(Err(TransportError::Io(format!("USB read failed: {e}")))),
            };

            match self.decoder.feed(&self.buf[..n]) {
                Ok(frames) => self.pending.extend(frames),
                Err(e) => return Some(Err(TransportError::Protocol(format!("{e:#}")))),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Frame;
    use crate::transport::Connection;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_frames_cross_the_link() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();

        let (client_writer, client_reader) = connect(&addr).await.unwrap();
        let (stream, _) = listener.accept().await.unwrap();
        let (server_writer, server_reader) = split(stream);

        let (client, mut client_in) = Connection::spawn("usb-client", client_writer, client_reader);
        let (server, mut server_in) = Connection::spawn("usb-server", server_writer, server_reader);

        client.send(&Frame::Ping { ts: 7 }).unwrap();
        assert_eq!(server_in.recv().await, Some(Frame::Ping { ts: 7 }));
        server.send(&Frame::Pong { ts: 7 }).unwrap();
        assert_eq!(client_in.recv().await, Some(Frame::Pong { ts: 7 }));

        client.close();
        assert_eq!(server_in.recv().await, None);
        server.closed().await;
        assert!(server.is_closed());
    }

    #[tokio::test]
    async fn test_garbage_bytes_end_the_link() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let mut raw = TcpStream::connect(addr).await.unwrap();
        let (stream, _) = listener.accept().await.unwrap();
        let (_writer, mut reader) = split(stream);

        raw.write_all(&[0, 0, 0, 0]).await.unwrap();
        assert!(matches!(
            reader.recv_text().await,
            Some(Err(TransportError::Protocol(_)))
        ));
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);
        assert!(matches!(connect(&addr).await, Err(TransportError::Connect(_))));
    }
}
