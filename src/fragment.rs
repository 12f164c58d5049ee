//! Fragment codec for oversized template payloads.
//!
//! Templates are shipped to the runtime inside CDP messages. Anything larger
//! than the threshold is split so no single message exceeds the transport's
//! byte limit:
//!
//! ```text
//! Page.reload   { pageData: chunk0, fromPageDataFragments: true,
//!                 pageDataLength: N, timestamp }              (header, seq 0)
//! Lynx.transferData { data: chunk1, seqId: 1, eof: false }
//! Lynx.transferData { data: chunk2, seqId: 2, eof: false }
//! Lynx.transferData { data: chunkK, seqId: K, eof: true,
//!                     seq_count: K+1, tem_file_len: N }
//! ```
//!
//! Every chunk is `threshold` bytes except the last. Payloads of at most
//! `threshold` bytes are never fragmented; callers get [`Encoded::Inline`]
//! and embed it directly.
//!
//! On the receiving side [`Reassembler`] keys streams by request id (the
//! session id of the frames carrying them), insists on strictly increasing
//! `seqId`, and hands back the full payload once `eof` arrives.

use std::collections::HashMap;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde_json::{json, Map, Value};

/// `dataType` tag carried by template fragments.
const TEMPLATE_DATA_TYPE: &str = "template";

/// Header of a fragmented transfer, merged into the `Page.reload` params.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FragmentHeader {
    /// Stream the header opens.
    pub request_id: i64,
    /// Base64 of the first `threshold` bytes.
    pub first_chunk: String,
    /// Length of the original payload in bytes.
    pub total_length: usize,
    /// Milliseconds since the epoch when the transfer started.
    pub timestamp: i64,
}

impl FragmentHeader {
    /// Write the header fields into CDP `params`.
    pub fn write_params(&self, params: &mut Map<String, Value>) {
        params.insert("pageData".into(), Value::String(self.first_chunk.clone()));
        params.insert("fromPageDataFragments".into(), Value::Bool(true));
        params.insert("pageDataLength".into(), json!(self.total_length));
        params.insert("timestamp".into(), json!(self.timestamp));
    }

    /// Read a header back out of CDP `params`.
    ///
    /// Returns `None` when the params do not announce a fragmented transfer.
    pub fn from_params(request_id: i64, params: &Value) -> Option<Self> {
        if params.get("fromPageDataFragments").and_then(Value::as_bool) != Some(true) {
            return None;
        }
        Some(Self {
            request_id,
            first_chunk: params.get("pageData")?.as_str()?.to_string(),
            total_length: usize::try_from(params.get("pageDataLength")?.as_u64()?).ok()?,
            timestamp: params.get("timestamp").and_then(Value::as_i64).unwrap_or_default(),
        })
    }
}

/// One `Lynx.transferData` fragment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FragmentEnvelope {
    /// Stream the fragment belongs to.
    pub request_id: i64,
    /// Position in the stream; the header is 0.
    pub seq_id: u32,
    /// Base64 chunk.
    pub data: String,
    /// Marks the final fragment.
    pub eof: bool,
    /// Total number of chunks including the header (final fragment only).
    pub seq_count: Option<u32>,
    /// Original payload length (final fragment only).
    pub total_length: Option<usize>,
}

impl FragmentEnvelope {
    /// CDP params for this fragment.
    pub fn to_params(&self) -> Value {
        let mut params = json!({
            "dataType": TEMPLATE_DATA_TYPE,
            "data": self.data,
            "eof": self.eof,
            "seqId": self.seq_id,
        });
        if let Some(count) = self.seq_count {
            params["seq_count"] = json!(count);
        }
        if let Some(len) = self.total_length {
            params["tem_file_len"] = json!(len);
        }
        params
    }

    /// Full CDP message (`method` + `params`) for this fragment.
    pub fn to_message(&self) -> Value {
        json!({
            "method": crate::constants::TRANSFER_DATA_METHOD,
            "params": self.to_params(),
        })
    }

    /// Parse fragment params received on the wire.
    pub fn from_params(request_id: i64, params: &Value) -> Result<Self, FragmentError> {
        let data = params
            .get("data")
            .and_then(Value::as_str)
            .ok_or(FragmentError::MissingField("data"))?;
        let eof = params
            .get("eof")
            .and_then(Value::as_bool)
            .ok_or(FragmentError::MissingField("eof"))?;
        let seq_id = params
            .get("seqId")
            .and_then(Value::as_u64)
            .and_then(|s| u32::try_from(s).ok())
            .ok_or(FragmentError::MissingField("seqId"))?;

        Ok(Self {
            request_id,
            seq_id,
            data: data.to_string(),
            eof,
            seq_count: params
                .get("seq_count")
                .and_then(Value::as_u64)
                .and_then(|c| u32::try_from(c).ok()),
            total_length: params
                .get("tem_file_len")
                .and_then(Value::as_u64)
                .and_then(|l| usize::try_from(l).ok()),
        })
    }
}

/// Result of [`encode`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Encoded {
    /// Small payload: embed this base64 string directly.
    Inline(String),
    /// Large payload: send the header, then every fragment in order.
    Fragmented {
        /// Carried by the first message.
        header: FragmentHeader,
        /// Follow-up `Lynx.transferData` fragments; the last has `eof`.
        fragments: Vec<FragmentEnvelope>,
    },
}

impl Encoded {
    /// Number of messages this payload occupies on the wire.
    pub fn message_count(&self) -> usize {
        match self {
            Self::Inline(_) => 1,
            Self::Fragmented { fragments, .. } => 1 + fragments.len(),
        }
    }
}

/// Split `bytes` for transfer under `request_id`.
///
/// Payloads of at most `threshold` bytes come back inline. A zero
/// threshold is treated as 1.
pub fn encode(request_id: i64, bytes: &[u8], threshold: usize, timestamp: i64) -> Encoded {
    let threshold = threshold.max(1);
    if bytes.len() <= threshold {
        return Encoded::Inline(STANDARD.encode(bytes));
    }

    let mut chunks = bytes.chunks(threshold);
    // len > threshold, so there are at least two chunks
    let first = chunks.next().unwrap_or_default();
    let rest: Vec<&[u8]> = chunks.collect();
    let last_index = rest.len().saturating_sub(1);

    let fragments = rest
        .iter()
        .enumerate()
        .map(|(i, chunk)| {
            let seq_id = (i + 1) as u32;
            let eof = i == last_index;
            FragmentEnvelope {
                request_id,
                seq_id,
                data: STANDARD.encode(chunk),
                eof,
                seq_count: eof.then_some(seq_id + 1),
                total_length: eof.then_some(bytes.len()),
            }
        })
        .collect();

    Encoded::Fragmented {
        header: FragmentHeader {
            request_id,
            first_chunk: STANDARD.encode(first),
            total_length: bytes.len(),
            timestamp,
        },
        fragments,
    }
}

/// Decode an inline payload.
pub fn decode_inline(data: &str) -> Result<Vec<u8>, FragmentError> {
    STANDARD
        .decode(data)
        .map_err(|e| FragmentError::InvalidBase64(e.to_string()))
}

/// Errors raised while reassembling a fragment stream.
///
/// Any error aborts the stream it occurred on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FragmentError {
    /// A fragment arrived for a stream that was never opened.
    UnknownStream(i64),
    /// A fragment skipped or repeated a sequence number.
    OutOfOrder {
        /// Stream the fragment belongs to.
        request_id: i64,
        /// Sequence number the stream was waiting for.
        expected: u32,
        /// Sequence number that arrived.
        got: u32,
    },
    /// The reassembled length disagrees with the announced length.
    LengthMismatch {
        /// Announced length.
        expected: usize,
        /// Bytes actually received.
        actual: usize,
    },
    /// A chunk was not valid base64.
    InvalidBase64(String),
    /// A required field was absent from the fragment params.
    MissingField(&'static str),
}

impl std::fmt::Display for FragmentError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UnknownStream(id) => write!(f, "Fragment for unknown stream {id}"),
            Self::OutOfOrder { request_id, expected, got } => write!(
                f,
                "Out-of-order fragment on stream {request_id}: expected seq {expected}, got {got}"
            ),
            Self::LengthMismatch { expected, actual } => {
                write!(f, "Reassembled {actual} bytes, expected {expected}")
            }
            Self::InvalidBase64(msg) => write!(f, "Invalid base64 chunk: {msg}"),
            Self::MissingField(field) => write!(f, "Fragment missing field '{field}'"),
        }
    }
}

impl std::error::Error for FragmentError {}

/// Reassembly state for one stream.
#[derive(Debug)]
struct PartialStream {
    next_seq: u32,
    expected_len: usize,
    buf: Vec<u8>,
}

/// Collects fragment streams until their `eof` fragment arrives.
///
/// Streams are independent, so any number may be in flight at once.
#[derive(Debug, Default)]
pub struct Reassembler {
    streams: HashMap<i64, PartialStream>,
}

impl Reassembler {
    /// Create an empty reassembler.
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a stream from its header.
    ///
    /// A header for a stream already in flight restarts it.
    pub fn begin(&mut self, header: &FragmentHeader) -> Result<(), FragmentError> {
        let first = decode_inline(&header.first_chunk)?;
        let mut buf = Vec::with_capacity(header.total_length);
        buf.extend_from_slice(&first);

        if self
            .streams
            .insert(
                header.request_id,
                PartialStream {
                    next_seq: 1,
                    expected_len: header.total_length,
                    buf,
                },
            )
            .is_some()
        {
            log::warn!("[Fragment] Stream {} restarted by a new header", header.request_id);
        }
        Ok(())
    }

    /// Add a fragment. Returns the full payload once `eof` is seen.
    pub fn push(&mut self, envelope: &FragmentEnvelope) -> Result<Option<Vec<u8>>, FragmentError> {
        let id = envelope.request_id;
        let stream = self
            .streams
            .get_mut(&id)
            .ok_or(FragmentError::UnknownStream(id))?;

        if envelope.seq_id != stream.next_seq {
            let expected = stream.next_seq;
            self.streams.remove(&id);
            return Err(FragmentError::OutOfOrder {
                request_id: id,
                expected,
                got: envelope.seq_id,
            });
        }

        let chunk = match decode_inline(&envelope.data) {
            Ok(chunk) => chunk,
            Err(e) => {
                self.streams.remove(&id);
                return Err(e);
            }
        };
        stream.buf.extend_from_slice(&chunk);
        stream.next_seq += 1;

        if !envelope.eof {
            return Ok(None);
        }

        let Some(done) = self.streams.remove(&id) else {
            return Err(FragmentError::UnknownStream(id));
        };
        let expected = envelope.total_length.unwrap_or(done.expected_len);
        if done.buf.len() != expected {
            return Err(FragmentError::LengthMismatch {
                expected,
                actual: done.buf.len(),
            });
        }
        Ok(Some(done.buf))
    }

    /// Drop a stream without completing it.
    pub fn abort(&mut self, request_id: i64) {
        self.streams.remove(&request_id);
    }

    /// Number of streams waiting for more fragments.
    pub fn in_progress(&self) -> usize {
        self.streams.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::DEFAULT_FRAGMENT_THRESHOLD;

    fn payload(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    fn reassemble(encoded: &Encoded) -> Vec<u8> {
        match encoded {
            Encoded::Inline(data) => decode_inline(data).unwrap(),
            Encoded::Fragmented { header, fragments } => {
                let mut reassembler = Reassembler::new();
                reassembler.begin(header).unwrap();
                let mut result = None;
                for fragment in fragments {
                    assert!(result.is_none(), "payload completed before eof");
                    result = reassembler.push(fragment).unwrap();
                }
                assert_eq!(reassembler.in_progress(), 0);
                result.expect("eof fragment completes the stream")
            }
        }
    }

    #[test]
    fn test_round_trip_multiples_of_threshold() {
        let threshold = DEFAULT_FRAGMENT_THRESHOLD;
        for k in [0usize, 1, 2, 5] {
            let bytes = payload(threshold * k + 4321);
            let encoded = encode(7, &bytes, threshold, 0);
            assert_eq!(encoded.message_count(), k + 1, "k={k}");
            assert_eq!(reassemble(&encoded), bytes, "k={k}");
        }
    }

    #[test]
    fn test_exact_threshold_is_inline() {
        let bytes = payload(DEFAULT_FRAGMENT_THRESHOLD);
        let encoded = encode(1, &bytes, DEFAULT_FRAGMENT_THRESHOLD, 0);
        assert!(matches!(encoded, Encoded::Inline(_)));
    }

    #[test]
    fn test_threshold_plus_one_is_two_messages() {
        let bytes = payload(DEFAULT_FRAGMENT_THRESHOLD + 1);
        let Encoded::Fragmented { header, fragments } =
            encode(1, &bytes, DEFAULT_FRAGMENT_THRESHOLD, 99)
        else {
            panic!("expected fragmentation");
        };

        assert_eq!(header.total_length, DEFAULT_FRAGMENT_THRESHOLD + 1);
        assert_eq!(header.timestamp, 99);
        assert_eq!(fragments.len(), 1);
        let last = &fragments[0];
        assert!(last.eof);
        assert_eq!(last.seq_id, 1);
        assert_eq!(last.seq_count, Some(2));
        assert_eq!(last.total_length, Some(DEFAULT_FRAGMENT_THRESHOLD + 1));
        assert_eq!(decode_inline(&last.data).unwrap().len(), 1);
    }

    #[test]
    fn test_exact_multiple_of_threshold_has_no_empty_tail() {
        for k in [2usize, 3, 4] {
            let bytes = payload(10 * k);
            let encoded = encode(8, &bytes, 10, 0);
            assert_eq!(encoded.message_count(), k, "k={k}");

            let Encoded::Fragmented { fragments, .. } = &encoded else {
                panic!("expected fragmentation for k={k}");
            };
            let last = fragments.last().unwrap();
            assert!(last.eof);
            assert_eq!(last.seq_id as usize, k - 1);
            assert_eq!(last.seq_count, Some(k as u32));
            assert_eq!(last.total_length, Some(10 * k));
            assert_eq!(decode_inline(&last.data).unwrap().len(), 10);
            assert_eq!(reassemble(&encoded), bytes, "k={k}");
        }
    }

    #[test]
    fn test_only_last_fragment_has_eof() {
        let Encoded::Fragmented { fragments, .. } = encode(3, &payload(45), 10, 0) else {
            panic!("expected fragmentation");
        };
        let seqs: Vec<u32> = fragments.iter().map(|f| f.seq_id).collect();
        assert_eq!(seqs, vec![1, 2, 3, 4]);
        assert_eq!(fragments.iter().filter(|f| f.eof).count(), 1);
        assert!(fragments[3].eof);
        assert_eq!(fragments[3].seq_count, Some(5));
    }

    #[test]
    fn test_out_of_order_rejected() {
        let Encoded::Fragmented { header, fragments } = encode(5, &payload(35), 10, 0) else {
            panic!("expected fragmentation");
        };
        let mut reassembler = Reassembler::new();
        reassembler.begin(&header).unwrap();

        let err = reassembler.push(&fragments[1]).unwrap_err();
        assert_eq!(
            err,
            FragmentError::OutOfOrder { request_id: 5, expected: 1, got: 2 }
        );
        // Stream is abandoned after the error
        assert_eq!(reassembler.in_progress(), 0);
        assert_eq!(
            reassembler.push(&fragments[0]).unwrap_err(),
            FragmentError::UnknownStream(5)
        );
    }

    #[test]
    fn test_concurrent_streams_are_independent() {
        let a = payload(25);
        let b: Vec<u8> = payload(31).into_iter().rev().collect();
        let Encoded::Fragmented { header: ha, fragments: fa } = encode(1, &a, 10, 0) else {
            panic!("expected fragmentation");
        };
        let Encoded::Fragmented { header: hb, fragments: fb } = encode(2, &b, 10, 0) else {
            panic!("expected fragmentation");
        };

        let mut reassembler = Reassembler::new();
        reassembler.begin(&ha).unwrap();
        reassembler.begin(&hb).unwrap();
        assert_eq!(reassembler.in_progress(), 2);

        assert_eq!(reassembler.push(&fb[0]).unwrap(), None);
        assert_eq!(reassembler.push(&fa[0]).unwrap(), None);
        assert_eq!(reassembler.push(&fa[1]).unwrap(), Some(a));
        assert_eq!(reassembler.push(&fb[1]).unwrap(), None);
        assert_eq!(reassembler.push(&fb[2]).unwrap(), Some(b));
    }

    #[test]
    fn test_params_round_trip() {
        let Encoded::Fragmented { header, fragments } = encode(9, &payload(25), 10, 1234) else {
            panic!("expected fragmentation");
        };

        let mut params = Map::new();
        params.insert("url".into(), json!("http://host/main.bundle"));
        header.write_params(&mut params);
        let parsed = FragmentHeader::from_params(9, &Value::Object(params)).unwrap();
        assert_eq!(parsed, header);

        let last = fragments.last().unwrap();
        let message = last.to_message();
        assert_eq!(message["method"], "Lynx.transferData");
        assert_eq!(message["params"]["dataType"], "template");
        assert_eq!(message["params"]["tem_file_len"], 25);
        let parsed = FragmentEnvelope::from_params(9, &message["params"]).unwrap();
        assert_eq!(&parsed, last);
    }

    #[test]
    fn test_plain_reload_params_are_not_a_header() {
        let params = json!({"url": "http://host/a.bundle", "pageData": "AAAA"});
        assert_eq!(FragmentHeader::from_params(1, &params), None);
    }

    #[test]
    fn test_missing_seq_id_rejected() {
        let params = json!({"data": "", "eof": true});
        assert_eq!(
            FragmentEnvelope::from_params(1, &params),
            Err(FragmentError::MissingField("seqId"))
        );
    }
}
