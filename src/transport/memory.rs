//! In-memory links.
//!
//! Used to embed a transport library that hands over already-framed
//! messages (no socket of our own), and throughout the tests.

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::{Connection, FrameSink, FrameSource, Inbound, TransportError};

/// Sending end of an in-memory link.
#[derive(Debug)]
pub struct MemorySink {
    tx: Option<mpsc::UnboundedSender<String>>,
}

/// Receiving end of an in-memory link.
#[derive(Debug)]
pub struct MemorySource {
    rx: mpsc::UnboundedReceiver<String>,
}

/// One direction of a link.
pub fn channel() -> (MemorySink, MemorySource) {
    let (tx, rx) = mpsc::unbounded_channel();
    (MemorySink { tx: Some(tx) }, MemorySource { rx })
}

/// Two connected [`Connection`]s.
pub fn pair(left: &str, right: &str) -> ((Connection, Inbound), (Connection, Inbound)) {
    let (left_sink, right_source) = channel();
    let (right_sink, left_source) = channel();
    (
        Connection::spawn(left, left_sink, left_source),
        Connection::spawn(right, right_sink, right_source),
    )
}

#[async_trait]
impl FrameSink for MemorySink {
    async fn send_text(&mut self, text: &str) -> Result<(), TransportError> {
        self.tx
            .as_ref()
            .ok_or(TransportError::Closed)?
            .send(text.to_string())
            .map_err(|_closed| TransportError::Closed)
    }

    async fn close(&mut self) {
        self.tx = None;
    }
}

#[async_trait]
impl FrameSource for MemorySource {
    async fn recv_text(&mut self) -> Option<Result<String, TransportError>> {
        self.rx.recv().await.map(Ok)
    }
}
