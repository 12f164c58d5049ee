//! Transport adapters.
//!
//! Every physical link (WebSocket, USB-forwarded TCP, in-memory pair) is
//! wrapped in the same [`Connection`] handle:
//!
//! - [`Connection::send`] queues a frame for the writer task
//! - [`Inbound::recv`] yields frames already decoded at the boundary
//! - [`Connection::on_close`] callbacks run exactly once, however the link ends
//! - [`Connection::close`] flushes queued frames, then closes the link
//!
//! A link plugs in by implementing [`FrameSink`] and [`FrameSource`];
//! [`Connection::spawn`] starts one writer and one reader task for it.
//!
//! # Handshake
//!
//! Peers announce themselves with a `Register` frame and wait for
//! `Registered`. [`Connection::register_over`] performs that exchange on raw
//! halves before any task is spawned, so an attempt that exceeds
//! [`HANDSHAKE_TIMEOUT`] is dropped along with its socket.

// Rust guideline compliant 2026-02

pub mod framing;
pub mod memory;
pub mod usb;
pub mod ws;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::constants::HANDSHAKE_TIMEOUT;
use crate::protocol::{ClientId, Frame, RegisterFrame, WireMessage};

/// Errors raised by a transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// The connection is closed; nothing more can be sent.
    Closed,
    /// The handshake did not finish within [`HANDSHAKE_TIMEOUT`].
    Timeout,
    /// Could not establish the link.
    Connect(String),
    /// Read or write failure on an established link.
    Io(String),
    /// The peer broke the framing or handshake rules.
    Protocol(String),
}

impl std::fmt::Display for TransportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "Connection closed"),
            Self::Timeout => write!(f, "Handshake timed out after {HANDSHAKE_TIMEOUT:?}"),
            Self::Connect(msg) => write!(f, "Connect failed: {msg}"),
            Self::Io(msg) => write!(f, "I/O error: {msg}"),
            Self::Protocol(msg) => write!(f, "Protocol error: {msg}"),
        }
    }
}

impl std::error::Error for TransportError {}

/// Write half of a link.
#[async_trait]
pub trait FrameSink: Send + 'static {
    /// Send one serialized envelope.
    async fn send_text(&mut self, text: &str) -> Result<(), TransportError>;

    /// Close the link. Errors are ignored; the link is gone either way.
    async fn close(&mut self);
}

/// Read half of a link.
#[async_trait]
pub trait FrameSource: Send + 'static {
    /// Next serialized envelope, or `None` once the link has ended.
    async fn recv_text(&mut self) -> Option<Result<String, TransportError>>;
}

type CloseCallback = Box<dyn FnOnce() + Send>;

/// Close state shared by a connection's handle and its tasks.
struct CloseSignal {
    closed: AtomicBool,
    callbacks: Mutex<Vec<CloseCallback>>,
    token: CancellationToken,
}

impl CloseSignal {
    fn new() -> Self {
        Self {
            closed: AtomicBool::new(false),
            callbacks: Mutex::new(Vec::new()),
            token: CancellationToken::new(),
        }
    }

    /// Mark closed and run callbacks. Only the first call has any effect.
    fn fire(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let callbacks = std::mem::take(
            &mut *self.callbacks.lock().unwrap_or_else(PoisonError::into_inner),
        );
        self.token.cancel();
        for callback in callbacks {
            callback();
        }
    }

    fn register(&self, callback: CloseCallback) {
        let mut callbacks = self.callbacks.lock().unwrap_or_else(PoisonError::into_inner);
        if self.closed.load(Ordering::SeqCst) {
            drop(callbacks);
            callback();
        } else {
            callbacks.push(callback);
        }
    }
}

/// Uniform duplex handle over one link. Cheap to clone.
#[derive(Clone)]
pub struct Connection {
    label: Arc<str>,
    outbound: mpsc::UnboundedSender<String>,
    signal: Arc<CloseSignal>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("label", &self.label)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Frames received on a connection, decoded and validated.
#[derive(Debug)]
pub struct Inbound {
    rx: mpsc::UnboundedReceiver<Frame>,
}

impl Inbound {
    /// Next frame, or `None` once the connection has closed.
    pub async fn recv(&mut self) -> Option<Frame> {
        self.rx.recv().await
    }
}

/// Result of a successful client-side handshake.
#[derive(Debug)]
pub struct Registered {
    /// Handle for sending and closing.
    pub connection: Connection,
    /// Frames received after `Registered`.
    pub inbound: Inbound,
    /// Id the relay assigned.
    pub id: ClientId,
}

impl Connection {
    /// Start the writer and reader tasks for a link.
    pub fn spawn<S, R>(label: impl Into<String>, sink: S, source: R) -> (Self, Inbound)
    where
        S: FrameSink,
        R: FrameSource,
    {
        let label: Arc<str> = Arc::from(label.into());
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let signal = Arc::new(CloseSignal::new());

        tokio::spawn(run_writer(
            Arc::clone(&label),
            sink,
            outbound_rx,
            Arc::clone(&signal),
        ));
        tokio::spawn(run_reader(
            Arc::clone(&label),
            source,
            inbound_tx,
            Arc::clone(&signal),
        ));

        (
            Self {
                label,
                outbound: outbound_tx,
                signal,
            },
            Inbound { rx: inbound_rx },
        )
    }

    /// Open a WebSocket connection to `endpoint` and register as `identity`.
    ///
    /// The whole attempt, socket included, is abandoned after
    /// [`HANDSHAKE_TIMEOUT`].
    pub async fn connect(
        endpoint: &str,
        identity: RegisterFrame,
    ) -> Result<Registered, TransportError> {
        tokio::time::timeout(HANDSHAKE_TIMEOUT, async {
            let (writer, reader) = ws::connect(endpoint, &[])
                .await
                .map_err(|e| TransportError::Connect(format!("{e:#}")))?;
            Self::register_over(endpoint, writer, reader, identity).await
        })
        .await
        .map_err(|_elapsed| TransportError::Timeout)?
    }

    /// Send `Register` over raw halves, wait for `Registered`, then spawn.
    ///
    /// Frames other than `Registered` that arrive first are dropped.
    pub async fn register_over<S, R>(
        label: &str,
        mut sink: S,
        mut source: R,
        identity: RegisterFrame,
    ) -> Result<Registered, TransportError>
    where
        S: FrameSink,
        R: FrameSource,
    {
        sink.send_text(&Frame::Register(identity).encode().to_text())
            .await?;

        let id = loop {
            let text = match source.recv_text().await {
                Some(Ok(text)) => text,
                Some(Err(e)) => return Err(e),
                None => return Err(TransportError::Closed),
            };
            match WireMessage::parse(&text).and_then(|msg| Frame::decode(&msg)) {
                Ok(Frame::Registered { id }) => break id,
                Ok(other) => {
                    log::debug!("[Transport] {label}: dropping {} before Registered", other.name());
                }
                Err(e) => log::warn!("[Transport] {label}: {e}"),
            }
        };

        let (connection, inbound) = Self::spawn(format!("{label}#{id}"), sink, source);
        Ok(Registered {
            connection,
            inbound,
            id,
        })
    }

    /// Queue a frame.
    pub fn send(&self, frame: &Frame) -> Result<(), TransportError> {
        self.send_wire(&frame.encode())
    }

    /// Queue a raw envelope.
    pub fn send_wire(&self, msg: &WireMessage) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        self.outbound
            .send(msg.to_text())
            .map_err(|_closed| TransportError::Closed)
    }

    /// Run `callback` once the connection closes, or now if it already has.
    pub fn on_close(&self, callback: impl FnOnce() + Send + 'static) {
        self.signal.register(Box::new(callback));
    }

    /// Close the connection. Frames already queued are flushed first.
    /// Calling this more than once has no further effect.
    pub fn close(&self) {
        self.signal.fire();
    }

    /// Whether the connection has closed.
    pub fn is_closed(&self) -> bool {
        self.signal.closed.load(Ordering::SeqCst)
    }

    /// Resolves once the connection has closed.
    pub async fn closed(&self) {
        self.signal.token.cancelled().await;
    }

    /// Label used in log lines.
    pub fn label(&self) -> &str {
        &self.label
    }
}

async fn run_writer<S: FrameSink>(
    label: Arc<str>,
    mut sink: S,
    mut outbound: mpsc::UnboundedReceiver<String>,
    signal: Arc<CloseSignal>,
) {
    loop {
        tokio::select! {
            biased;

            next = outbound.recv() => {
                let Some(text) = next else {
                    // Every handle was dropped
                    break;
                };
                if let Err(e) = sink.send_text(&text).await {
                    log::debug!("[Transport] {label}: write failed: {e}");
                    break;
                }
            }

            () = signal.token.cancelled() => {
                while let Ok(text) = outbound.try_recv() {
                    if sink.send_text(&text).await.is_err() {
                        break;
                    }
                }
                break;
            }
        }
    }
    sink.close().await;
    signal.fire();
    log::debug!("[Transport] {label}: writer stopped");
}

async fn run_reader<R: FrameSource>(
    label: Arc<str>,
    mut source: R,
    inbound: mpsc::UnboundedSender<Frame>,
    signal: Arc<CloseSignal>,
) {
    loop {
        let next = tokio::select! {
            () = signal.token.cancelled() => break,
            next = source.recv_text() => next,
        };

        match next {
            Some(Ok(text)) => {
                match WireMessage::parse(&text).and_then(|msg| Frame::decode(&msg)) {
                    Ok(frame) => {
                        log::trace!("[Transport] {label}: <- {}", frame.name());
                        if inbound.send(frame).is_err() {
                            log::debug!("[Transport] {label}: inbound receiver dropped");
                            break;
                        }
                    }
                    Err(e) => log::warn!("[Transport] {label}: rejected frame: {e}"),
                }
            }
            Some(Err(e)) => {
                log::debug!("[Transport] {label}: read failed: {e}");
                break;
            }
            None => break,
        }
    }
    signal.fire();
    log::debug!("[Transport] {label}: reader stopped");
}
