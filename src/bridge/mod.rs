//! Fake socket bridge.
//!
//! In CLI-only deployments there is no locally hosted front-end, so each USB
//! runtime client is mirrored into a room on a remote relay. The bridge
//! registers there as a runtime peer on the client's behalf and relays
//! frames in both directions:
//!
//! - outbound ([`FakeSocketBridge::emit`]): `client_id` and `sender` are
//!   overwritten with the id the remote relay assigned to the bridge
//! - inbound ([`BridgeInbound::recv`]): `client_id` is normalized to
//!   [`ClientId::UNADDRESSED`]; `Page.reload` directives carrying a `url`
//!   are expanded with the template inlined or fragmented
//!
//! Connecting is asynchronous. Emits issued before the bridge is ready are
//! queued and flushed in order once the remote relay answers `Registered`.
//! [`FakeSocketBridge::ready`] resolves at that point.
//!
//! Template loads run as separate tasks so other inbound frames keep flowing
//! while a template downloads.

pub mod template;

use std::path::PathBuf;

use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;

use crate::config::room_url;
use crate::constants::PAGE_RELOAD_METHOD;
use crate::fragment::{self, Encoded};
use crate::protocol::{
    ClientId, ClientInfo, ClientRole, CustomMessageFrame, FragmentFrame, Frame, RegisterFrame,
};
use crate::transport::{Connection, TransportError};

use self::template::TemplateLoader;

/// Errors raised by the bridge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BridgeError {
    /// The remote relay could not be reached or refused the handshake.
    Connect(TransportError),
    /// The bridge has shut down.
    Closed,
    /// A template could not be loaded.
    Template(String),
}

impl std::fmt::Display for BridgeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Connect(e) => write!(f, "Bridge connect failed: {e}"),
            Self::Closed => write!(f, "Bridge closed"),
            Self::Template(msg) => write!(f, "Template load failed: {msg}"),
        }
    }
}

impl std::error::Error for BridgeError {}

/// Where and as whom the bridge connects.
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// Remote relay endpoint (`ws://` or `wss://`).
    pub endpoint: String,
    /// Room to join on the remote relay.
    pub room: String,
    /// Metadata of the client being mirrored.
    pub info: ClientInfo,
    /// Role to register as.
    pub role: ClientRole,
    /// Templates above this size are fragmented.
    pub fragment_threshold: usize,
    /// Searched before downloading templates.
    pub template_dir: Option<PathBuf>,
}

/// Bridge lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeState {
    /// Handshake with the remote relay in progress.
    Connecting,
    /// Registered under this id.
    Ready(ClientId),
    /// Disconnected, or never connected.
    Closed,
}

#[derive(Debug)]
enum BridgeCommand {
    Emit(Frame),
    Disconnect,
}

/// Handle to a running bridge.
#[derive(Debug, Clone)]
pub struct FakeSocketBridge {
    commands: mpsc::UnboundedSender<BridgeCommand>,
    state: watch::Receiver<BridgeState>,
}

/// Frames arriving from the remote room.
#[derive(Debug)]
pub struct BridgeInbound {
    rx: mpsc::UnboundedReceiver<Frame>,
}

impl BridgeInbound {
    /// Next inbound frame, or `None` once the bridge has closed.
    pub async fn recv(&mut self) -> Option<Frame> {
        self.rx.recv().await
    }
}

impl FakeSocketBridge {
    /// Start connecting. Returns immediately.
    pub fn connect(config: BridgeConfig) -> (Self, BridgeInbound) {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(BridgeState::Connecting);
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();

        tokio::spawn(run_bridge(config, command_rx, state_tx, inbound_tx));

        (
            Self {
                commands: command_tx,
                state: state_rx,
            },
            BridgeInbound { rx: inbound_rx },
        )
    }

    /// Current state.
    pub fn state(&self) -> BridgeState {
        *self.state.borrow()
    }

    /// Wait until the remote relay has registered the bridge.
    pub async fn ready(&self) -> Result<ClientId, BridgeError> {
        let mut state = self.state.clone();
        let settled = state
            .wait_for(|s| !matches!(s, BridgeState::Connecting))
            .await
            .map(|s| *s);
        match settled {
            Ok(BridgeState::Ready(id)) => Ok(id),
            _ => Err(BridgeError::Closed),
        }
    }

    /// Forward a frame to the remote room, queueing it until ready.
    pub fn emit(&self, frame: Frame) -> Result<(), BridgeError> {
        self.commands
            .send(BridgeCommand::Emit(frame))
            .map_err(|_closed| BridgeError::Closed)
    }

    /// Disconnect from the remote relay. Queued emits are dropped.
    pub fn disconnect(&self) {
        if self.commands.send(BridgeCommand::Disconnect).is_err() {
            log::debug!("[Bridge] Already closed");
        }
    }
}

/// Stamp an outbound frame with the bridge's own id.
fn stamp_outbound(frame: Frame, id: ClientId) -> Frame {
    match frame {
        Frame::Custom(mut custom) => {
            custom.client_id = id;
            custom.sender = id;
            Frame::Custom(custom)
        }
        Frame::Fragment(mut fragment) => {
            fragment.frame.client_id = id;
            fragment.frame.sender = id;
            Frame::Fragment(fragment)
        }
        Frame::SessionList(mut list) => {
            list.client_id = id;
            list.sender = id;
            Frame::SessionList(list)
        }
        other => other,
    }
}

/// Hide the remote id on an inbound frame.
fn normalize_inbound(frame: Frame) -> Frame {
    match frame {
        Frame::Custom(mut custom) => {
            custom.client_id = ClientId::UNADDRESSED;
            Frame::Custom(custom)
        }
        Frame::Fragment(mut fragment) => {
            fragment.frame.client_id = ClientId::UNADDRESSED;
            Frame::Fragment(fragment)
        }
        Frame::SessionList(mut list) => {
            list.client_id = ClientId::UNADDRESSED;
            Frame::SessionList(list)
        }
        other => other,
    }
}

/// Template URL of a `Page.reload` directive.
fn page_reload_url(frame: &CustomMessageFrame) -> Option<String> {
    let message = frame.message_json()?;
    if message.get("method").and_then(Value::as_str) != Some(PAGE_RELOAD_METHOD) {
        return None;
    }
    message
        .get("params")?
        .get("url")?
        .as_str()
        .map(String::from)
}

/// Inline `bytes` into a `Page.reload` frame, or split it into a header
/// frame plus `Lynx.transferData` fragments sharing its session id.
pub fn expand_page_reload(
    frame: &CustomMessageFrame,
    bytes: &[u8],
    threshold: usize,
    timestamp: i64,
) -> Vec<Frame> {
    let unchanged = || vec![Frame::Custom(frame.clone())];
    let Some(mut message) = frame.message_json() else {
        return unchanged();
    };
    let Some(object) = message.as_object_mut() else {
        return unchanged();
    };
    let params = object
        .entry("params")
        .or_insert_with(|| Value::Object(serde_json::Map::new()));
    if !params.is_object() {
        *params = Value::Object(serde_json::Map::new());
    }
    let Some(params) = params.as_object_mut() else {
        return unchanged();
    };

    match fragment::encode(frame.session_id, bytes, threshold, timestamp) {
        Encoded::Inline(data) => {
            params.insert("pageData".into(), Value::String(data));
            params.insert("timestamp".into(), Value::from(timestamp));
            vec![Frame::Custom(frame.with_message_json(message))]
        }
        Encoded::Fragmented { header, fragments } => {
            header.write_params(params);
            let mut frames = Vec::with_capacity(1 + fragments.len());
            frames.push(Frame::Custom(frame.with_message_json(message)));
            frames.extend(fragments.into_iter().map(|envelope| {
                Frame::Fragment(FragmentFrame {
                    frame: frame.with_message_json(envelope.to_message()),
                    envelope,
                })
            }));
            frames
        }
    }
}

async fn run_bridge(
    config: BridgeConfig,
    mut commands: mpsc::UnboundedReceiver<BridgeCommand>,
    state: watch::Sender<BridgeState>,
    inbound: mpsc::UnboundedSender<Frame>,
) {
    let url = room_url(&config.endpoint, &config.room);
    let identity = RegisterFrame {
        role: config.role,
        info: config.info.clone(),
        bridged: true,
    };
    log::info!("[Bridge] Connecting to {url}");

    let mut queued = Vec::new();
    let connect = Connection::connect(&url, identity);
    tokio::pin!(connect);

    let registered = loop {
        tokio::select! {
            result = &mut connect => break result,
            command = commands.recv() => match command {
                Some(BridgeCommand::Emit(frame)) => queued.push(frame),
                Some(BridgeCommand::Disconnect) | None => {
                    log::info!("[Bridge] Disconnected before {url} answered");
                    commands.close();
                    state.send_replace(BridgeState::Closed);
                    return;
                }
            },
        }
    };

    let registered = match registered {
        Ok(registered) => registered,
        Err(e) => {
            log::warn!("[Bridge] {}", BridgeError::Connect(e));
            commands.close();
            state.send_replace(BridgeState::Closed);
            return;
        }
    };

    let id = registered.id;
    let connection = registered.connection;
    let mut remote = registered.inbound;
    let loader = TemplateLoader::new(config.template_dir.clone());
    let mut expansions: JoinSet<Vec<Frame>> = JoinSet::new();
    state.send_replace(BridgeState::Ready(id));
    log::info!("[Bridge] Registered in room '{}' as {id}", config.room);

    for frame in queued.drain(..) {
        if let Err(e) = connection.send(&stamp_outbound(frame, id)) {
            log::warn!("[Bridge] Dropping queued frame: {e}");
        }
    }

    loop {
        tokio::select! {
            command = commands.recv() => match command {
                Some(BridgeCommand::Emit(frame)) => {
                    if let Err(e) = connection.send(&stamp_outbound(frame, id)) {
                        log::warn!("[Bridge] Emit failed: {e}");
                        break;
                    }
                }
                Some(BridgeCommand::Disconnect) | None => break,
            },
            frame = remote.recv() => {
                let Some(frame) = frame else {
                    log::info!("[Bridge] Remote relay closed the connection");
                    break;
                };
                let frame = normalize_inbound(frame);
                match reload_directive(&frame) {
                    Some((custom, url)) => {
                        let loader = loader.clone();
                        let threshold = config.fragment_threshold;
                        expansions.spawn(async move {
                            expand_reload(custom, &url, &loader, threshold).await
                        });
                    }
                    None => deliver(&inbound, vec![frame]),
                }
            }
            Some(done) = expansions.join_next(), if !expansions.is_empty() => match done {
                Ok(frames) => deliver(&inbound, frames),
                Err(e) => log::warn!("[Bridge] Template task failed: {e}"),
            },
        }
    }

    // Dropping the set aborts template loads still in flight
    drop(expansions);
    connection.close();
    commands.close();
    state.send_replace(BridgeState::Closed);
    log::info!("[Bridge] Closed bridge {id}");
}

fn deliver(inbound: &mpsc::UnboundedSender<Frame>, frames: Vec<Frame>) {
    for frame in frames {
        if inbound.send(frame).is_err() {
            log::debug!("[Bridge] Inbound receiver dropped");
        }
    }
}

/// A `Page.reload` directive and its template URL.
fn reload_directive(frame: &Frame) -> Option<(CustomMessageFrame, String)> {
    let Frame::Custom(custom) = frame else {
        return None;
    };
    page_reload_url(custom).map(|url| (custom.clone(), url))
}

async fn expand_reload(
    custom: CustomMessageFrame,
    url: &str,
    loader: &TemplateLoader,
    threshold: usize,
) -> Vec<Frame> {
    match loader.load(url).await {
        Ok(bytes) => {
            let timestamp = chrono::Utc::now().timestamp_millis();
            let frames = expand_page_reload(&custom, &bytes, threshold, timestamp);
            log::debug!(
                "[Bridge] Page.reload for session {} expanded into {} message(s)",
                custom.session_id,
                frames.len()
            );
            frames
        }
        Err(e) => {
            log::warn!("[Bridge] {e}; delivering Page.reload unchanged");
            vec![Frame::Custom(custom)]
        }
    }
}
