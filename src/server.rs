//! Relay server.
//!
//! Binds the WebSocket listener (front-ends, bridges, WebSocket runtimes) and
//! the optional USB listener (runtime clients forwarded over `adb`), then runs
//! the event loop that owns the [`Router`].
//!
//! Accept tasks and per-connection tasks only ever talk to the loop through
//! the `RelayEvent` channel, so all routing state is mutated on one task.

// Rust guideline compliant 2026-02

use std::net::SocketAddr;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::bridge::{BridgeConfig, FakeSocketBridge};
use crate::config::RelayConfig;
use crate::constants::HANDSHAKE_TIMEOUT;
use crate::events::{ControlCommand, RelayEvent, SideEvent};
use crate::protocol::{
    ClientId, ClientInfo, ClientRole, Frame, RegisterFrame, TransportKind, WireMessage,
};
use crate::router::Router;
use crate::transport::{usb, ws, Connection, FrameSink, FrameSource, TransportError};

/// Sends operator commands to a running relay.
#[derive(Debug, Clone)]
pub struct RelayHandle {
    events: mpsc::UnboundedSender<RelayEvent>,
}

impl RelayHandle {
    /// Re-scan attached devices (`GET /reconnect`).
    pub fn reconnect(&self) -> Result<(), TransportError> {
        self.send(ControlCommand::Reconnect)
    }

    /// Restart the WebSocket listener if it has stopped (`GET /restartServer`).
    pub fn restart_server(&self) -> Result<(), TransportError> {
        self.send(ControlCommand::RestartServer)
    }

    fn send(&self, command: ControlCommand) -> Result<(), TransportError> {
        self.events
            .send(RelayEvent::Control(command))
            .map_err(|_closed| TransportError::Closed)
    }
}

/// A bound relay, ready to [`run`](Self::run).
#[derive(Debug)]
pub struct RelayServer {
    config: RelayConfig,
    ws_listener: TcpListener,
    ws_addr: SocketAddr,
    usb_listener: Option<TcpListener>,
    usb_addr: Option<SocketAddr>,
    events_tx: mpsc::UnboundedSender<RelayEvent>,
    events_rx: mpsc::UnboundedReceiver<RelayEvent>,
    next_id: Arc<AtomicI64>,
}

impl RelayServer {
    /// Validate `config` and bind its listeners.
    ///
    /// This is the only fallible step of starting a relay; everything after
    /// it is contained to individual connections.
    pub async fn bind(config: RelayConfig) -> Result<Self> {
        config.validate().context("Invalid relay configuration")?;

        let ws_listener = TcpListener::bind(&config.ws_addr)
            .await
            .with_context(|| format!("Failed to bind WebSocket listener on {}", config.ws_addr))?;
        let ws_addr = ws_listener.local_addr()?;

        let (usb_listener, usb_addr) = match &config.usb_addr {
            Some(addr) => {
                let listener = TcpListener::bind(addr)
                    .await
                    .with_context(|| format!("Failed to bind USB listener on {addr}"))?;
                let local = listener.local_addr()?;
                (Some(listener), Some(local))
            }
            None => (None, None),
        };

        log::info!("[Server] WebSocket listening on {ws_addr}");
        if let Some(addr) = usb_addr {
            log::info!("[Server] USB listening on {addr} (room '{}')", config.room);
        }

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Ok(Self {
            config,
            ws_listener,
            ws_addr,
            usb_listener,
            usb_addr,
            events_tx,
            events_rx,
            next_id: Arc::new(AtomicI64::new(1)),
        })
    }

    /// Address of the WebSocket listener.
    pub fn local_addr(&self) -> SocketAddr {
        self.ws_addr
    }

    /// Address of the USB listener, if enabled.
    pub fn usb_addr(&self) -> Option<SocketAddr> {
        self.usb_addr
    }

    /// Handle for issuing [`ControlCommand`]s.
    pub fn handle(&self) -> RelayHandle {
        RelayHandle {
            events: self.events_tx.clone(),
        }
    }

    /// Run until `shutdown` is cancelled.
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        let Self {
            config,
            ws_listener,
            ws_addr,
            usb_listener,
            events_tx,
            mut events_rx,
            next_id,
            ..
        } = self;

        let acceptor = Acceptor {
            default_room: config.room.clone(),
            next_id,
            events: events_tx.clone(),
        };
        let mut ws_task = acceptor.spawn_ws(ws_listener);
        let usb_task = usb_listener.map(|listener| acceptor.spawn_usb(listener));

        let (side_tx, mut side_rx) = mpsc::unbounded_channel();
        let mut router = Router::new(side_tx);
        let bridges = BridgeManager::new(&config, events_tx);

        loop {
            tokio::select! {
                () = shutdown.cancelled() => break,
                Some(event) = events_rx.recv() => match event {
                    RelayEvent::PeerRegistered { id, room, link, register, connection } => {
                        router.attach_peer(id, room, link, register, connection);
                    }
                    RelayEvent::Frame { from, frame } => router.route(from, frame),
                    RelayEvent::PeerClosed { id } => router.detach_peer(id),
                    RelayEvent::BridgeFrame { client, frame } => {
                        router.deliver_from_bridge(client, frame);
                    }
                    RelayEvent::Control(ControlCommand::Reconnect) => router.rescan(),
                    RelayEvent::Control(ControlCommand::RestartServer) => {
                        if ws_task.is_finished() {
                            match TcpListener::bind(ws_addr).await {
                                Ok(listener) => {
                                    log::info!(
                                        "[Server] WebSocket listener restarted on {ws_addr}"
                                    );
                                    ws_task = acceptor.spawn_ws(listener);
                                }
                                Err(e) => log::error!("[Server] Could not rebind {ws_addr}: {e}"),
                            }
                        } else {
                            log::info!("[Server] WebSocket listener already running");
                        }
                    }
                },
                Some(side) = side_rx.recv() => bridges.handle(side, &mut router),
            }
        }

        log::info!("[Server] Shutting down");
        ws_task.abort();
        if let Some(task) = usb_task {
            task.abort();
        }
        router.shutdown();
        Ok(())
    }
}

/// Spawns accept loops and per-connection tasks.
#[derive(Debug, Clone)]
struct Acceptor {
    default_room: String,
    next_id: Arc<AtomicI64>,
    events: mpsc::UnboundedSender<RelayEvent>,
}

impl Acceptor {
    fn spawn_ws(&self, listener: TcpListener) -> JoinHandle<()> {
        let acceptor = self.clone();
        tokio::spawn(async move {
            loop {
                let (stream, addr) = match listener.accept().await {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        log::error!("[Server] WebSocket accept failed, listener stopped: {e}");
                        break;
                    }
                };
                let acceptor = acceptor.clone();
                tokio::spawn(async move {
                    match ws::accept(stream).await {
                        Ok((writer, reader, room)) => {
                            let room = room.unwrap_or_else(|| acceptor.default_room.clone());
                            acceptor
                                .serve(TransportKind::WebSocket, room, writer, reader)
                                .await;
                        }
                        Err(e) => {
                            log::debug!("[Server] WebSocket handshake from {addr} failed: {e:#}");
                        }
                    }
                });
            }
        })
    }

    fn spawn_usb(&self, listener: TcpListener) -> JoinHandle<()> {
        let acceptor = self.clone();
        tokio::spawn(async move {
            loop {
                let (stream, addr) = match listener.accept().await {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        log::error!("[Server] USB accept failed, listener stopped: {e}");
                        break;
                    }
                };
                log::debug!("[Server] USB link from {addr}");
                let acceptor = acceptor.clone();
                let room = acceptor.default_room.clone();
                tokio::spawn(async move {
                    let (writer, reader) = usb::split(stream);
                    acceptor.serve(TransportKind::Usb, room, writer, reader).await;
                });
            }
        })
    }

    /// Handshake, then pump frames into the event loop until the link ends.
    async fn serve<S, R>(&self, link: TransportKind, room: String, mut sink: S, mut source: R)
    where
        S: FrameSink,
        R: FrameSource,
    {
        let register = match await_register(&mut source).await {
            Ok(register) => register,
            Err(e) => {
                log::info!("[Server] {link:?} peer rejected: {e}");
                sink.close().await;
                return;
            }
        };

        let id = ClientId(self.next_id.fetch_add(1, Ordering::SeqCst));
        let (connection, mut inbound) = Connection::spawn(format!("{link:?}#{id}"), sink, source);
        let registered = RelayEvent::PeerRegistered {
            id,
            room,
            link,
            register,
            connection: connection.clone(),
        };
        if self.events.send(registered).is_err() {
            connection.close();
            return;
        }

        while let Some(frame) = inbound.recv().await {
            if self.events.send(RelayEvent::Frame { from: id, frame }).is_err() {
                break;
            }
        }
        connection.close();
        if self.events.send(RelayEvent::PeerClosed { id }).is_err() {
            log::debug!("[Server] Router gone before client {id} closed");
        }
    }
}

/// Wait for the peer's `Register` frame.
async fn await_register<R: FrameSource>(source: &mut R) -> Result<RegisterFrame, TransportError> {
    tokio::time::timeout(HANDSHAKE_TIMEOUT, async {
        loop {
            let text = match source.recv_text().await {
                Some(Ok(text)) => text,
                Some(Err(e)) => return Err(e),
                None => return Err(TransportError::Closed),
            };
            match WireMessage::parse(&text).and_then(|msg| Frame::decode(&msg)) {
                Ok(Frame::Register(register)) => return Ok(register),
                Ok(other) => log::debug!("[Server] Dropping {} before Register", other.name()),
                Err(e) => log::warn!("[Server] {e}"),
            }
        }
    })
    .await
    .map_err(|_elapsed| TransportError::Timeout)?
}

/// Opens a fake socket bridge for every USB runtime client when bridge mode
/// is configured. Bridges are torn down by the router on disconnect.
#[derive(Debug)]
struct BridgeManager {
    base: Option<BridgeConfig>,
    events: mpsc::UnboundedSender<RelayEvent>,
}

impl BridgeManager {
    fn new(config: &RelayConfig, events: mpsc::UnboundedSender<RelayEvent>) -> Self {
        let base = config.bridge.as_ref().map(|settings| BridgeConfig {
            endpoint: settings.endpoint.clone(),
            room: settings.room.clone(),
            info: ClientInfo::default(),
            role: ClientRole::Runtime,
            fragment_threshold: config.fragment_threshold,
            template_dir: config.template_dir.clone(),
        });
        Self { base, events }
    }

    fn handle(&self, event: SideEvent, router: &mut Router) {
        let SideEvent::ClientConnected(descriptor) = event else {
            return;
        };
        let Some(base) = &self.base else {
            return;
        };
        if descriptor.role != ClientRole::Runtime || descriptor.transport != TransportKind::Usb {
            return;
        }

        let client = descriptor.id;
        log::info!("[Bridge] Mirroring USB client {client} into '{}'", base.room);
        let (bridge, mut inbound) = FakeSocketBridge::connect(BridgeConfig {
            info: descriptor.info,
            ..base.clone()
        });
        router.attach_bridge(client, bridge);

        let events = self.events.clone();
        tokio::spawn(async move {
            while let Some(frame) = inbound.recv().await {
                if events.send(RelayEvent::BridgeFrame { client, frame }).is_err() {
                    break;
                }
            }
        });
    }
}
