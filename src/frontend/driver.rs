//! Front-end driver task.
//!
//! Connects to a relay room through the [`ReconnectSupervisor`], pings every
//! [`PING_INTERVAL`], feeds round trips to the [`HeartbeatMonitor`] and relay
//! frames to the [`FrontendView`], and reports everything as
//! [`FrontendEvent`]s.

// Rust guideline compliant 2026-02

use std::time::Instant;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use super::heartbeat::{HealthReport, HeartbeatMonitor};
use super::supervisor::{PromptChoice, ReconnectSupervisor, RetryTicket, Step, Target};
use super::view::{FrontendView, ViewUpdate};
use crate::config::room_url;
use crate::constants::{PING_INTERVAL, RECONNECT_DELAY};
use crate::protocol::{ClientId, ClientInfo, ClientRole, Frame, RegisterFrame, SessionId};
use crate::registry::SelectionOptions;
use crate::transport::{Connection, Registered};

/// Settings for a front-end.
#[derive(Debug, Clone)]
pub struct FrontendConfig {
    /// Relay endpoint and room.
    pub target: Target,
    /// Auto-selection behaviour.
    pub options: SelectionOptions,
    /// Metadata sent with `Register`.
    pub info: ClientInfo,
}

/// Something the embedding application should know about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrontendEvent {
    /// Registered with the relay under this id.
    Connected(ClientId),
    /// The relay connection ended.
    Disconnected,
    /// The room view changed.
    View(ViewUpdate),
    /// A smoothed round-trip delay was published.
    Health(HealthReport),
    /// Retries are exhausted; answer with [`FrontendHandle::resolve_prompt`].
    RetryPrompt,
    /// The user asked for the local relay to be restarted.
    RestartServerRequested,
}

#[derive(Debug)]
enum FrontendCommand {
    Retarget(Target),
    ResolvePrompt(PromptChoice),
    Attach,
    Select(ClientId, SessionId),
    SetOptions(SelectionOptions),
    Send(Frame),
}

/// Controls a running front-end.
#[derive(Debug, Clone)]
pub struct FrontendHandle {
    commands: mpsc::UnboundedSender<FrontendCommand>,
}

impl FrontendHandle {
    /// Switch to another endpoint or room.
    pub fn retarget(&self, target: Target) {
        self.command(FrontendCommand::Retarget(target));
    }

    /// Answer a [`FrontendEvent::RetryPrompt`].
    pub fn resolve_prompt(&self, choice: PromptChoice) {
        self.command(FrontendCommand::ResolvePrompt(choice));
    }

    /// Take control of the room.
    pub fn attach(&self) {
        self.command(FrontendCommand::Attach);
    }

    /// Select a session.
    pub fn select(&self, client: ClientId, session: SessionId) {
        self.command(FrontendCommand::Select(client, session));
    }

    /// Replace the auto-selection options.
    pub fn set_options(&self, options: SelectionOptions) {
        self.command(FrontendCommand::SetOptions(options));
    }

    /// Send a frame to the relay. Dropped while disconnected.
    pub fn send(&self, frame: Frame) {
        self.command(FrontendCommand::Send(frame));
    }

    fn command(&self, command: FrontendCommand) {
        if self.commands.send(command).is_err() {
            log::debug!("[Frontend] Driver has stopped");
        }
    }
}

/// Start a front-end. It runs until `shutdown` is cancelled or every handle
/// is dropped.
pub fn spawn_frontend(
    config: FrontendConfig,
    shutdown: CancellationToken,
) -> (FrontendHandle, mpsc::UnboundedReceiver<FrontendEvent>, JoinHandle<()>) {
    let (command_tx, command_rx) = mpsc::unbounded_channel();
    let (event_tx, event_rx) = mpsc::unbounded_channel();
    let driver = Driver {
        supervisor: ReconnectSupervisor::new(config.target),
        view: FrontendView::new(config.options),
        heartbeat: HeartbeatMonitor::new(),
        info: config.info,
        events: event_tx,
    };
    let task = tokio::spawn(driver.run(command_rx, shutdown));
    (FrontendHandle { commands: command_tx }, event_rx, task)
}

/// How a connected session ended.
enum Exit {
    Closed,
    Shutdown,
    Next(Step),
}

struct Driver {
    supervisor: ReconnectSupervisor,
    view: FrontendView,
    heartbeat: HeartbeatMonitor,
    info: ClientInfo,
    events: mpsc::UnboundedSender<FrontendEvent>,
}

impl Driver {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<FrontendCommand>,
        shutdown: CancellationToken,
    ) {
        let mut step = self.supervisor.start();
        let mut pending: Option<(tokio::time::Instant, RetryTicket)> = None;

        loop {
            match std::mem::replace(&mut step, Step::Idle) {
                Step::Connect(target) => {
                    let attempt = tokio::select! {
                        () = shutdown.cancelled() => return,
                        result = self.connect(&target) => result,
                    };
                    match attempt {
                        Ok(registered) => {
                            match self.session(registered, &mut commands, &shutdown).await {
                                Exit::Shutdown => return,
                                Exit::Next(next) => {
                                    step = next;
                                    continue;
                                }
                                Exit::Closed => {}
                            }
                        }
                        Err(e) => log::warn!("[Frontend] {e:#}"),
                    }
                    let ticket = self.supervisor.on_disconnected();
                    pending = Some((tokio::time::Instant::now() + RECONNECT_DELAY, ticket));
                }
                Step::Prompt => self.emit(FrontendEvent::RetryPrompt),
                Step::Idle => {}
            }

            let deadline = pending.as_ref().map(|(at, _)| *at);
            tokio::select! {
                () = shutdown.cancelled() => return,
                () = sleep_until(deadline) => {
                    if let Some((_, ticket)) = pending.take() {
                        step = self.supervisor.fire(&ticket);
                    }
                }
                command = commands.recv() => match command {
                    None => return,
                    Some(FrontendCommand::Retarget(target)) => {
                        step = self.supervisor.retarget(target);
                    }
                    Some(FrontendCommand::ResolvePrompt(choice)) => {
                        if choice == PromptChoice::RestartServer && self.supervisor.is_prompting() {
                            self.emit(FrontendEvent::RestartServerRequested);
                        }
                        step = self.supervisor.resolve(choice);
                    }
                    Some(command) => self.handle_local(command),
                },
            }
        }
    }

    async fn connect(&self, target: &Target) -> anyhow::Result<Registered> {
        let url = room_url(&target.endpoint, &target.room);
        log::info!("[Frontend] Connecting to {url}");
        let identity = RegisterFrame::new(ClientRole::Web, self.info.clone());
        Connection::connect(&url, identity)
            .await
            .map_err(|e| anyhow::anyhow!("{url}: {e}"))
    }

    async fn session(
        &mut self,
        registered: Registered,
        commands: &mut mpsc::UnboundedReceiver<FrontendCommand>,
        shutdown: &CancellationToken,
    ) -> Exit {
        let Registered {
            connection,
            mut inbound,
            id,
        } = registered;
        self.supervisor.on_connected();
        log::info!("[Frontend] Registered as {id}");
        self.emit(FrontendEvent::Connected(id));

        let mut ping = tokio::time::interval(PING_INTERVAL);
        ping.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let exit = loop {
            tokio::select! {
                () = shutdown.cancelled() => break Exit::Shutdown,
                command = commands.recv() => match command {
                    None => break Exit::Shutdown,
                    Some(FrontendCommand::Retarget(target)) => {
                        match self.supervisor.retarget(target) {
                            Step::Idle => {}
                            next => break Exit::Next(next),
                        }
                    }
                    Some(FrontendCommand::Attach) => send(&connection, &Frame::Attach),
                    Some(FrontendCommand::Send(frame)) => send(&connection, &frame),
                    Some(command) => self.handle_local(command),
                },
                _ = ping.tick() => send(&connection, &Frame::Ping { ts: now_ms() }),
                frame = inbound.recv() => match frame {
                    None => break Exit::Closed,
                    Some(Frame::Pong { ts }) => {
                        let rtt = now_ms().saturating_sub(ts);
                        if let Some(report) = self.heartbeat.record(rtt as f64, Instant::now()) {
                            self.emit(FrontendEvent::Health(report));
                        }
                    }
                    Some(frame) => {
                        for update in self.view.apply(&frame) {
                            self.emit(FrontendEvent::View(update));
                        }
                    }
                },
            }
        };

        connection.close();
        self.view.on_disconnected();
        log::info!("[Frontend] Disconnected from relay");
        self.emit(FrontendEvent::Disconnected);
        exit
    }

    /// Commands that only touch local state.
    fn handle_local(&mut self, command: FrontendCommand) {
        match command {
            FrontendCommand::Select(client, session) => {
                let change = self.view.select(client, session);
                self.emit(FrontendEvent::View(ViewUpdate::Selection(change)));
            }
            FrontendCommand::SetOptions(options) => {
                let change = self.view.set_options(options);
                self.emit(FrontendEvent::View(ViewUpdate::Selection(change)));
            }
            FrontendCommand::ResolvePrompt(_) => {
                log::debug!("[Frontend] No prompt pending");
            }
            other => log::debug!("[Frontend] Not connected, dropping {other:?}"),
        }
    }

    fn emit(&self, event: FrontendEvent) {
        if self.events.send(event).is_err() {
            log::debug!("[Frontend] Event receiver dropped");
        }
    }
}

fn send(connection: &Connection, frame: &Frame) {
    if let Err(e) = connection.send(frame) {
        log::debug!("[Frontend] {} not sent: {e}", frame.name());
    }
}

async fn sleep_until(deadline: Option<tokio::time::Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
