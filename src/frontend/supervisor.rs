//! Reconnection supervisor.
//!
//! State machine `Connecting -> Connected -> Unconnected -> Connecting`.
//! Lost connections are retried once per [`RECONNECT_DELAY`] through a
//! [`RetryTicket`] that captures the endpoint and room at the time of loss.
//! A ticket whose target has since changed does nothing when it fires.
//!
//! Retries made while still `Connecting` are counted. The first attempt is
//! not a retry; once [`RETRIES_BEFORE_PROMPT`] retries have failed the
//! supervisor stops and asks the user whether to keep retrying or restart
//! the local relay.
//!
//! [`RECONNECT_DELAY`]: crate::constants::RECONNECT_DELAY

// Rust guideline compliant 2026-02

use crate::constants::RETRIES_BEFORE_PROMPT;

/// Supervisor state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// A connect attempt is in flight, or a retry is due.
    Connecting,
    /// Registered with the relay.
    Connected,
    /// The connection was lost.
    Unconnected,
}

/// Where the front-end connects to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    /// WebSocket endpoint of the relay.
    pub endpoint: String,
    /// Room to join.
    pub room: String,
}

impl Target {
    /// Target for `room` on the relay at `endpoint`.
    pub fn new(endpoint: impl Into<String>, room: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            room: room.into(),
        }
    }
}

/// A scheduled retry, bound to the target it was scheduled for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryTicket {
    target: Target,
}

impl RetryTicket {
    /// Target captured when the retry was scheduled.
    pub fn target(&self) -> &Target {
        &self.target
    }
}

/// Answer to the retry prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromptChoice {
    /// Keep trying the same relay.
    KeepRetrying,
    /// Restart the local relay, then retry.
    RestartServer,
}

/// What the driver should do next.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    /// Open a connection to this target.
    Connect(Target),
    /// Stop and ask the user.
    Prompt,
    /// Nothing to do.
    Idle,
}

/// Tracks connection state and decides when to retry.
#[derive(Debug)]
pub struct ReconnectSupervisor {
    state: ConnectionState,
    target: Target,
    retry_count: u32,
    prompting: bool,
}

impl ReconnectSupervisor {
    /// Supervisor for `target`, not yet connecting.
    pub fn new(target: Target) -> Self {
        Self {
            state: ConnectionState::Unconnected,
            target,
            retry_count: 1,
            prompting: false,
        }
    }

    /// Current state.
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Live target.
    pub fn target(&self) -> &Target {
        &self.target
    }

    /// Attempt counter. Starts at 1 and resets to 1 on success.
    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    /// Whether a prompt is waiting for an answer.
    pub fn is_prompting(&self) -> bool {
        self.prompting
    }

    /// First connect.
    pub fn start(&mut self) -> Step {
        self.begin_connect()
    }

    /// Registration succeeded.
    pub fn on_connected(&mut self) {
        self.state = ConnectionState::Connected;
        self.retry_count = 1;
        self.prompting = false;
    }

    /// The connection closed, or the attempt failed. Returns the ticket to
    /// fire after the retry delay.
    pub fn on_disconnected(&mut self) -> RetryTicket {
        if self.state == ConnectionState::Connected {
            self.state = ConnectionState::Unconnected;
        }
        RetryTicket {
            target: self.target.clone(),
        }
    }

    /// The retry delay for `ticket` elapsed.
    pub fn fire(&mut self, ticket: &RetryTicket) -> Step {
        if ticket.target != self.target {
            log::debug!(
                "[Supervisor] Ignoring stale retry for {} room '{}'",
                ticket.target.endpoint,
                ticket.target.room
            );
            return Step::Idle;
        }
        if self.prompting || self.state == ConnectionState::Connected {
            return Step::Idle;
        }
        self.begin_connect()
    }

    /// Switch to a new endpoint or room. Connects immediately if it changed.
    pub fn retarget(&mut self, target: Target) -> Step {
        if target == self.target {
            return Step::Idle;
        }
        log::info!(
            "[Supervisor] Switching to {} room '{}'",
            target.endpoint,
            target.room
        );
        self.target = target;
        self.retry_count = 1;
        self.prompting = false;
        self.state = ConnectionState::Unconnected;
        self.begin_connect()
    }

    /// Answer the prompt. Either way the counter resets and a new attempt
    /// starts.
    pub fn resolve(&mut self, choice: PromptChoice) -> Step {
        if !self.prompting {
            return Step::Idle;
        }
        log::info!("[Supervisor] Prompt answered: {choice:?}");
        self.prompting = false;
        self.retry_count = 1;
        self.state = ConnectionState::Unconnected;
        self.begin_connect()
    }

    fn begin_connect(&mut self) -> Step {
        if self.state == ConnectionState::Connecting {
            self.retry_count += 1;
            // retry_count starts at 1 for the first attempt
            if self.retry_count > RETRIES_BEFORE_PROMPT + 1 {
                log::warn!(
                    "[Supervisor] {} unreachable after {} retries",
                    self.target.endpoint,
                    RETRIES_BEFORE_PROMPT
                );
                self.prompting = true;
                return Step::Prompt;
            }
        }
        self.state = ConnectionState::Connecting;
        Step::Connect(self.target.clone())
    }
}
