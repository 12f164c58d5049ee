//! Front-end side of the relay.
//!
//! - [`FrontendView`] - registry, selection and attachment state built from
//!   relay frames
//! - [`supervisor`] - reconnection state machine with stale-timer guard
//! - [`heartbeat`] - round-trip smoothing and delay-surge detection
//! - [`spawn_frontend`] - the task tying them to a live relay connection

mod driver;
pub mod heartbeat;
pub mod supervisor;
mod view;

pub use driver::{spawn_frontend, FrontendConfig, FrontendEvent, FrontendHandle};
pub use heartbeat::{HealthReport, HeartbeatMonitor};
pub use supervisor::{ConnectionState, PromptChoice, ReconnectSupervisor, RetryTicket, Step, Target};
pub use view::{FrontendView, ViewUpdate};
