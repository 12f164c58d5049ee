//! Devtool Relay - debug-session relay for DevTools front-ends.
//!
//! Runtime clients (apps under debug, reached over USB or WebSocket) and
//! front-ends (DevTools UIs) meet in rooms on one relay. The relay keeps a
//! registry of clients and their sessions, lets exactly one front-end per
//! room drive the runtime, and can mirror local USB clients into a remote
//! relay room for CLI-only deployments.
//!
//! # Architecture
//!
//! - **Transport** - one `Connection` handle over WebSocket, USB-forwarded
//!   TCP or in-memory links
//! - **Router** - single event loop owning registry, arbiter and bridges
//! - **Bridge** - outbound fake socket into a remote room
//! - **Frontend** - view, reconnection supervisor and heartbeat
//!
//! # Modules
//!
//! - [`protocol`] - wire envelope and typed frames
//! - [`fragment`] - large payload fragmentation and reassembly
//! - [`registry`] - clients, devices, sessions and auto-selection
//! - [`server`] - listeners and the relay event loop
//! - [`config`] - configuration loading and validation

// Library modules
pub mod arbiter;
pub mod bridge;
pub mod events;
pub mod fragment;
pub mod frontend;
pub mod protocol;
pub mod registry;
pub mod router;
pub mod server;
pub mod transport;

pub mod config;
pub mod constants;

// Re-export commonly used types
pub use config::RelayConfig;
pub use protocol::{ClientId, Frame, WireMessage};
pub use router::Router;
pub use server::{RelayHandle, RelayServer};
