//! Unified event channel for the relay event loop.
//!
//! Accept tasks, per-connection reader tasks and bridge forwarders all send
//! through a single `mpsc::UnboundedSender<RelayEvent>`. The `select!` loop
//! in [`crate::server`] receives them and dispatches to the
//! [`crate::router::Router`], so every state mutation happens on one task.

// Rust guideline compliant 2026-02

use crate::protocol::{ClientDescriptor, ClientId, Frame, RegisterFrame, TransportKind};
use crate::transport::Connection;

/// Event delivered to the relay event loop.
#[derive(Debug)]
pub enum RelayEvent {
    /// A peer completed its `Register` handshake.
    PeerRegistered {
        /// Id allocated to the peer.
        id: ClientId,
        /// Room the peer joined.
        room: String,
        /// Link the peer arrived on.
        link: TransportKind,
        /// Its registration.
        register: RegisterFrame,
        /// Handle for sending to it.
        connection: Connection,
    },

    /// A frame from a registered peer.
    Frame {
        /// Sending peer.
        from: ClientId,
        /// Decoded frame.
        frame: Frame,
    },

    /// A registered peer's connection ended.
    PeerClosed {
        /// Peer that went away.
        id: ClientId,
    },

    /// A frame a bridge received from its remote room, for the USB client it
    /// mirrors.
    BridgeFrame {
        /// USB client the bridge belongs to.
        client: ClientId,
        /// Inbound frame, already normalized by the bridge.
        frame: Frame,
    },

    /// Operator request.
    Control(ControlCommand),
}

/// Operator requests, issued by the control surface embedding the relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlCommand {
    /// Ask every runtime client to republish its session list and resend the
    /// client list to every front-end.
    Reconnect,
    /// Rebind the WebSocket listener if its accept loop has stopped.
    RestartServer,
}

/// Side-channel notifications raised by the router on attach and detach.
#[derive(Debug, Clone, PartialEq)]
pub enum SideEvent {
    /// A peer registered.
    ClientConnected(ClientDescriptor),
    /// A peer went away.
    ClientDisconnected(ClientId),
}
