//! Attachment arbitration.
//!
//! Each room has at most one attached front-end. Only the attached front-end
//! may send frames to the room's runtime clients. Others stay connected and
//! keep receiving, but are told they are unattached and must ask for a
//! takeover explicitly. Nothing here retries or re-attaches on its own.
//!
//! ```text
//! uninitialized ──join (empty room)──▶ attached ──other attaches──▶ unattached
//!                                        ▲                           │
//!                                        └───────── attach ──────────┘
//! ```

use std::collections::HashMap;

use crate::protocol::ClientId;

/// Attachment state of one front-end in one room.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttachmentState {
    /// Not yet decided (unknown peer or room).
    Uninitialized,
    /// This front-end controls the room.
    Attached,
    /// Another front-end controls the room, or control was released.
    Unattached,
}

/// A state change the router must tell a front-end about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Notice {
    /// Front-end to notify.
    pub to: ClientId,
    /// Its new state.
    pub state: AttachmentState,
}

#[derive(Debug, Default)]
struct Room {
    attached: Option<ClientId>,
    members: Vec<ClientId>,
}

/// Per-room single-writer arbitration.
#[derive(Debug, Default)]
pub struct Arbiter {
    rooms: HashMap<String, Room>,
}

impl Arbiter {
    /// Create an arbiter with no rooms.
    pub fn new() -> Self {
        Self::default()
    }

    /// A front-end connected to `room`.
    ///
    /// The first front-end in an empty room is attached; anyone joining an
    /// occupied room starts unattached.
    pub fn join(&mut self, room: &str, peer: ClientId) -> Vec<Notice> {
        let entry = self.rooms.entry(room.to_string()).or_default();
        if entry.members.contains(&peer) {
            return Vec::new();
        }

        let state = if entry.members.is_empty() && entry.attached.is_none() {
            entry.attached = Some(peer);
            AttachmentState::Attached
        } else {
            AttachmentState::Unattached
        };
        entry.members.push(peer);
        log::info!("[Arbiter] {peer} joined room '{room}' as {state:?}");
        vec![Notice { to: peer, state }]
    }

    /// Explicit takeover: `peer` becomes attached and the previous holder, if
    /// any, becomes unattached.
    pub fn attach(&mut self, room: &str, peer: ClientId) -> Vec<Notice> {
        let entry = self.rooms.entry(room.to_string()).or_default();
        if !entry.members.contains(&peer) {
            entry.members.push(peer);
        }
        if entry.attached == Some(peer) {
            return vec![Notice {
                to: peer,
                state: AttachmentState::Attached,
            }];
        }

        let mut notices = Vec::with_capacity(2);
        if let Some(previous) = entry.attached.replace(peer) {
            log::info!("[Arbiter] {peer} took over room '{room}' from {previous}");
            notices.push(Notice {
                to: previous,
                state: AttachmentState::Unattached,
            });
        } else {
            log::info!("[Arbiter] {peer} attached to room '{room}'");
        }
        notices.push(Notice {
            to: peer,
            state: AttachmentState::Attached,
        });
        notices
    }

    /// A front-end disconnected. The room is left without a holder; the
    /// remaining front-ends must attach explicitly.
    pub fn leave(&mut self, room: &str, peer: ClientId) {
        let Some(entry) = self.rooms.get_mut(room) else {
            return;
        };
        entry.members.retain(|m| *m != peer);
        if entry.attached == Some(peer) {
            entry.attached = None;
            log::info!("[Arbiter] {peer} released room '{room}'");
        }
        if entry.members.is_empty() {
            self.rooms.remove(room);
        }
    }

    /// Current state of `peer` in `room`.
    pub fn state(&self, room: &str, peer: ClientId) -> AttachmentState {
        match self.rooms.get(room) {
            Some(entry) if entry.attached == Some(peer) => AttachmentState::Attached,
            Some(entry) if entry.members.contains(&peer) => AttachmentState::Unattached,
            _ => AttachmentState::Uninitialized,
        }
    }

    /// Front-end currently attached to `room`.
    pub fn attached(&self, room: &str) -> Option<ClientId> {
        self.rooms.get(room).and_then(|r| r.attached)
    }

    /// Whether `peer` may write to `room`.
    pub fn is_attached(&self, room: &str, peer: ClientId) -> bool {
        self.attached(room) == Some(peer)
    }
}
