//! Relay router.
//!
//! The router is the relay's message bus. It owns the [`Registry`], the
//! [`Arbiter`], the table of registered peers and the fake socket bridges,
//! and is only ever touched from the relay event loop.
//!
//! # Routing rules
//!
//! | from      | frame                 | action                                       |
//! |-----------|-----------------------|----------------------------------------------|
//! | runtime   | `SessionList`         | registry update, then every front-end in room |
//! | runtime   | `Custom` / `Fragment` | every front-end in room, plus its bridge     |
//! | front-end | `Custom` / `Fragment` | addressed runtime, only if sender is attached |
//! | front-end | `Attach`              | arbiter takeover, notices to both sides      |
//! | any       | `ListClients`         | reply with the room's client list            |
//! | any       | `Ping`                | reply `Pong`                                 |
//!
//! Frames of type `App` are never forwarded in either direction (see
//! [`is_app_echo`]). `client_id` and `sender` on forwarded frames are
//! rewritten from the transport-assigned id of the peer that sent them.

// Rust guideline compliant 2026-02

use std::collections::HashMap;

use serde_json::Value;
use tokio::sync::mpsc;

use crate::arbiter::{Arbiter, AttachmentState, Notice};
use crate::bridge::FakeSocketBridge;
use crate::constants::NO_SESSION_ID;
use crate::events::SideEvent;
use crate::protocol::{
    message_type, ClientDescriptor, ClientId, ClientRole, CustomMessageFrame, FragmentFrame,
    Frame, RegisterFrame, SessionListFrame, TransportKind,
};
use crate::registry::Registry;
use crate::transport::Connection;

/// Returns `true` for the synthetic `App` acknowledgment type.
///
/// Such frames are dropped instead of forwarded: relaying one back out over
/// the relay feeds it to the transport that produced it, which answers with
/// another and loops.
pub fn is_app_echo(frame: &CustomMessageFrame) -> bool {
    frame.kind == message_type::APP
}

/// A registered peer.
#[derive(Debug)]
struct Peer {
    descriptor: ClientDescriptor,
    room: String,
    connection: Connection,
}

/// Central message bus. See the module docs for the routing table.
#[derive(Debug)]
pub struct Router {
    registry: Registry,
    arbiter: Arbiter,
    peers: HashMap<ClientId, Peer>,
    bridges: HashMap<ClientId, FakeSocketBridge>,
    side_events: mpsc::UnboundedSender<SideEvent>,
}

impl Router {
    /// Create a router that reports attach/detach on `side_events`.
    pub fn new(side_events: mpsc::UnboundedSender<SideEvent>) -> Self {
        Self {
            registry: Registry::new(),
            arbiter: Arbiter::new(),
            peers: HashMap::new(),
            bridges: HashMap::new(),
            side_events,
        }
    }

    /// Runtime clients and their sessions.
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Attachment state per room.
    pub fn arbiter(&self) -> &Arbiter {
        &self.arbiter
    }

    /// Number of registered peers.
    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    /// Whether a bridge is attached for `client`.
    pub fn has_bridge(&self, client: ClientId) -> bool {
        self.bridges.contains_key(&client)
    }

    /// Add a peer that completed its handshake.
    pub fn attach_peer(
        &mut self,
        id: ClientId,
        room: String,
        link: TransportKind,
        register: RegisterFrame,
        connection: Connection,
    ) {
        let descriptor = ClientDescriptor {
            id,
            role: register.role,
            transport: register.transport(link),
            info: register.info,
        };
        log::info!(
            "[Router] {:?} client {id} joined room '{room}' via {:?}",
            descriptor.role,
            descriptor.transport
        );

        if let Err(e) = connection.send(&Frame::Registered { id }) {
            log::warn!("[Router] Could not confirm registration of {id}: {e}");
        }
        self.peers.insert(
            id,
            Peer {
                descriptor: descriptor.clone(),
                room: room.clone(),
                connection,
            },
        );

        match descriptor.role {
            ClientRole::Runtime => {
                self.registry.upsert_client(descriptor.clone());
                self.broadcast_client_list(&room);
            }
            ClientRole::Web => {
                let notices = self.arbiter.join(&room, id);
                self.send_notices(&room, notices);
                self.send_to(id, &Frame::ClientList(self.client_list(&room)));
                for client in self.runtime_ids_in(&room) {
                    let sessions = self.registry.sessions(client).to_vec();
                    if !sessions.is_empty() {
                        self.send_to(
                            id,
                            &Frame::SessionList(SessionListFrame {
                                client_id: client,
                                sessions,
                                sender: client,
                            }),
                        );
                    }
                }
            }
        }

        self.raise(SideEvent::ClientConnected(descriptor));
    }

    /// Remove a peer whose connection ended.
    ///
    /// Runtime clients lose their sessions and any bridge mirroring them;
    /// front-ends release their room.
    pub fn detach_peer(&mut self, id: ClientId) {
        let Some(peer) = self.peers.remove(&id) else {
            return;
        };
        peer.connection.close();
        log::info!("[Router] Client {id} left room '{}'", peer.room);

        if let Some(bridge) = self.bridges.remove(&id) {
            log::info!("[Router] Disconnecting bridge for client {id}");
            bridge.disconnect();
        }

        match peer.descriptor.role {
            ClientRole::Runtime => {
                self.registry.remove_client(id);
                self.broadcast_client_list(&peer.room);
            }
            ClientRole::Web => self.arbiter.leave(&peer.room, id),
        }

        self.raise(SideEvent::ClientDisconnected(id));
    }

    fn raise(&self, event: SideEvent) {
        if self.side_events.send(event).is_err() {
            log::debug!("[Router] No side-event listener");
        }
    }

    /// Mirror `client` into a remote room through `bridge`.
    pub fn attach_bridge(&mut self, client: ClientId, bridge: FakeSocketBridge) {
        if !self.peers.contains_key(&client) {
            log::debug!("[Router] Client {client} left before its bridge was attached");
            bridge.disconnect();
            return;
        }
        if let Some(previous) = self.bridges.insert(client, bridge) {
            previous.disconnect();
        }
    }

    /// Deliver a frame a bridge received for the client it mirrors.
    pub fn deliver_from_bridge(&mut self, client: ClientId, frame: Frame) {
        if let Frame::Custom(custom) | Frame::Fragment(FragmentFrame { frame: custom, .. }) = &frame
        {
            if is_app_echo(custom) {
                log::debug!("[Router] Dropping App frame from bridge of {client}");
                return;
            }
        }
        self.send_to(client, &frame);
    }

    /// Dispatch one frame from a registered peer.
    pub fn route(&mut self, from: ClientId, frame: Frame) {
        let Some(peer) = self.peers.get(&from) else {
            log::debug!("[Router] {} from unknown peer {from}", frame.name());
            return;
        };
        let role = peer.descriptor.role;
        let room = peer.room.clone();
        log::trace!("[Router] {from} ({role:?}) -> {}", frame.name());

        match (role, frame) {
            (_, Frame::Ping { ts }) => self.send_to(from, &Frame::Pong { ts }),
            (_, Frame::ListClients) => {
                self.send_to(from, &Frame::ClientList(self.client_list(&room)));
            }
            (_, Frame::Register(register)) => self.reregister(from, &room, register),
            (ClientRole::Runtime, Frame::SessionList(mut list)) => {
                list.client_id = from;
                list.sender = from;
                self.registry.replace_sessions(from, list.sessions);
                list.sessions = self.registry.sessions(from).to_vec();
                let frame = Frame::SessionList(list);
                self.emit_to_bridge(from, &frame);
                self.broadcast_to_frontends(&room, &frame);
            }
            (ClientRole::Runtime, Frame::Custom(custom)) => {
                if is_app_echo(&custom) {
                    log::debug!("[Router] Dropping App frame from runtime {from}");
                    return;
                }
                let frame = Frame::Custom(stamp(custom, from));
                self.emit_to_bridge(from, &frame);
                self.broadcast_to_frontends(&room, &frame);
            }
            (ClientRole::Runtime, Frame::Fragment(mut fragment)) => {
                if is_app_echo(&fragment.frame) {
                    log::debug!("[Router] Dropping App fragment from runtime {from}");
                    return;
                }
                fragment.frame = stamp(fragment.frame, from);
                let frame = Frame::Fragment(fragment);
                self.emit_to_bridge(from, &frame);
                self.broadcast_to_frontends(&room, &frame);
            }
            (ClientRole::Web, Frame::Custom(custom)) => {
                self.forward_to_runtime(from, &room, Frame::Custom(custom));
            }
            (ClientRole::Web, frame @ Frame::Fragment(_)) => {
                self.forward_to_runtime(from, &room, frame);
            }
            (ClientRole::Web, Frame::Attach) => {
                let notices = self.arbiter.attach(&room, from);
                self.send_notices(&room, notices);
            }
            (role, frame) => {
                log::debug!("[Router] Ignoring {} from {role:?} {from}", frame.name());
            }
        }
    }

    /// Ask every runtime client to republish its sessions and resend client
    /// lists to every front-end.
    pub fn rescan(&mut self) {
        let runtimes = self.registry.runtime_ids();
        log::info!("[Router] Rescanning {} runtime client(s)", runtimes.len());
        for id in runtimes {
            let request = CustomMessageFrame::new(
                message_type::LIST_SESSION,
                id,
                NO_SESSION_ID,
                Value::Null,
                ClientId::UNADDRESSED,
            );
            self.send_to(id, &Frame::Custom(request));
        }

        let mut rooms: Vec<String> = self.peers.values().map(|p| p.room.clone()).collect();
        rooms.sort();
        rooms.dedup();
        for room in rooms {
            self.broadcast_client_list(&room);
        }
    }

    /// Close every peer and bridge.
    pub fn shutdown(&mut self) {
        for (id, bridge) in self.bridges.drain() {
            log::debug!("[Router] Disconnecting bridge for client {id}");
            bridge.disconnect();
        }
        for (_, peer) in self.peers.drain() {
            peer.connection.close();
        }
        log::info!("[Router] All peers closed");
    }

    fn reregister(&mut self, from: ClientId, room: &str, register: RegisterFrame) {
        let Some(peer) = self.peers.get_mut(&from) else {
            return;
        };
        if peer.descriptor.role != register.role {
            log::warn!("[Router] Client {from} tried to change role; ignoring");
            return;
        }
        peer.descriptor.info.merge(register.info);
        if peer.descriptor.role == ClientRole::Runtime {
            let descriptor = peer.descriptor.clone();
            self.registry.upsert_client(descriptor);
            self.broadcast_client_list(room);
        }
    }

    fn forward_to_runtime(&mut self, from: ClientId, room: &str, frame: Frame) {
        let (Frame::Custom(custom) | Frame::Fragment(FragmentFrame { frame: custom, .. })) = &frame
        else {
            return;
        };
        if is_app_echo(custom) {
            log::debug!("[Router] Dropping App frame from front-end {from}");
            return;
        }
        if !self.arbiter.is_attached(room, from) {
            log::debug!("[Router] Front-end {from} is not attached to '{room}'; dropping write");
            return;
        }

        let target = custom.client_id;
        let deliverable = self.peers.get(&target).is_some_and(|p| {
            p.descriptor.role == ClientRole::Runtime && p.room == room
        });
        if !deliverable {
            log::warn!("[Router] No runtime client {target} in room '{room}'");
            return;
        }

        let frame = match frame {
            Frame::Custom(mut custom) => {
                custom.sender = from;
                Frame::Custom(custom)
            }
            Frame::Fragment(mut fragment) => {
                fragment.frame.sender = from;
                Frame::Fragment(fragment)
            }
            other => other,
        };
        self.send_to(target, &frame);
    }

    fn emit_to_bridge(&self, from: ClientId, frame: &Frame) {
        if let Some(bridge) = self.bridges.get(&from) {
            if let Err(e) = bridge.emit(frame.clone()) {
                log::debug!("[Router] Bridge for {from}: {e}");
            }
        }
    }

    fn client_list(&self, room: &str) -> Vec<ClientDescriptor> {
        self.runtime_ids_in(room)
            .into_iter()
            .filter_map(|id| self.registry.client(id))
            .map(|c| c.descriptor.clone())
            .collect()
    }

    fn runtime_ids_in(&self, room: &str) -> Vec<ClientId> {
        let mut ids: Vec<ClientId> = self
            .peers
            .values()
            .filter(|p| p.room == room && p.descriptor.role == ClientRole::Runtime)
            .map(|p| p.descriptor.id)
            .collect();
        ids.sort();
        ids
    }

    fn broadcast_client_list(&self, room: &str) {
        self.broadcast_to_frontends(room, &Frame::ClientList(self.client_list(room)));
    }

    fn broadcast_to_frontends(&self, room: &str, frame: &Frame) {
        for peer in self
            .peers
            .values()
            .filter(|p| p.room == room && p.descriptor.role == ClientRole::Web)
        {
            if let Err(e) = peer.connection.send(frame) {
                log::debug!("[Router] Send to {} failed: {e}", peer.descriptor.id);
            }
        }
    }

    fn send_notices(&self, room: &str, notices: Vec<Notice>) {
        for notice in notices {
            let kind = match notice.state {
                AttachmentState::Attached => message_type::SYNC_ATTACHED,
                AttachmentState::Unattached => message_type::SYNC_UNATTACHED,
                AttachmentState::Uninitialized => continue,
            };
            self.send_to(notice.to, &Frame::Custom(CustomMessageFrame::notice(kind, room)));
        }
    }

    fn send_to(&self, id: ClientId, frame: &Frame) {
        let Some(peer) = self.peers.get(&id) else {
            log::debug!("[Router] Dropping {} for departed client {id}", frame.name());
            return;
        };
        if let Err(e) = peer.connection.send(frame) {
            log::debug!("[Router] Send to {id} failed: {e}");
        }
    }
}

/// Stamp a runtime frame with the runtime's transport id.
fn stamp(mut frame: CustomMessageFrame, from: ClientId) -> CustomMessageFrame {
    frame.client_id = from;
    frame.sender = from;
    frame
}
