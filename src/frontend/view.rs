//! A front-end's picture of its room.
//!
//! Clients that reach the room through a bridge are bound as room-derived
//! devices. The binding outlives the bridged client, so a device whose bridge
//! reconnects under a new id stays one entry. Bindings are dropped when the
//! relay connection is lost.

use std::collections::HashSet;

use crate::arbiter::AttachmentState;
use crate::protocol::{message_type, ClientId, DeviceFingerprint, Frame, SessionId, TransportKind};
use crate::registry::{ClientDiff, Registry, Selection, SelectionChange, SelectionOptions};

/// A change worth showing to the user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ViewUpdate {
    /// Clients were added, updated or removed.
    Clients(ClientDiff),
    /// The selected session changed.
    Selection(SelectionChange),
    /// This front-end gained or lost control of the room.
    Attachment(AttachmentState),
}

/// Registry, selection and attachment state, fed by relay frames.
#[derive(Debug)]
pub struct FrontendView {
    registry: Registry,
    selection: Selection,
    options: SelectionOptions,
    attachment: AttachmentState,
    bound: HashSet<DeviceFingerprint>,
}

impl FrontendView {
    /// Empty view using `options` for auto-selection.
    pub fn new(options: SelectionOptions) -> Self {
        Self {
            registry: Registry::new(),
            selection: Selection::new(),
            options,
            attachment: AttachmentState::Uninitialized,
            bound: HashSet::new(),
        }
    }

    /// Clients and sessions as last reported by the relay.
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Current selection.
    pub fn selection(&self) -> &Selection {
        &self.selection
    }

    /// Whether this front-end controls its room.
    pub fn attachment(&self) -> AttachmentState {
        self.attachment
    }

    /// Active selection options.
    pub fn options(&self) -> &SelectionOptions {
        &self.options
    }

    /// Apply one relay frame.
    pub fn apply(&mut self, frame: &Frame) -> Vec<ViewUpdate> {
        let mut updates = Vec::new();
        match frame {
            Frame::ClientList(list) => {
                let diff = self.registry.upsert_clients(list.clone());
                for bridged in list.iter().filter(|d| d.transport == TransportKind::FakeSocket) {
                    if let Some(fingerprint) = self.registry.bind_device(bridged.info.clone()) {
                        self.bound.insert(fingerprint);
                    }
                }
                for id in &diff.removed {
                    let change = self.selection.on_client_removed(*id);
                    if change != SelectionChange::Unchanged {
                        updates.push(ViewUpdate::Selection(change));
                    }
                }
                if !diff.is_empty() {
                    updates.push(ViewUpdate::Clients(diff));
                }
            }
            Frame::SessionList(list) => {
                if !self.registry.replace_sessions(list.client_id, list.sessions.clone()) {
                    log::debug!("[View] Sessions for unknown client {}", list.client_id);
                    return updates;
                }
                let change = self.selection.reconcile(
                    list.client_id,
                    self.registry.sessions(list.client_id),
                    &self.options,
                );
                if change != SelectionChange::Unchanged {
                    updates.push(ViewUpdate::Selection(change));
                }
            }
            Frame::Custom(custom) => {
                let state = match custom.kind.as_str() {
                    message_type::SYNC_ATTACHED => AttachmentState::Attached,
                    message_type::SYNC_UNATTACHED => AttachmentState::Unattached,
                    _ => return updates,
                };
                if state != self.attachment {
                    self.attachment = state;
                    updates.push(ViewUpdate::Attachment(state));
                }
            }
            _ => {}
        }
        updates
    }

    /// Select a session directly.
    pub fn select(&mut self, client: ClientId, session: SessionId) -> SelectionChange {
        self.selection.select(client, session)
    }

    /// Select `session` once it appears.
    pub fn request_focus(&mut self, client: ClientId, session: SessionId) {
        self.selection.request_focus(client, session);
    }

    /// Enter or leave exclusive debug mode.
    pub fn set_debug_mode(&mut self, on: bool) {
        self.selection.set_debug_mode(on);
    }

    /// Change the selection options and re-run auto-selection.
    pub fn set_options(&mut self, options: SelectionOptions) -> SelectionChange {
        self.options = options;
        let client = self.selection.client().or_else(|| {
            self.registry
                .clients()
                .filter(|c| !c.sessions.is_empty())
                .map(|c| c.id())
                .min()
        });
        match client {
            Some(client) => {
                self.selection
                    .reconcile(client, self.registry.sessions(client), &self.options)
            }
            None => SelectionChange::Unchanged,
        }
    }

    /// The relay connection was lost; control of the room is gone with it.
    pub fn on_disconnected(&mut self) {
        self.attachment = AttachmentState::Uninitialized;
        for fingerprint in self.bound.drain() {
            self.registry.unbind_device(&fingerprint);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{
        ClientDescriptor, ClientInfo, ClientRole, CustomMessageFrame, Session, SessionListFrame,
    };
    use crate::registry::DeviceClient;

    const C: ClientId = ClientId(1);

    fn descriptor(id: i64) -> ClientDescriptor {
        ClientDescriptor {
            id: ClientId(id),
            role: ClientRole::Runtime,
            transport: TransportKind::Usb,
            info: ClientInfo::default(),
        }
    }

    fn sessions(client: ClientId, list: Vec<Session>) -> Frame {
        Frame::SessionList(SessionListFrame {
            client_id: client,
            sessions: list,
            sender: client,
        })
    }

    fn auto_focus() -> SelectionOptions {
        SelectionOptions {
            auto_focus_latest: true,
            card_filter: None,
        }
    }

    #[test]
    fn test_auto_select_then_filter() {
        let mut view = FrontendView::new(auto_focus());
        view.apply(&Frame::ClientList(vec![descriptor(1)]));
        let updates = view.apply(&sessions(
            C,
            vec![Session::new(3, "b"), Session::new(5, "a")],
        ));
        assert_eq!(
            updates,
            vec![ViewUpdate::Selection(SelectionChange::Selected {
                client: C,
                session: 5
            })]
        );

        let change = view.set_options(SelectionOptions {
            auto_focus_latest: true,
            card_filter: Some("b".into()),
        });
        assert_eq!(change, SelectionChange::Selected { client: C, session: 3 });
    }

    #[test]
    fn test_removed_client_clears_selection() {
        let mut view = FrontendView::new(auto_focus());
        view.apply(&Frame::ClientList(vec![descriptor(1)]));
        view.apply(&sessions(C, vec![Session::new(1, "a")]));

        let updates = view.apply(&Frame::ClientList(Vec::new()));
        assert_eq!(updates[0], ViewUpdate::Selection(SelectionChange::Cleared));
        assert!(matches!(&updates[1], ViewUpdate::Clients(diff) if diff.removed == vec![C]));
        assert!(view.registry().sessions(C).is_empty());
        assert_eq!(view.selection().session(), None);
    }

    #[test]
    fn test_sessions_for_unknown_client_are_ignored() {
        let mut view = FrontendView::new(auto_focus());
        assert!(view.apply(&sessions(C, vec![Session::new(1, "a")])).is_empty());
        assert!(view.registry().is_empty());
    }

    #[test]
    fn test_attachment_notices() {
        let mut view = FrontendView::new(SelectionOptions::default());
        let attached =
            Frame::Custom(CustomMessageFrame::notice(message_type::SYNC_ATTACHED, "local"));
        let unattached =
            Frame::Custom(CustomMessageFrame::notice(message_type::SYNC_UNATTACHED, "local"));

        assert_eq!(
            view.apply(&attached),
            vec![ViewUpdate::Attachment(AttachmentState::Attached)]
        );
        assert!(view.apply(&attached).is_empty());
        assert_eq!(
            view.apply(&unattached),
            vec![ViewUpdate::Attachment(AttachmentState::Unattached)]
        );

        view.on_disconnected();
        assert_eq!(view.attachment(), AttachmentState::Uninitialized);
    }

    #[test]
    fn test_empty_client_does_not_block_auto_focus_elsewhere() {
        let mut view = FrontendView::new(auto_focus());
        view.apply(&Frame::ClientList(vec![descriptor(1), descriptor(2)]));

        assert!(view.apply(&sessions(ClientId(1), Vec::new())).is_empty());
        let updates = view.apply(&sessions(ClientId(2), vec![Session::new(7, "a")]));

        assert_eq!(
            updates,
            vec![ViewUpdate::Selection(SelectionChange::Selected {
                client: ClientId(2),
                session: 7
            })]
        );
        assert_eq!(view.selection().session(), Some(7));
    }

    fn bridged(id: i64) -> ClientDescriptor {
        ClientDescriptor {
            id: ClientId(id),
            role: ClientRole::Runtime,
            transport: TransportKind::FakeSocket,
            info: ClientInfo {
                app_id: Some("com.example.app".into()),
                did: Some("device-1".into()),
                ..ClientInfo::default()
            },
        }
    }

    #[test]
    fn test_bridged_device_survives_reconnect_under_new_id() {
        let fingerprint = DeviceFingerprint::App {
            app_id: "com.example.app".into(),
            did: "device-1".into(),
        };
        let mut view = FrontendView::new(SelectionOptions::default());

        view.apply(&Frame::ClientList(vec![bridged(4)]));
        assert_eq!(
            view.registry().selected_client(&fingerprint),
            Some(DeviceClient::Online(ClientId(4)))
        );

        view.apply(&Frame::ClientList(Vec::new()));
        assert_eq!(view.registry().selected_client(&fingerprint), Some(DeviceClient::Bound));

        view.apply(&Frame::ClientList(vec![bridged(9)]));
        assert_eq!(
            view.registry().selected_client(&fingerprint),
            Some(DeviceClient::Online(ClientId(9)))
        );
        assert_eq!(view.registry().devices().count(), 1);

        view.apply(&Frame::ClientList(Vec::new()));
        view.on_disconnected();
        assert!(view.registry().device(&fingerprint).is_none());
    }

    #[test]
    fn test_usb_clients_are_not_bound() {
        let mut view = FrontendView::new(SelectionOptions::default());
        let mut usb = bridged(3);
        usb.transport = TransportKind::Usb;
        view.apply(&Frame::ClientList(vec![usb]));
        view.apply(&Frame::ClientList(Vec::new()));
        assert_eq!(view.registry().devices().count(), 0);
    }
}
