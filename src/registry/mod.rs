//! Client/session registry.
//!
//! The registry owns two indices:
//!
//! - `by_transport_id`: every live client, keyed by the id its transport
//!   assigned, with its declared metadata and current session snapshot.
//! - `by_device_fingerprint`: logical devices (app id + device id, or a
//!   debug-router id). Several transport ids may map to one device, e.g. a
//!   main process and a child process, or a device that reconnected and got a
//!   fresh id. Devices can also be *bound* from a room before any client with
//!   that fingerprint connects; those stay known but offline.
//!
//! Both indices are reconciled on every mutation so that each device has at
//! most one selected client.

mod selection;

pub use selection::{Selection, SelectionChange, SelectionOptions};

use std::collections::{BTreeSet, HashMap};

use crate::protocol::{
    ClientDescriptor, ClientId, ClientInfo, ClientRole, DeviceFingerprint, ProcessKind, Session,
};

/// A live client and its sessions.
#[derive(Debug, Clone, PartialEq)]
pub struct Client {
    /// Transport id, role, transport kind and metadata.
    pub descriptor: ClientDescriptor,
    /// Session snapshot, newest (highest id) first.
    pub sessions: Vec<Session>,
}

impl Client {
    fn new(descriptor: ClientDescriptor) -> Self {
        Self {
            descriptor,
            sessions: Vec::new(),
        }
    }

    /// Transport id.
    pub fn id(&self) -> ClientId {
        self.descriptor.id
    }
}

/// Which client currently represents a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceClient {
    /// A connected client.
    Online(ClientId),
    /// No client is connected; the device is only known from a room binding.
    Bound,
}

/// One logical device.
#[derive(Debug, Clone, PartialEq)]
pub struct Device {
    /// Stable identity.
    pub fingerprint: DeviceFingerprint,
    /// Connected clients sharing the fingerprint.
    pub clients: BTreeSet<ClientId>,
    /// Metadata from a room binding, if the device was synthesized from one.
    pub bound_info: Option<ClientInfo>,
    /// Client that represents the device right now.
    pub selected: Option<DeviceClient>,
}

/// Result of [`Registry::upsert_clients`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClientDiff {
    /// Ids seen for the first time.
    pub added: Vec<ClientId>,
    /// Ids already known whose metadata was merged.
    pub updated: Vec<ClientId>,
    /// Ids absent from the snapshot; their sessions were dropped.
    pub removed: Vec<ClientId>,
}

impl ClientDiff {
    /// True when nothing changed membership.
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

/// Process-wide view of clients, devices and sessions.
#[derive(Debug, Default)]
pub struct Registry {
    by_transport_id: HashMap<ClientId, Client>,
    by_device_fingerprint: HashMap<DeviceFingerprint, Device>,
}

impl Registry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply a full client-list snapshot.
    ///
    /// Unknown ids are created, known ids have their metadata merged, and ids
    /// absent from `list` are pruned together with their sessions.
    pub fn upsert_clients(&mut self, list: Vec<ClientDescriptor>) -> ClientDiff {
        let incoming: BTreeSet<ClientId> = list.iter().map(|d| d.id).collect();
        let mut removed: Vec<ClientId> = self
            .by_transport_id
            .keys()
            .filter(|id| !incoming.contains(id))
            .copied()
            .collect();
        removed.sort();
        for id in &removed {
            self.remove_client(*id);
        }

        let mut diff = ClientDiff {
            removed,
            ..ClientDiff::default()
        };
        for descriptor in list {
            let id = descriptor.id;
            if self.upsert_client(descriptor) {
                diff.added.push(id);
            } else {
                diff.updated.push(id);
            }
        }
        diff
    }

    /// Add or update one client. Returns `true` if it was new.
    pub fn upsert_client(&mut self, descriptor: ClientDescriptor) -> bool {
        let id = descriptor.id;
        let added = match self.by_transport_id.get_mut(&id) {
            Some(existing) => {
                let old_fingerprint = existing.descriptor.info.fingerprint();
                existing.descriptor.role = descriptor.role;
                existing.descriptor.transport = descriptor.transport;
                existing.descriptor.info.merge(descriptor.info);
                if old_fingerprint != existing.descriptor.info.fingerprint() {
                    if let Some(fingerprint) = old_fingerprint {
                        self.unlink(id, &fingerprint);
                    }
                }
                false
            }
            None => {
                self.by_transport_id.insert(id, Client::new(descriptor));
                true
            }
        };
        self.link(id);
        added
    }

    /// Remove a client and its sessions.
    pub fn remove_client(&mut self, id: ClientId) -> Option<Client> {
        let client = self.by_transport_id.remove(&id)?;
        if let Some(fingerprint) = client.descriptor.info.fingerprint() {
            self.unlink(id, &fingerprint);
        }
        Some(client)
    }

    /// Register a device known from a room binding (an "xdb" device).
    ///
    /// The device stays offline until a client with the same fingerprint
    /// connects, at which point the two are merged into one entry.
    pub fn bind_device(&mut self, info: ClientInfo) -> Option<DeviceFingerprint> {
        let fingerprint = info.fingerprint()?;
        let device = self
            .by_device_fingerprint
            .entry(fingerprint.clone())
            .or_insert_with(|| Device {
                fingerprint: fingerprint.clone(),
                clients: BTreeSet::new(),
                bound_info: None,
                selected: None,
            });
        match &mut device.bound_info {
            Some(existing) => existing.merge(info),
            None => device.bound_info = Some(info),
        }
        self.reselect(&fingerprint);
        Some(fingerprint)
    }

    /// Forget a room binding. The device disappears once no client uses it.
    pub fn unbind_device(&mut self, fingerprint: &DeviceFingerprint) {
        if let Some(device) = self.by_device_fingerprint.get_mut(fingerprint) {
            device.bound_info = None;
        }
        self.reselect(fingerprint);
    }

    /// Replace a client's session snapshot.
    ///
    /// Sessions are stored newest first. Screenshot and engine type carry over
    /// from the previous snapshot by session id when the new one omits them.
    /// Returns `false` if the client is unknown.
    pub fn replace_sessions(&mut self, id: ClientId, mut sessions: Vec<Session>) -> bool {
        let Some(client) = self.by_transport_id.get_mut(&id) else {
            return false;
        };

        let previous: HashMap<i64, &Session> = client.sessions.iter().map(|s| (s.id, s)).collect();
        for session in &mut sessions {
            if let Some(old) = previous.get(&session.id) {
                if session.screenshot.is_none() {
                    session.screenshot = old.screenshot.clone();
                }
                if session.engine_type.is_none() {
                    session.engine_type = old.engine_type.clone();
                }
            }
        }
        sessions.sort_by(|a, b| b.id.cmp(&a.id));
        client.sessions = sessions;
        true
    }

    /// Sessions of a client, newest first. Empty for unknown clients.
    pub fn sessions(&self, id: ClientId) -> &[Session] {
        self.by_transport_id
            .get(&id)
            .map(|c| c.sessions.as_slice())
            .unwrap_or_default()
    }

    /// Look up a client.
    pub fn client(&self, id: ClientId) -> Option<&Client> {
        self.by_transport_id.get(&id)
    }

    /// All clients.
    pub fn clients(&self) -> impl Iterator<Item = &Client> {
        self.by_transport_id.values()
    }

    /// Number of live clients.
    pub fn len(&self) -> usize {
        self.by_transport_id.len()
    }

    /// True when no client is live.
    pub fn is_empty(&self) -> bool {
        self.by_transport_id.is_empty()
    }

    /// Descriptors of all clients, sorted by id.
    pub fn descriptors(&self) -> Vec<ClientDescriptor> {
        let mut list: Vec<ClientDescriptor> = self
            .by_transport_id
            .values()
            .map(|c| c.descriptor.clone())
            .collect();
        list.sort_by_key(|d| d.id);
        list
    }

    /// Ids of runtime clients.
    pub fn runtime_ids(&self) -> Vec<ClientId> {
        let mut ids: Vec<ClientId> = self
            .by_transport_id
            .values()
            .filter(|c| c.descriptor.role == ClientRole::Runtime)
            .map(Client::id)
            .collect();
        ids.sort();
        ids
    }

    /// Look up a device.
    pub fn device(&self, fingerprint: &DeviceFingerprint) -> Option<&Device> {
        self.by_device_fingerprint.get(fingerprint)
    }

    /// All devices.
    pub fn devices(&self) -> impl Iterator<Item = &Device> {
        self.by_device_fingerprint.values()
    }

    /// Device a client belongs to.
    pub fn device_of(&self, id: ClientId) -> Option<&Device> {
        let fingerprint = self.by_transport_id.get(&id)?.descriptor.info.fingerprint()?;
        self.by_device_fingerprint.get(&fingerprint)
    }

    /// Client that currently represents `fingerprint`.
    pub fn selected_client(&self, fingerprint: &DeviceFingerprint) -> Option<DeviceClient> {
        self.by_device_fingerprint.get(fingerprint)?.selected
    }

    fn link(&mut self, id: ClientId) {
        let Some(fingerprint) = self
            .by_transport_id
            .get(&id)
            .filter(|c| c.descriptor.role == ClientRole::Runtime)
            .and_then(|c| c.descriptor.info.fingerprint())
        else {
            return;
        };
        self.by_device_fingerprint
            .entry(fingerprint.clone())
            .or_insert_with(|| Device {
                fingerprint: fingerprint.clone(),
                clients: BTreeSet::new(),
                bound_info: None,
                selected: None,
            })
            .clients
            .insert(id);
        self.reselect(&fingerprint);
    }

    fn unlink(&mut self, id: ClientId, fingerprint: &DeviceFingerprint) {
        if let Some(device) = self.by_device_fingerprint.get_mut(fingerprint) {
            device.clients.remove(&id);
        }
        self.reselect(fingerprint);
    }

    /// Pick the device's representative: online main process, then online
    /// child process, then the bound (offline) entry. Drops devices with
    /// neither clients nor a binding.
    fn reselect(&mut self, fingerprint: &DeviceFingerprint) {
        let Some(device) = self.by_device_fingerprint.get(fingerprint) else {
            return;
        };

        let process_of = |id: &ClientId| {
            self.by_transport_id
                .get(id)
                .map(|c| c.descriptor.info.process)
        };
        let main = device
            .clients
            .iter()
            .rev()
            .find(|id| process_of(id) == Some(ProcessKind::Main));
        let child = device
            .clients
            .iter()
            .rev()
            .find(|id| process_of(id) == Some(ProcessKind::Child));

        let selected = match (main, child, device.bound_info.is_some()) {
            (Some(id), _, _) | (None, Some(id), _) => Some(DeviceClient::Online(*id)),
            (None, None, true) => Some(DeviceClient::Bound),
            (None, None, false) => None,
        };

        if selected.is_none() {
            log::debug!("[Registry] Device {fingerprint} has no clients left");
            self.by_device_fingerprint.remove(fingerprint);
        } else if let Some(device) = self.by_device_fingerprint.get_mut(fingerprint) {
            device.selected = selected;
        }
    }
}
