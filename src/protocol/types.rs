//! Identity and metadata types shared by the wire protocol and the registry.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::constants::UNADDRESSED_CLIENT_ID;

/// Transport-assigned client id.
///
/// The relay hands these out as peers register. `-1` is reserved for frames
/// that deliberately hide the originating id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClientId(pub i64);

impl ClientId {
    /// Sentinel for frames that came through a bridge rather than from a
    /// directly addressed client.
    pub const UNADDRESSED: Self = Self(UNADDRESSED_CLIENT_ID);

    /// Returns `true` for the [`Self::UNADDRESSED`] sentinel.
    pub fn is_unaddressed(self) -> bool {
        self == Self::UNADDRESSED
    }
}

impl std::fmt::Display for ClientId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Session (page/card) id, scoped to its owning client.
pub type SessionId = i64;

/// What a registered peer is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClientRole {
    /// A debuggable app process (native runtime or a bridge standing in for one).
    Runtime,
    /// A DevTools front-end.
    #[serde(alias = "frontend")]
    Web,
}

/// How a peer reaches the relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransportKind {
    /// USB link forwarded to a local TCP port.
    #[serde(rename = "usb")]
    Usb,
    /// Direct WebSocket connection.
    #[serde(rename = "websocket")]
    WebSocket,
    /// WebSocket connection opened by a fake socket bridge.
    #[serde(rename = "fake_socket")]
    FakeSocket,
}

/// Which process of the app a runtime client lives in.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessKind {
    /// The app's main process.
    #[default]
    Main,
    /// A background or child process.
    Child,
}

/// Stable identity of a physical device + app, independent of transport ids.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DeviceFingerprint {
    /// Identified by app id and device id.
    App {
        /// Application id.
        app_id: String,
        /// Device id.
        did: String,
    },
    /// Identified by a debug-router id.
    Router(String),
}

impl std::fmt::Display for DeviceFingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::App { app_id, did } => write!(f, "{app_id}@{did}"),
            Self::Router(id) => write!(f, "router:{id}"),
        }
    }
}

/// Metadata a client declares when it registers.
///
/// Unknown keys are preserved in `extra` so they survive a relay hop.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ClientInfo {
    /// Application id.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub app_id: Option<String>,
    /// Device id.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub did: Option<String>,
    /// Debug-router id, used when app id / device id are not reported.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub debug_router_id: Option<String>,
    /// Operating system type.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub os_type: Option<String>,
    /// Device model.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_model: Option<String>,
    /// App display name.
    #[serde(rename = "App", skip_serializing_if = "Option::is_none")]
    pub app_name: Option<String>,
    /// Runtime SDK version.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sdk_version: Option<String>,
    /// DevTool (LDT) version.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ldt_version: Option<String>,
    /// Network kind (wifi, usb, ...).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub network: Option<String>,
    /// Main or child process.
    pub process: ProcessKind,
    /// Any other declared metadata.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ClientInfo {
    /// Stable device identity, if the client reported one.
    ///
    /// App id + device id take precedence over the debug-router id.
    pub fn fingerprint(&self) -> Option<DeviceFingerprint> {
        match (&self.app_id, &self.did, &self.debug_router_id) {
            (Some(app_id), Some(did), _) => Some(DeviceFingerprint::App {
                app_id: app_id.clone(),
                did: did.clone(),
            }),
            (_, _, Some(router)) => Some(DeviceFingerprint::Router(router.clone())),
            _ => None,
        }
    }

    /// Merge a newer declaration into this one. Fields present in `newer` win.
    pub fn merge(&mut self, newer: ClientInfo) {
        fn take(slot: &mut Option<String>, value: Option<String>) {
            if value.is_some() {
                *slot = value;
            }
        }
        take(&mut self.app_id, newer.app_id);
        take(&mut self.did, newer.did);
        take(&mut self.debug_router_id, newer.debug_router_id);
        take(&mut self.os_type, newer.os_type);
        take(&mut self.device_model, newer.device_model);
        take(&mut self.app_name, newer.app_name);
        take(&mut self.sdk_version, newer.sdk_version);
        take(&mut self.ldt_version, newer.ldt_version);
        take(&mut self.network, newer.network);
        self.process = newer.process;
        self.extra.extend(newer.extra);
    }
}

/// Entry of a `ClientList` frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientDescriptor {
    /// Transport-assigned id.
    pub id: ClientId,
    /// Runtime or front-end.
    #[serde(rename = "type")]
    pub role: ClientRole,
    /// How the client is connected.
    pub transport: TransportKind,
    /// Declared metadata.
    #[serde(default)]
    pub info: ClientInfo,
}

/// A debuggable page/card hosted by a client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    /// Session id.
    #[serde(rename = "session_id")]
    pub id: SessionId,
    /// Page URL.
    #[serde(default)]
    pub url: String,
    /// Type tag (native, web, worker).
    #[serde(rename = "type", default)]
    pub kind: String,
    /// Screenshot, carried over between snapshots.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub screenshot: Option<String>,
    /// Engine type, carried over between snapshots.
    #[serde(rename = "engineType", default, skip_serializing_if = "Option::is_none")]
    pub engine_type: Option<String>,
}

impl Session {
    /// Convenience constructor used by tests and fixtures.
    pub fn new(id: SessionId, url: impl Into<String>) -> Self {
        Self {
            id,
            url: url.into(),
            kind: String::new(),
            screenshot: None,
            engine_type: None,
        }
    }
}
