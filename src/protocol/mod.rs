//! Wire protocol shared by runtime clients, front-ends and bridges.
//!
//! Every message is a JSON envelope:
//!
//! ```text
//! { "event": "Customized",
//!   "data": { "type": "CDP",
//!             "data": { "client_id": 3, "session_id": 1, "message": "..." },
//!             "sender": 7 } }
//! ```
//!
//! [`WireMessage`] is the raw envelope; [`Frame`] is the closed set of
//! shapes the relay understands. Decoding happens once, at the transport
//! boundary. Anything that does not match a known shape is rejected with a
//! [`FrameError`] and logged instead of being forwarded.

mod types;

pub use types::{
    ClientDescriptor, ClientId, ClientInfo, ClientRole, DeviceFingerprint, ProcessKind, Session,
    SessionId, TransportKind,
};

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::constants::{NO_SESSION_ID, TRANSFER_DATA_METHOD};
use crate::fragment::{FragmentEnvelope, FragmentError};

/// Envelope event names.
pub mod event {
    /// Peer announces its role and metadata.
    pub const REGISTER: &str = "Register";
    /// Relay assigns the peer its id.
    pub const REGISTERED: &str = "Registered";
    /// Front-end asks for the client list.
    pub const LIST_CLIENTS: &str = "ListClients";
    /// Relay publishes the client list.
    pub const CLIENT_LIST: &str = "ClientList";
    /// Session lists, CDP traffic and control notices.
    pub const CUSTOMIZED: &str = "Customized";
    /// Front-end requests exclusive control of its room.
    pub const ATTACH: &str = "Attach";
    /// Heartbeat request.
    pub const PING: &str = "Ping";
    /// Heartbeat reply.
    pub const PONG: &str = "Pong";
}

/// `type` tags inside `Customized` envelopes.
pub mod message_type {
    /// Runtime publishes its session list.
    pub const SESSION_LIST: &str = "SessionList";
    /// Synthetic acknowledgment; never echoed back over the relay.
    pub const APP: &str = "App";
    /// DevTools protocol traffic.
    pub const CDP: &str = "CDP";
    /// Relay asks a runtime to republish its session list.
    pub const LIST_SESSION: &str = "ListSession";
    /// Front-end now controls its room.
    pub const SYNC_ATTACHED: &str = "sync_attached";
    /// Front-end lost control of its room.
    pub const SYNC_UNATTACHED: &str = "sync_unattached";
}

/// Raw `{event, data}` envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireMessage {
    /// Event name.
    pub event: String,
    /// Event body.
    #[serde(default)]
    pub data: Value,
}

impl WireMessage {
    /// Build an envelope.
    pub fn new(event: impl Into<String>, data: Value) -> Self {
        Self {
            event: event.into(),
            data,
        }
    }

    /// Parse an envelope from text.
    pub fn parse(text: &str) -> Result<Self, FrameError> {
        serde_json::from_str(text).map_err(|e| FrameError::InvalidJson(e.to_string()))
    }

    /// Serialize to text.
    pub fn to_text(&self) -> String {
        json!({ "event": self.event, "data": self.data }).to_string()
    }
}

/// Errors raised while decoding a [`WireMessage`] into a [`Frame`].
#[derive(Debug, Clone, PartialEq)]
pub enum FrameError {
    /// Text was not a JSON envelope.
    InvalidJson(String),
    /// Event name is not part of the protocol.
    UnknownEvent(String),
    /// Known event with a body of the wrong shape.
    Malformed {
        /// Event being decoded.
        event: String,
        /// What was wrong.
        reason: String,
    },
    /// A `Lynx.transferData` message with unusable params.
    Fragment(FragmentError),
}

impl std::fmt::Display for FrameError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidJson(msg) => write!(f, "Invalid JSON envelope: {msg}"),
            Self::UnknownEvent(event) => write!(f, "Unknown event: {event}"),
            Self::Malformed { event, reason } => write!(f, "Malformed {event} frame: {reason}"),
            Self::Fragment(e) => write!(f, "Malformed fragment: {e}"),
        }
    }
}

impl std::error::Error for FrameError {}

/// Body of a `Register` frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegisterFrame {
    /// Runtime or front-end.
    #[serde(rename = "type")]
    pub role: ClientRole,
    /// Declared metadata.
    #[serde(default)]
    pub info: ClientInfo,
    /// Set by fake socket bridges registering on behalf of a USB client.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub bridged: bool,
}

impl RegisterFrame {
    /// A direct (non-bridged) registration.
    pub fn new(role: ClientRole, info: ClientInfo) -> Self {
        Self {
            role,
            info,
            bridged: false,
        }
    }

    /// How the relay should classify a peer that registered with this frame
    /// over `link`.
    pub fn transport(&self, link: TransportKind) -> TransportKind {
        if self.bridged {
            TransportKind::FakeSocket
        } else {
            link
        }
    }
}

/// A `Customized` frame other than a session list.
#[derive(Debug, Clone, PartialEq)]
pub struct CustomMessageFrame {
    /// The `type` tag (`CDP`, `App`, `sync_unattached`, ...).
    pub kind: String,
    /// Addressed (or originating) runtime client.
    pub client_id: ClientId,
    /// Session the message belongs to.
    pub session_id: SessionId,
    /// Payload; CDP messages are usually JSON text.
    pub message: Value,
    /// Peer that sent the frame.
    pub sender: ClientId,
    /// Other keys in the inner `data` object.
    pub extra: Map<String, Value>,
}

impl CustomMessageFrame {
    /// Build a frame with no extra keys.
    pub fn new(
        kind: impl Into<String>,
        client_id: ClientId,
        session_id: SessionId,
        message: Value,
        sender: ClientId,
    ) -> Self {
        Self {
            kind: kind.into(),
            client_id,
            session_id,
            message,
            sender,
            extra: Map::new(),
        }
    }

    /// A relay-originated control notice (`sync_unattached` and friends).
    pub fn notice(kind: &str, room: &str) -> Self {
        Self::new(
            kind,
            ClientId::UNADDRESSED,
            NO_SESSION_ID,
            json!({ "room": room }),
            ClientId::UNADDRESSED,
        )
    }

    /// The message as JSON, parsing it first if it was sent as text.
    pub fn message_json(&self) -> Option<Value> {
        match &self.message {
            Value::String(text) => serde_json::from_str(text).ok(),
            Value::Object(_) => Some(self.message.clone()),
            _ => None,
        }
    }

    /// Copy of this frame carrying `message`, keeping the text/object encoding
    /// the original used.
    pub fn with_message_json(&self, message: Value) -> Self {
        let message = if self.message.is_string() {
            Value::String(message.to_string())
        } else {
            message
        };
        Self {
            message,
            ..self.clone()
        }
    }

    /// CDP method of the message, if any.
    pub fn method(&self) -> Option<String> {
        self.message_json()?
            .get("method")
            .and_then(Value::as_str)
            .map(String::from)
    }

    fn to_data(&self) -> Value {
        let mut inner = self.extra.clone();
        inner.insert("client_id".into(), json!(self.client_id));
        inner.insert("session_id".into(), json!(self.session_id));
        inner.insert("message".into(), self.message.clone());
        json!({
            "type": self.kind,
            "data": Value::Object(inner),
            "sender": self.sender,
        })
    }
}

/// Runtime session snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionListFrame {
    /// Client owning the sessions.
    pub client_id: ClientId,
    /// Full snapshot (not a diff).
    pub sessions: Vec<Session>,
    /// Peer that sent the frame.
    pub sender: ClientId,
}

/// A `Lynx.transferData` fragment, kept alongside its original frame so it
/// can be forwarded unchanged.
#[derive(Debug, Clone, PartialEq)]
pub struct FragmentFrame {
    /// Frame as received.
    pub frame: CustomMessageFrame,
    /// Decoded fragment, keyed by the frame's session id.
    pub envelope: FragmentEnvelope,
}

/// Closed set of frames the relay understands.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    /// Peer registration.
    Register(RegisterFrame),
    /// Id assignment.
    Registered {
        /// Assigned id.
        id: ClientId,
    },
    /// Client list request.
    ListClients,
    /// Client list snapshot.
    ClientList(Vec<ClientDescriptor>),
    /// Session list snapshot.
    SessionList(SessionListFrame),
    /// Any other `Customized` frame.
    Custom(CustomMessageFrame),
    /// Template fragment.
    Fragment(FragmentFrame),
    /// Takeover request.
    Attach,
    /// Heartbeat request, echoing `ts`.
    Ping {
        /// Sender's clock in milliseconds.
        ts: i64,
    },
    /// Heartbeat reply.
    Pong {
        /// Timestamp copied from the ping.
        ts: i64,
    },
}

fn malformed(event: &str, reason: impl std::fmt::Display) -> FrameError {
    FrameError::Malformed {
        event: event.to_string(),
        reason: reason.to_string(),
    }
}

fn client_id_field(value: &Value, field: &str) -> Option<ClientId> {
    value.get(field).and_then(Value::as_i64).map(ClientId)
}

impl Frame {
    /// Decode an envelope.
    pub fn decode(msg: &WireMessage) -> Result<Self, FrameError> {
        let data = &msg.data;
        match msg.event.as_str() {
            event::REGISTER => serde_json::from_value(data.clone())
                .map(Self::Register)
                .map_err(|e| malformed(event::REGISTER, e)),
            event::REGISTERED => client_id_field(data, "id")
                .map(|id| Self::Registered { id })
                .ok_or_else(|| malformed(event::REGISTERED, "missing id")),
            event::LIST_CLIENTS => Ok(Self::ListClients),
            event::CLIENT_LIST => serde_json::from_value(data.clone())
                .map(Self::ClientList)
                .map_err(|e| malformed(event::CLIENT_LIST, e)),
            event::CUSTOMIZED => Self::decode_customized(data),
            event::ATTACH => Ok(Self::Attach),
            event::PING => data
                .get("ts")
                .and_then(Value::as_i64)
                .map(|ts| Self::Ping { ts })
                .ok_or_else(|| malformed(event::PING, "missing ts")),
            event::PONG => data
                .get("ts")
                .and_then(Value::as_i64)
                .map(|ts| Self::Pong { ts })
                .ok_or_else(|| malformed(event::PONG, "missing ts")),
            other => Err(FrameError::UnknownEvent(other.to_string())),
        }
    }

    fn decode_customized(data: &Value) -> Result<Self, FrameError> {
        let kind = data
            .get("type")
            .and_then(Value::as_str)
            .ok_or_else(|| malformed(event::CUSTOMIZED, "missing type"))?;
        let Some(Value::Object(inner)) = data.get("data") else {
            return Err(malformed(event::CUSTOMIZED, "missing data object"));
        };
        let sender = client_id_field(data, "sender").unwrap_or(ClientId::UNADDRESSED);

        let mut extra = inner.clone();
        let client_id = extra
            .remove("client_id")
            .and_then(|v| v.as_i64())
            .map_or(ClientId::UNADDRESSED, ClientId);
        let session_id = extra
            .remove("session_id")
            .and_then(|v| v.as_i64())
            .unwrap_or(NO_SESSION_ID);
        let message = extra.remove("message").unwrap_or(Value::Null);

        if kind == message_type::SESSION_LIST {
            let sessions = serde_json::from_value(message)
                .map_err(|e| malformed(message_type::SESSION_LIST, e))?;
            return Ok(Self::SessionList(SessionListFrame {
                client_id,
                sessions,
                sender,
            }));
        }

        let frame = CustomMessageFrame {
            kind: kind.to_string(),
            client_id,
            session_id,
            message,
            sender,
            extra,
        };

        if let Some(json) = frame.message_json() {
            if json.get("method").and_then(Value::as_str) == Some(TRANSFER_DATA_METHOD) {
                let params = json.get("params").cloned().unwrap_or(Value::Null);
                let envelope = FragmentEnvelope::from_params(frame.session_id, &params)
                    .map_err(FrameError::Fragment)?;
                return Ok(Self::Fragment(FragmentFrame { frame, envelope }));
            }
        }

        Ok(Self::Custom(frame))
    }

    /// Encode back into an envelope.
    pub fn encode(&self) -> WireMessage {
        match self {
            Self::Register(register) => WireMessage::new(event::REGISTER, json!(register)),
            Self::Registered { id } => WireMessage::new(event::REGISTERED, json!({ "id": id })),
            Self::ListClients => WireMessage::new(event::LIST_CLIENTS, Value::Null),
            Self::ClientList(clients) => WireMessage::new(event::CLIENT_LIST, json!(clients)),
            Self::SessionList(list) => WireMessage::new(
                event::CUSTOMIZED,
                json!({
                    "type": message_type::SESSION_LIST,
                    "data": {
                        "client_id": list.client_id,
                        "session_id": NO_SESSION_ID,
                        "message": list.sessions,
                    },
                    "sender": list.sender,
                }),
            ),
            Self::Custom(frame) | Self::Fragment(FragmentFrame { frame, .. }) => {
                WireMessage::new(event::CUSTOMIZED, frame.to_data())
            }
            Self::Attach => WireMessage::new(event::ATTACH, Value::Null),
            Self::Ping { ts } => WireMessage::new(event::PING, json!({ "ts": ts })),
            Self::Pong { ts } => WireMessage::new(event::PONG, json!({ "ts": ts })),
        }
    }

    /// Short name for logging.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Register(_) => "Register",
            Self::Registered { .. } => "Registered",
            Self::ListClients => "ListClients",
            Self::ClientList(_) => "ClientList",
            Self::SessionList(_) => "SessionList",
            Self::Custom(_) => "Custom",
            Self::Fragment(_) => "Fragment",
            Self::Attach => "Attach",
            Self::Ping { .. } => "Ping",
            Self::Pong { .. } => "Pong",
        }
    }
}
