//! Configuration loading and validation.
//!
//! Settings come from three layers, later layers winning:
//!
//! 1. `relay.json` in the config directory (optional)
//! 2. `DEVTOOL_RELAY_*` environment variables
//! 3. Command-line flags applied by `main.rs`
//!
//! Room ids and endpoints may also arrive from query parameters, so the
//! shape checks here double as untrusted-input validation.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::{fs, path::PathBuf};
use tokio_tungstenite::tungstenite::http::Uri;

use crate::constants::{DEFAULT_FRAGMENT_THRESHOLD, DEFAULT_ROOM, DEFAULT_USB_ADDR, DEFAULT_WS_ADDR};

/// Maximum length of a room id.
const MAX_ROOM_LEN: usize = 64;

/// Remote room the fake socket bridge joins in CLI-only deployments.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct BridgeSettings {
    /// WebSocket endpoint of the remote relay (`ws://` or `wss://`).
    pub endpoint: String,
    /// Room to join on the remote relay.
    pub room: String,
}

/// Configuration for the relay server.
#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(default)]
pub struct RelayConfig {
    /// Listen address for front-ends and bridges.
    pub ws_addr: String,
    /// Listen address for USB-forwarded runtime clients. `None` disables it.
    pub usb_addr: Option<String>,
    /// Room that locally attached (USB) runtime clients belong to.
    pub room: String,
    /// Template payloads above this size are fragmented.
    pub fragment_threshold: usize,
    /// Directory searched for templates before downloading them.
    pub template_dir: Option<PathBuf>,
    /// Bridge every USB client into a remote room.
    pub bridge: Option<BridgeSettings>,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            ws_addr: DEFAULT_WS_ADDR.to_string(),
            usb_addr: Some(DEFAULT_USB_ADDR.to_string()),
            room: DEFAULT_ROOM.to_string(),
            fragment_threshold: DEFAULT_FRAGMENT_THRESHOLD,
            template_dir: None,
            bridge: None,
        }
    }
}

impl RelayConfig {
    /// Returns the configuration directory path, creating it if necessary.
    ///
    /// `DEVTOOL_RELAY_CONFIG_DIR` overrides the platform config dir.
    pub fn config_dir() -> Result<PathBuf> {
        let dir = if let Ok(dir) = std::env::var("DEVTOOL_RELAY_CONFIG_DIR") {
            PathBuf::from(dir)
        } else {
            dirs::config_dir()
                .context("Could not determine config directory")?
                .join("devtool-relay")
        };
        fs::create_dir_all(&dir)?;
        Ok(dir)
    }

    /// Loads configuration from file, with environment variable overrides.
    pub fn load() -> Result<Self> {
        let mut config = Self::load_from_file().unwrap_or_else(|e| {
            log::debug!("Using default relay config: {e:#}");
            Self::default()
        });
        config.apply_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    fn load_from_file() -> Result<Self> {
        let config_path = Self::config_dir()?.join("relay.json");
        if config_path.exists() {
            let content = fs::read_to_string(&config_path)
                .with_context(|| format!("Failed to read {}", config_path.display()))?;
            Ok(serde_json::from_str(&content)?)
        } else {
            anyhow::bail!("Config file not found")
        }
    }

    /// Apply `DEVTOOL_RELAY_*` overrides using `lookup` to read variables.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(addr) = lookup("DEVTOOL_RELAY_WS_ADDR") {
            self.ws_addr = addr;
        }

        if let Some(addr) = lookup("DEVTOOL_RELAY_USB_ADDR") {
            self.usb_addr = if addr.is_empty() { None } else { Some(addr) };
        }

        if let Some(room) = lookup("DEVTOOL_RELAY_ROOM") {
            self.room = room;
        }

        if let Some(dir) = lookup("DEVTOOL_RELAY_TEMPLATE_DIR") {
            self.template_dir = Some(PathBuf::from(dir));
        }

        if let Some(threshold) = lookup("DEVTOOL_RELAY_FRAGMENT_THRESHOLD") {
            match threshold.parse::<usize>() {
                Ok(value) => self.fragment_threshold = value,
                Err(e) => log::warn!("Ignoring DEVTOOL_RELAY_FRAGMENT_THRESHOLD={threshold}: {e}"),
            }
        }
    }

    /// Check every field that will be used as a room id, endpoint or size.
    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_room(&self.room)?;
        if self.fragment_threshold == 0 {
            return Err(ConfigError::ZeroThreshold);
        }
        if let Some(bridge) = &self.bridge {
            validate_endpoint(&bridge.endpoint)?;
            validate_room(&bridge.room)?;
        }
        Ok(())
    }
}

/// Rejected configuration or query input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// Room id has the wrong shape.
    InvalidRoom(String),
    /// Endpoint is not a `ws://`/`wss://` URI with a host.
    InvalidEndpoint(String),
    /// Fragment threshold must be positive.
    ZeroThreshold,
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidRoom(room) => write!(f, "Invalid room id: {room:?}"),
            Self::InvalidEndpoint(url) => write!(f, "Invalid WebSocket endpoint: {url:?}"),
            Self::ZeroThreshold => write!(f, "Fragment threshold must be greater than zero"),
        }
    }
}

impl std::error::Error for ConfigError {}

/// Validate a room id taken from config or a query parameter.
///
/// Accepts 1-64 characters of `[A-Za-z0-9_.-]`.
pub fn validate_room(room: &str) -> Result<(), ConfigError> {
    let valid = !room.is_empty()
        && room.len() <= MAX_ROOM_LEN
        && room
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'));
    if valid {
        Ok(())
    } else {
        Err(ConfigError::InvalidRoom(room.to_string()))
    }
}

/// Validate a WebSocket endpoint taken from config or a query parameter.
pub fn validate_endpoint(endpoint: &str) -> Result<(), ConfigError> {
    let invalid = || ConfigError::InvalidEndpoint(endpoint.to_string());
    let uri: Uri = endpoint.parse().map_err(|_parse_error| invalid())?;
    match (uri.scheme_str(), uri.host()) {
        (Some("ws" | "wss"), Some(host)) if !host.is_empty() => Ok(()),
        _ => Err(invalid()),
    }
}

/// Build the URL a peer uses to join `room` on the relay at `endpoint`.
///
/// Replaces any existing `room` query parameter.
pub fn room_url(endpoint: &str, room: &str) -> String {
    let (base, query) = endpoint.split_once('?').unwrap_or((endpoint, ""));
    let mut params: Vec<&str> = query
        .split('&')
        .filter(|p| !p.is_empty() && !p.starts_with("room="))
        .collect();
    let room_param = format!("room={room}");
    params.push(&room_param);
    format!("{base}?{}", params.join("&"))
}

/// Extract the `room` query parameter from a request path like `/ws?room=abc`.
pub fn room_from_query(path_and_query: &str) -> Option<&str> {
    let (_, query) = path_and_query.split_once('?')?;
    query
        .split('&')
        .find_map(|pair| pair.strip_prefix("room="))
        .filter(|room| !room.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_default_config() {
        let config = RelayConfig::default();
        assert_eq!(config.ws_addr, "127.0.0.1:19783");
        assert_eq!(config.usb_addr.as_deref(), Some("127.0.0.1:19784"));
        assert_eq!(config.room, "local");
        assert_eq!(config.fragment_threshold, 1_024_000);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_env_overrides() {
        let vars: HashMap<&str, &str> = [
            ("DEVTOOL_RELAY_WS_ADDR", "0.0.0.0:9000"),
            ("DEVTOOL_RELAY_USB_ADDR", ""),
            ("DEVTOOL_RELAY_ROOM", "device-7"),
            ("DEVTOOL_RELAY_FRAGMENT_THRESHOLD", "2048"),
        ]
        .into_iter()
        .collect();

        let mut config = RelayConfig::default();
        config.apply_overrides(|key| vars.get(key).map(ToString::to_string));

        assert_eq!(config.ws_addr, "0.0.0.0:9000");
        assert_eq!(config.usb_addr, None);
        assert_eq!(config.room, "device-7");
        assert_eq!(config.fragment_threshold, 2048);
    }

    #[test]
    fn test_bad_threshold_override_is_ignored() {
        let mut config = RelayConfig::default();
        config.apply_overrides(|key| {
            (key == "DEVTOOL_RELAY_FRAGMENT_THRESHOLD").then(|| "lots".to_string())
        });
        assert_eq!(config.fragment_threshold, 1_024_000);
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let config: RelayConfig = serde_json::from_str(r#"{"room": "lab"}"#).unwrap();
        assert_eq!(config.room, "lab");
        assert_eq!(config.ws_addr, "127.0.0.1:19783");
    }

    #[test]
    fn test_validate_room() {
        assert!(validate_room("local").is_ok());
        assert!(validate_room("a1_b-2.c").is_ok());
        assert!(validate_room("").is_err());
        assert!(validate_room("room with spaces").is_err());
        assert!(validate_room("<script>").is_err());
        assert!(validate_room(&"x".repeat(65)).is_err());
    }

    #[test]
    fn test_validate_endpoint() {
        assert!(validate_endpoint("ws://127.0.0.1:19783/ws").is_ok());
        assert!(validate_endpoint("wss://relay.example.com/ws?room=a").is_ok());
        assert!(validate_endpoint("http://relay.example.com").is_err());
        assert!(validate_endpoint("javascript:alert(1)").is_err());
        assert!(validate_endpoint("not a url").is_err());
    }

    #[test]
    fn test_validate_rejects_bad_bridge() {
        let config = RelayConfig {
            bridge: Some(BridgeSettings {
                endpoint: "ftp://nope".to_string(),
                room: "r".to_string(),
            }),
            ..RelayConfig::default()
        };
        assert_eq!(
            config.validate(),
            Err(ConfigError::InvalidEndpoint("ftp://nope".to_string()))
        );
    }

    #[test]
    fn test_room_url() {
        assert_eq!(room_url("ws://h:1/ws", "abc"), "ws://h:1/ws?room=abc");
        assert_eq!(
            room_url("ws://h:1/ws?room=old&x=1", "new"),
            "ws://h:1/ws?x=1&room=new"
        );
    }

    #[test]
    fn test_room_from_query() {
        assert_eq!(room_from_query("/ws?room=abc"), Some("abc"));
        assert_eq!(room_from_query("/ws?x=1&room=dev"), Some("dev"));
        assert_eq!(room_from_query("/ws?room="), None);
        assert_eq!(room_from_query("/ws"), None);
    }
}
