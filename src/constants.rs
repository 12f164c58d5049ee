//! Application-wide constants for the relay.
//!
//! This module centralizes the timing and sizing numbers the relay,
//! bridge and front-end driver agree on. Constants are grouped by domain.
//!
//! # Categories
//!
//! - **Transport**: handshake and frame limits
//! - **Fragments**: template transfer sizing
//! - **Reconnection**: retry delay and prompt threshold
//! - **Heartbeat**: ping cadence and delay classification

use std::time::Duration;

// ============================================================================
// Transport
// ============================================================================

/// Maximum time a connect attempt may spend on its handshake.
///
/// Covers the WebSocket upgrade on the client side and the `Register`
/// exchange on the server side. Attempts that exceed it are closed.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(2);

/// Maximum USB link frame payload size (16 MB).
pub const MAX_USB_FRAME_SIZE: u32 = 16 * 1024 * 1024;

/// Client id used on frames that must not reveal transport-assigned ids.
pub const UNADDRESSED_CLIENT_ID: i64 = -1;

/// Session id carried by frames that are not scoped to a session.
pub const NO_SESSION_ID: i64 = -1;

// ============================================================================
// Fragments
// ============================================================================

/// Payloads larger than this are split into template fragments.
pub const DEFAULT_FRAGMENT_THRESHOLD: usize = 1_024_000;

/// CDP method name carrying template fragments.
pub const TRANSFER_DATA_METHOD: &str = "Lynx.transferData";

/// CDP method that triggers a template download in the bridge.
pub const PAGE_RELOAD_METHOD: &str = "Page.reload";

/// Upper bound on a template download.
///
/// Inbound bridge delivery is held while a template downloads.
pub const TEMPLATE_FETCH_TIMEOUT: Duration = Duration::from_secs(10);

// ============================================================================
// Reconnection
// ============================================================================

/// Fixed delay before a front-end retries a lost relay connection.
pub const RECONNECT_DELAY: Duration = Duration::from_secs(3);

/// Retries spent in `Connecting` before the user is prompted.
pub const RETRIES_BEFORE_PROMPT: u32 = 3;

// ============================================================================
// Heartbeat
// ============================================================================

/// Interval between front-end pings.
pub const PING_INTERVAL: Duration = Duration::from_secs(2);

/// Number of round-trip samples averaged into one published value.
pub const HEALTH_WINDOW: usize = 5;

/// Published delays above this many milliseconds count as "large".
pub const LARGE_DELAY_MS: i64 = 5000;

/// Two large delays closer together than this raise a delay surge.
pub const DELAY_SURGE_WINDOW: Duration = Duration::from_secs(3);

// ============================================================================
// Defaults
// ============================================================================

/// Default WebSocket listen address.
pub const DEFAULT_WS_ADDR: &str = "127.0.0.1:19783";

/// Default USB (adb-forwarded TCP) listen address.
pub const DEFAULT_USB_ADDR: &str = "127.0.0.1:19784";

/// Default room for locally attached devices.
pub const DEFAULT_ROOM: &str = "local";
