// WebSocket channel: `GET /ws`, the auth handshake and the per-connection
// dispatch loop feeding the hub.

mod handler;
pub mod protocol;

use std::time::Duration;

pub use handler::{router, router_with_limits};

pub const HEARTBEAT_INTERVAL_MS: u64 = 30_000;
pub const HEARTBEAT_TIMEOUT_MS: u64 = 10_000;
pub const AUTH_TIMEOUT_MS: u64 = 10_000;
pub const MAX_FRAME_BYTES: usize = 65_536;

/// Timing and size limits for one relay socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WsLimits {
    /// Interval between server pings.
    pub heartbeat_interval: Duration,
    /// How long after a ping the client has to send anything back.
    pub heartbeat_timeout: Duration,
    /// Deadline for the `auth` frame after the upgrade.
    pub auth_timeout: Duration,
    pub max_frame_bytes: usize,
}

impl Default for WsLimits {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_millis(HEARTBEAT_INTERVAL_MS),
            heartbeat_timeout: Duration::from_millis(HEARTBEAT_TIMEOUT_MS),
            auth_timeout: Duration::from_millis(AUTH_TIMEOUT_MS),
            max_frame_bytes: MAX_FRAME_BYTES,
        }
    }
}
