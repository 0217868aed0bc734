//! Constants for the support desk frontend
//!
//! Defaults here are the single source of truth; `RealtimeConfig` and
//! `RetryPolicy` read them in their `Default` impls.

// Identity
pub const ANONYMOUS_USER_ID: &str = "anonymous";

// WebSocket close codes
pub const CLOSE_NORMAL: u16 = 1000;
pub const CLOSE_ABNORMAL: u16 = 1006;
/// Application-range code used when the client abandons a socket after a
/// failed send.
pub const CLOSE_SEND_FAILED: u16 = 4000;

// Realtime channel defaults
pub const DEFAULT_RECONNECT_BASE_MS: u32 = 1_000;
pub const DEFAULT_RECONNECT_CAP_MS: u32 = 30_000;
pub const DEFAULT_MAX_RECONNECT_ATTEMPTS: u32 = 10;
pub const DEFAULT_HEARTBEAT_INTERVAL_MS: u32 = 30_000;

// REST retry defaults
pub const DEFAULT_API_MAX_RETRIES: u32 = 3;
pub const DEFAULT_API_RETRY_BASE_MS: u32 = 500;
pub const DEFAULT_API_RETRY_CAP_MS: u32 = 8_000;

// Paths
pub const WS_PATH: &str = "/ws";
pub const API_PREFIX: &str = "/api";

// Identity headers used when no bearer token is configured
pub const HEADER_USER_ID: &str = "X-User-Id";
pub const HEADER_USER_TYPE: &str = "X-User-Type";
