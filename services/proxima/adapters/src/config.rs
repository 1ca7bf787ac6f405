//! Defaults shared by the adapter configuration types.
//!
//! All durations are plain millisecond counts so that configs stay
//! structurally comparable and map one-to-one onto the YAML file.

use std::time::Duration;

/// Default reconnect delay in milliseconds
pub const DEFAULT_RECONNECT_INTERVAL_MS: u64 = 5000;

/// Default WebSocket ping interval in milliseconds
pub const DEFAULT_PING_PONG_INTERVAL_MS: u64 = 5000;

/// Default HTTP long-poll interval in milliseconds
pub const DEFAULT_LONG_POLL_INTERVAL_MS: u64 = 5000;

/// Default request attempts for HTTP and GraphQL
pub const DEFAULT_RETRIES: u32 = 3;

/// Default delay between request attempts in milliseconds
pub const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 1000;

/// Default HTTP request timeout in milliseconds when none is configured
pub const DEFAULT_HTTP_TIMEOUT_MS: u64 = 30_000;

pub(crate) fn default_reconnect_interval_ms() -> u64 {
    DEFAULT_RECONNECT_INTERVAL_MS
}

pub(crate) fn default_ping_pong_interval_ms() -> u64 {
    DEFAULT_PING_PONG_INTERVAL_MS
}

pub(crate) fn default_long_poll_interval_ms() -> u64 {
    DEFAULT_LONG_POLL_INTERVAL_MS
}

pub(crate) fn default_retries() -> u32 {
    DEFAULT_RETRIES
}

pub(crate) fn default_true() -> bool {
    true
}

/// Milliseconds to a [`Duration`]
pub fn millis(ms: u64) -> Duration {
    Duration::from_millis(ms)
}
