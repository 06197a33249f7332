//! Default configuration values.
//!
//! Centralized default constants for use across all crates.

// ============================================================================
// Listener Defaults
// ============================================================================

/// Default HTTP proxy listen port.
pub const DEFAULT_HTTP_PORT: u16 = 7890;
/// Default SOCKS5 listen port.
pub const DEFAULT_SOCKS_PORT: u16 = 7891;

// ============================================================================
// Relay Defaults
// ============================================================================

/// Default relay buffer size per direction.
pub const DEFAULT_RELAY_BUFFER_SIZE: usize = 16384;
/// Default idle timeout for a spliced connection in seconds.
pub const DEFAULT_RELAY_IDLE_TIMEOUT_SECS: u64 = 600;

// ============================================================================
// TCP Socket Defaults
// ============================================================================

/// Default TCP Keep-Alive interval in seconds.
pub const DEFAULT_TCP_KEEPALIVE_SECS: u64 = 300;
/// Default TCP_NODELAY (disable Nagle's algorithm for lower latency).
pub const DEFAULT_TCP_NO_DELAY: bool = true;

// ============================================================================
// Observability Defaults
// ============================================================================

/// Traffic meter aggregation period in seconds.
pub const DEFAULT_TRAFFIC_PERIOD_SECS: u64 = 1;
/// Per-subscriber log buffer capacity; the oldest records are dropped when a
/// subscriber falls this far behind.
pub const DEFAULT_LOG_SUBSCRIBER_BUFFER: usize = 128;

// ============================================================================
// File Names
// ============================================================================

/// Configuration file name inside the rudder home directory.
pub const CONFIG_FILE_NAME: &str = "config.ini";
/// GeoIP database file name inside the rudder home directory.
pub const MMDB_FILE_NAME: &str = "Country.mmdb";
