//! Application-wide constants for tally-bridge.
//!
//! This module centralizes all magic numbers and protocol constants so the
//! two clients and the binary agree on them. Constants are grouped by domain.
//!
//! # Categories
//!
//! - **Timeouts**: connect and request timeouts
//! - **Polling & Heartbeat**: refresh and keep-alive intervals
//! - **Reconnection**: backoff schedule and attempt cap
//! - **vMix**: device ports and command strings
//! - **Relay**: server defaults and role identifier

use std::time::Duration;

// ============================================================================
// Timeouts
// ============================================================================

/// Time allowed for a TCP or WebSocket handshake before `ConnectTimeout`.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Request timeout for the vMix HTTP backup query.
pub const HTTP_BACKUP_TIMEOUT: Duration = Duration::from_secs(5);

/// How long `disconnect()` waits for a connection task to flush its
/// goodbye (e.g. `UNSUBSCRIBE TALLY`) before abandoning it.
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

// ============================================================================
// Polling & Heartbeat
// ============================================================================

/// Interval between full XML document requests on the persistent channel.
///
/// `SUBSCRIBE TALLY` pushes program/preview changes but not structural
/// changes (inputs added, renamed, removed), so the document is polled.
pub const XML_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Interval between backup XML queries over the vMix HTTP API.
pub const HTTP_BACKUP_INTERVAL: Duration = Duration::from_secs(30);

/// Interval between relay `ping` envelopes.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// Silence on the relay connection after which it is considered dead.
pub const LIVENESS_TIMEOUT: Duration = Duration::from_secs(60);

// ============================================================================
// Reconnection
// ============================================================================

/// First reconnect delay; doubled per attempt.
pub const RECONNECT_BASE_DELAY: Duration = Duration::from_millis(1000);

/// Upper bound on any single reconnect delay.
pub const RECONNECT_MAX_DELAY: Duration = Duration::from_millis(10_000);

/// Reconnect attempts before a client gives up.
pub const MAX_RECONNECT_ATTEMPTS: u32 = 5;

// ============================================================================
// vMix
// ============================================================================

/// Default vMix TCP API port.
pub const VMIX_TCP_PORT: u16 = 8099;

/// Default vMix HTTP web API port.
pub const VMIX_HTTP_PORT: u16 = 8088;

/// HTTP path returning the full XML state document.
pub const VMIX_HTTP_XML_PATH: &str = "/api/?Function=XML";

/// Closing tag that terminates an XML state document on the TCP stream.
pub const VMIX_DOCUMENT_END: &str = "</vmix>";

/// Largest XML document buffered before the stream is considered corrupt.
pub const MAX_DOCUMENT_BYTES: usize = 8 * 1024 * 1024;

/// Number of characters of the title used when no `shortTitle` is present.
pub const SHORT_TITLE_CHARS: usize = 10;

// ============================================================================
// Relay
// ============================================================================

/// Default relay WebSocket endpoint.
pub const DEFAULT_RELAY_URL: &str = "wss://returnfeed.net/ws/";

/// Role identifier sent in the `register` envelope.
pub const RELAY_ROLE: &str = "pd";

/// Capacity of each client's event broadcast channel.
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_values_are_reasonable() {
        assert_eq!(CONNECT_TIMEOUT, Duration::from_secs(10));
        assert!(HTTP_BACKUP_TIMEOUT < HTTP_BACKUP_INTERVAL);
        assert!(SHUTDOWN_GRACE < CONNECT_TIMEOUT);
    }

    #[test]
    fn test_poll_intervals_ordering() {
        // The persistent channel is polled more often than the backup channel
        assert!(XML_POLL_INTERVAL < HTTP_BACKUP_INTERVAL);
    }

    #[test]
    fn test_liveness_covers_two_heartbeats() {
        assert_eq!(LIVENESS_TIMEOUT, HEARTBEAT_INTERVAL * 2);
    }

    #[test]
    fn test_backoff_bounds() {
        assert!(RECONNECT_BASE_DELAY < RECONNECT_MAX_DELAY);
        assert!(MAX_RECONNECT_ATTEMPTS > 0);
    }
}
