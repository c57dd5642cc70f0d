//! Cluster connectivity configuration.

use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

use crate::address::HostPort;

/// Default cluster listen port.
pub const DEFAULT_LISTEN_PORT: u16 = 7600;

/// Default heartbeat emission interval.
pub const DEFAULT_HEARTBEAT_INTERVAL_MS: u64 = 2_000;

/// Default heartbeat silence timeout (3 missed beats).
pub const DEFAULT_HEARTBEAT_TIMEOUT_MS: u64 = 6_000;

/// Default bound on concurrent outbound dial attempts.
pub const DEFAULT_DIAL_CONCURRENCY: usize = 16;

/// Default maximum frame payload size.
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 10 * 1024 * 1024;

/// Default handshake deadline.
pub const DEFAULT_HANDSHAKE_TIMEOUT_MS: u64 = 3_000;

/// Default delay between join retries after a transport failure.
pub const DEFAULT_JOIN_RETRY_INTERVAL_MS: u64 = 500;

/// Default number of dial rounds a join performs before giving up.
pub const DEFAULT_MAX_JOIN_ATTEMPTS: usize = 10;

/// Configuration for a [`Cluster`](crate::Cluster) and its
/// [`Run`](crate::Run).
#[derive(Debug, Clone)]
pub struct ClusterConfig {
    /// Local addresses to bind the cluster listener on.
    pub bind: Vec<IpAddr>,
    /// Addresses advertised to peers during the handshake. Empty means
    /// derive from `bind` and the actual listen port.
    pub canonical: Vec<HostPort>,
    /// Cluster listen port. 0 picks an ephemeral port.
    pub listen_port: u16,
    /// Fixed source port for outbound dials. 0 means ephemeral. When fixed,
    /// the attempt table is what keeps simultaneous dials to one address
    /// apart, since the kernel cannot disambiguate the flows.
    pub client_port: u16,
    /// Interval between heartbeat frames on each live connection.
    pub heartbeat_interval: Duration,
    /// Inbound silence after which a connection is evicted. Must comfortably
    /// exceed `heartbeat_interval` so a single missed beat never evicts.
    pub heartbeat_timeout: Duration,
    /// Bound on concurrent outbound dial attempts across all joins.
    pub dial_concurrency: usize,
    /// Abort the handshake on a build-mode (release/debug) mismatch instead
    /// of warning.
    pub strict_build_mode: bool,
    /// Maximum accepted frame payload size.
    pub max_message_size: usize,
    /// Deadline for the whole preamble + identify + routing exchange.
    pub handshake_timeout: Duration,
    /// Delay between join retries after a transport-level failure.
    pub join_retry_interval: Duration,
    /// Number of dial rounds a join performs before giving up. Protocol and
    /// version failures never retry.
    pub max_join_attempts: usize,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            bind: vec![IpAddr::V4(Ipv4Addr::UNSPECIFIED)],
            canonical: Vec::new(),
            listen_port: DEFAULT_LISTEN_PORT,
            client_port: 0,
            heartbeat_interval: Duration::from_millis(DEFAULT_HEARTBEAT_INTERVAL_MS),
            heartbeat_timeout: Duration::from_millis(DEFAULT_HEARTBEAT_TIMEOUT_MS),
            dial_concurrency: DEFAULT_DIAL_CONCURRENCY,
            strict_build_mode: false,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            handshake_timeout: Duration::from_millis(DEFAULT_HANDSHAKE_TIMEOUT_MS),
            join_retry_interval: Duration::from_millis(DEFAULT_JOIN_RETRY_INTERVAL_MS),
            max_join_attempts: DEFAULT_MAX_JOIN_ATTEMPTS,
        }
    }
}

impl ClusterConfig {
    /// Convenience for tests and single-host deployments: bind loopback on
    /// an ephemeral port.
    pub fn loopback() -> Self {
        Self {
            bind: vec![IpAddr::V4(Ipv4Addr::LOCALHOST)],
            listen_port: 0,
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ClusterConfig::default();

        assert_eq!(config.bind, vec![IpAddr::V4(Ipv4Addr::UNSPECIFIED)]);
        assert!(config.canonical.is_empty());
        assert_eq!(config.listen_port, DEFAULT_LISTEN_PORT);
        assert_eq!(config.client_port, 0);
        assert_eq!(config.heartbeat_interval, Duration::from_millis(2_000));
        assert_eq!(config.heartbeat_timeout, Duration::from_millis(6_000));
        assert_eq!(config.dial_concurrency, 16);
        assert!(!config.strict_build_mode);
        assert_eq!(config.max_message_size, 10 * 1024 * 1024);
        assert_eq!(config.handshake_timeout, Duration::from_millis(3_000));
    }

    #[test]
    fn test_single_missed_heartbeat_never_evicts() {
        let config = ClusterConfig::default();
        assert!(config.heartbeat_timeout >= config.heartbeat_interval * 2);
    }

    #[test]
    fn test_loopback_config() {
        let config = ClusterConfig::loopback();
        assert_eq!(config.bind, vec![IpAddr::V4(Ipv4Addr::LOCALHOST)]);
        assert_eq!(config.listen_port, 0);
    }

    #[test]
    fn test_custom_config() {
        let config = ClusterConfig {
            dial_concurrency: 4,
            strict_build_mode: true,
            ..Default::default()
        };
        assert_eq!(config.dial_concurrency, 4);
        assert!(config.strict_build_mode);
        // Other fields keep defaults.
        assert_eq!(config.listen_port, DEFAULT_LISTEN_PORT);
    }
}
