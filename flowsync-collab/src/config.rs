//! Runtime configuration for the collaboration server.

use std::path::PathBuf;
use std::time::Duration;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Maximum connections per workflow room
    pub max_clients_per_room: usize,
    /// Broadcast channel capacity per room
    pub broadcast_capacity: usize,
    /// Interval between server-initiated pings
    pub heartbeat_interval: Duration,
    /// Silence after which a connection (and its presence) is considered gone
    pub client_timeout: Duration,
    /// How long an empty room stays resident before eviction
    pub idle_grace: Duration,
    /// Interval of the checkpoint/maintenance loop
    pub checkpoint_interval: Duration,
    /// When false, live joins are refused; the facade still works
    pub collaboration_enabled: bool,
    /// RocksDB directory (None = in-memory store)
    pub storage_path: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            max_clients_per_room: 100,
            broadcast_capacity: 256,
            heartbeat_interval: Duration::from_secs(30),
            client_timeout: Duration::from_secs(30 * 60),
            idle_grace: Duration::from_secs(5 * 60),
            checkpoint_interval: Duration::from_secs(30),
            collaboration_enabled: true,
            storage_path: None,
        }
    }
}

impl ServerConfig {
    /// Short intervals and an ephemeral port, for tests.
    pub fn for_testing() -> Self {
        Self {
            bind_addr: "127.0.0.1:0".to_string(),
            broadcast_capacity: 64,
            heartbeat_interval: Duration::from_millis(200),
            client_timeout: Duration::from_secs(5),
            idle_grace: Duration::from_millis(50),
            checkpoint_interval: Duration::from_millis(50),
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_values() {
        let config = ServerConfig::default();
        assert_eq!(config.bind_addr, "127.0.0.1:9090");
        assert_eq!(config.max_clients_per_room, 100);
        assert_eq!(config.broadcast_capacity, 256);
        assert_eq!(config.heartbeat_interval, Duration::from_secs(30));
        assert_eq!(config.client_timeout, Duration::from_secs(1800));
        assert!(config.collaboration_enabled);
        assert!(config.storage_path.is_none());
    }

    #[test]
    fn test_testing_config_keeps_limits() {
        let config = ServerConfig::for_testing();
        assert_eq!(config.max_clients_per_room, 100);
        assert!(config.checkpoint_interval < Duration::from_secs(1));
    }
}
