use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::backoff::Backoff;

/// Overlay network configuration.
/// Exposed in `threeds.toml` under the `[p2p]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct P2pConfig {
    /// IP address the libp2p TCP listener binds to.
    /// Default: 0.0.0.0
    #[serde(default = "default_listen_address")]
    pub listen_address: String,

    /// libp2p TCP listener port (separate from the HTTP port). 0 picks a free port.
    /// Default: 4001
    #[serde(default = "default_port")]
    pub port: u16,

    /// Multiaddrs of bootstrap peers, each ending in `/p2p/<peer id>`.
    /// Relay client support is only enabled when this list is non-empty.
    #[serde(default)]
    pub bootstrap_peers: Vec<String>,

    /// Enable mDNS discovery on the local network.
    /// Default: true
    #[serde(default = "default_enable_mdns")]
    pub enable_mdns: bool,

    /// Maximum size of a gossipsub message, and of a direct payload, in bytes.
    /// Default: 1048576 (1 MiB)
    #[serde(default = "default_gossipsub_max_transmit_size")]
    pub gossipsub_max_transmit_size: usize,

    /// Timeout for a single connection attempt, in seconds.
    /// Default: 10
    #[serde(default = "default_connection_timeout_secs")]
    pub connection_timeout_secs: u64,

    /// First retry delay for peer connections, in seconds. Doubles per attempt.
    /// Default: 1
    #[serde(default = "default_backoff_initial_secs")]
    pub backoff_initial_secs: u64,

    /// Retrying stops once the next delay would exceed this, in seconds.
    /// Default: 60
    #[serde(default = "default_backoff_max_secs")]
    pub backoff_max_secs: u64,

    /// Interval between DHT refreshes run by the node, in seconds.
    /// Default: 300
    #[serde(default = "default_discovery_interval_secs")]
    pub discovery_interval_secs: u64,
}

impl Default for P2pConfig {
    fn default() -> Self {
        Self {
            listen_address: default_listen_address(),
            port: default_port(),
            bootstrap_peers: Vec::new(),
            enable_mdns: default_enable_mdns(),
            gossipsub_max_transmit_size: default_gossipsub_max_transmit_size(),
            connection_timeout_secs: default_connection_timeout_secs(),
            backoff_initial_secs: default_backoff_initial_secs(),
            backoff_max_secs: default_backoff_max_secs(),
            discovery_interval_secs: default_discovery_interval_secs(),
        }
    }
}

impl P2pConfig {
    pub fn connection_timeout(&self) -> Duration {
        Duration::from_secs(self.connection_timeout_secs)
    }

    pub fn backoff(&self) -> Backoff {
        Backoff::new(
            Duration::from_secs(self.backoff_initial_secs),
            Duration::from_secs(self.backoff_max_secs),
        )
    }

    pub fn discovery_interval(&self) -> Duration {
        Duration::from_secs(self.discovery_interval_secs)
    }
}

fn default_listen_address() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    4001
}
fn default_enable_mdns() -> bool {
    true
}
fn default_gossipsub_max_transmit_size() -> usize {
    1024 * 1024
}
fn default_connection_timeout_secs() -> u64 {
    10
}
fn default_backoff_initial_secs() -> u64 {
    1
}
fn default_backoff_max_secs() -> u64 {
    60
}
fn default_discovery_interval_secs() -> u64 {
    300
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_protocol_constants() {
        let config = P2pConfig::default();
        assert_eq!(config.connection_timeout(), Duration::from_secs(10));
        assert_eq!(config.backoff(), Backoff::default());
        assert!(config.bootstrap_peers.is_empty());
        assert!(config.enable_mdns);
    }

    #[test]
    fn test_partial_toml_section_fills_defaults() {
        let config: P2pConfig = serde_json::from_str(r#"{"port": 0, "enable_mdns": false}"#).unwrap();
        assert_eq!(config.port, 0);
        assert!(!config.enable_mdns);
        assert_eq!(config.listen_address, "0.0.0.0");
        assert_eq!(config.backoff_max_secs, 60);
    }
}
