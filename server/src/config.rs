use clap::Parser;
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::p2p::config::P2pConfig;

/// 3ds storage node
#[derive(Parser, Serialize, Deserialize, Clone, Debug)]
#[command(name = "threeds-server", version, about = "Decentralized 3D model storage node")]
pub struct Config {
    /// HTTP API port
    #[arg(long, env = "THREEDS_PORT", default_value = "8080")]
    pub port: u16,

    /// Bind address for the HTTP API
    #[arg(long, env = "THREEDS_BIND_ADDRESS", default_value = "0.0.0.0")]
    pub bind_address: String,

    /// Path to TOML config file
    #[arg(long, default_value = "./threeds.toml")]
    pub config: String,

    /// Enable structured JSON logging (for Docker/production)
    #[arg(long, env = "THREEDS_JSON_LOGS")]
    pub json_logs: bool,

    /// Output a commented TOML config template and exit
    #[arg(long)]
    pub generate_config: bool,

    /// Data directory for models, blocks and the node identity key
    #[arg(long, env = "THREEDS_DATA_DIR", default_value = "./data")]
    pub data_dir: String,

    /// Overlay network configuration (loaded from [p2p] section in TOML)
    #[arg(skip)]
    #[serde(default = "default_p2p_config")]
    pub p2p: Option<P2pConfig>,

    /// Model storage configuration (loaded from [storage] section in TOML)
    #[arg(skip)]
    #[serde(default)]
    pub storage: Option<StorageConfig>,
}

/// Configuration for chunked model storage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Chunk size in bytes, at most 5 MiB (default: 5242880)
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,

    /// Persist the model catalog to `catalog.json` so it survives restarts (default: false)
    #[serde(default)]
    pub persist_catalog: bool,

    /// Interval in seconds between maintenance runs (default: 3600 = 1 hour)
    #[serde(default = "default_maintenance_interval")]
    pub maintenance_interval_secs: u64,

    /// Maximum upload size in megabytes per model (default: 512)
    #[serde(default = "default_max_upload_size")]
    pub max_upload_size_mb: u32,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            persist_catalog: false,
            maintenance_interval_secs: default_maintenance_interval(),
            max_upload_size_mb: default_max_upload_size(),
        }
    }
}

impl StorageConfig {
    pub fn maintenance_interval(&self) -> Duration {
        Duration::from_secs(self.maintenance_interval_secs)
    }
}

fn default_chunk_size() -> usize {
    crate::storage::MAX_CHUNK_SIZE
}

fn default_maintenance_interval() -> u64 {
    3600
}

fn default_max_upload_size() -> u32 {
    512
}

fn default_p2p_config() -> Option<P2pConfig> {
    Some(P2pConfig::default())
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 8080,
            bind_address: "0.0.0.0".to_string(),
            config: "./threeds.toml".to_string(),
            json_logs: false,
            generate_config: false,
            data_dir: "./data".to_string(),
            p2p: Some(P2pConfig::default()),
            storage: None,
        }
    }
}

impl Config {
    /// Load config with layered precedence:
    /// built-in defaults < TOML file < env vars (THREEDS_*) < CLI args
    pub fn load() -> Result<Self, figment::Error> {
        let cli = Config::parse();
        let config_path = cli.config.clone();

        Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Toml::file(&config_path))
            .merge(Env::prefixed("THREEDS_"))
            .merge(Serialized::defaults(cli))
            .extract()
    }

    pub fn data_dir(&self) -> PathBuf {
        PathBuf::from(&self.data_dir)
    }

    pub fn p2p_config(&self) -> P2pConfig {
        self.p2p.clone().unwrap_or_default()
    }

    pub fn storage_config(&self) -> StorageConfig {
        self.storage.clone().unwrap_or_default()
    }
}

/// Generate a commented TOML config template
pub fn generate_config_template() -> String {
    r#"# 3ds Storage Node Configuration
# Place this file at ./threeds.toml or specify with --config <path>
# All settings can be overridden via environment variables (THREEDS_PORT, etc.)
# or CLI flags (--port, etc.)

# HTTP API port (default: 8080)
# port = 8080

# Bind address (default: 0.0.0.0, all interfaces)
# bind_address = "0.0.0.0"

# Enable structured JSON logging for Docker/production
# json_logs = false

# Data directory for models, blocks and the node identity key
# data_dir = "./data"

# ---- Overlay Network ----
# [p2p]

# libp2p TCP listener (separate from the HTTP port)
# listen_address = "0.0.0.0"
# port = 4001

# Bootstrap peers, each ending in /p2p/<peer id>.
# Relay client support is enabled only when this list is non-empty.
# bootstrap_peers = ["/ip4/203.0.113.10/tcp/4001/p2p/12D3KooW..."]

# Local network discovery via mDNS
# enable_mdns = true

# Max gossipsub message / direct payload size in bytes (1 MiB)
# gossipsub_max_transmit_size = 1048576

# Connection attempts: per-attempt timeout, then exponential backoff
# connection_timeout_secs = 10
# backoff_initial_secs = 1     # doubles after every failed attempt
# backoff_max_secs = 60        # give up once the next delay would exceed this

# Interval between DHT refreshes
# discovery_interval_secs = 300

# ---- Model Storage ----
# [storage]

# Chunk size in bytes (max 5 MiB)
# chunk_size = 5242880

# Keep the model catalog in <data_dir>/models/catalog.json across restarts
# persist_catalog = false

# Interval in seconds between maintenance runs (tombstone sweep, status log)
# maintenance_interval_secs = 3600

# Maximum upload size in megabytes per model
# max_upload_size_mb = 512
"#
    .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_toml_sections_layer_over_defaults() {
        let toml = r#"
            port = 9000
            [p2p]
            port = 0
            enable_mdns = false
            [storage]
            chunk_size = 1024
        "#;
        let config: Config = Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Toml::string(toml))
            .extract()
            .unwrap();

        assert_eq!(config.port, 9000);
        assert_eq!(config.data_dir, "./data");
        let p2p = config.p2p_config();
        assert_eq!(p2p.port, 0);
        assert!(!p2p.enable_mdns);
        assert_eq!(p2p.backoff_initial_secs, 1);
        let storage = config.storage_config();
        assert_eq!(storage.chunk_size, 1024);
        assert!(!storage.persist_catalog);
    }

    #[test]
    fn test_template_parses_as_toml() {
        let config: Config = Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Toml::string(&generate_config_template()))
            .extract()
            .unwrap();
        assert_eq!(config.port, 8080);
        assert_eq!(config.storage_config().chunk_size, 5 * 1024 * 1024);
    }
}
