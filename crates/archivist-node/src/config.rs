//! Configuration types for archivist-node.
//! Parsed from ~/.archivist/config.toml.

use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use archivist_protocol::DEFAULTS;
use archivist_replication::ReplicationConfig;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeConfig {
    #[serde(default)]
    pub node: NodeSection,
    #[serde(default)]
    pub network: NetworkSection,
    #[serde(default)]
    pub discovery: DiscoverySection,
    #[serde(default)]
    pub replication: ReplicationSection,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeSection {
    /// Fixed node id. Derived from the local IPv4 address when unset.
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default = "default_archive_dir")]
    pub archive_dir: String,
    #[serde(default = "default_capacity")]
    pub capacity_bytes: u64,
    /// "text" or "json".
    #[serde(default = "default_log_format")]
    pub log_format: String,
}

impl Default for NodeSection {
    fn default() -> Self {
        Self {
            id: None,
            archive_dir: default_archive_dir(),
            capacity_bytes: default_capacity(),
            log_format: default_log_format(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkSection {
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    /// Data port assumed for peers found by discovery.
    #[serde(default = "default_data_port")]
    pub peer_data_port: u16,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,
}

impl Default for NetworkSection {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            peer_data_port: default_data_port(),
            max_connections: default_max_connections(),
            connect_timeout_secs: default_connect_timeout(),
            idle_timeout_secs: default_idle_timeout(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoverySection {
    #[serde(default = "default_discovery_bind")]
    pub bind_addr: String,
    #[serde(default = "default_discovery_port")]
    pub port: u16,
    #[serde(default = "default_discovery_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_quick_timeout")]
    pub quick_timeout_secs: u64,
    /// Unicast probe targets ("host:port"). Replaces interface broadcast when set.
    #[serde(default)]
    pub targets: Vec<String>,
}

impl Default for DiscoverySection {
    fn default() -> Self {
        Self {
            bind_addr: default_discovery_bind(),
            port: default_discovery_port(),
            timeout_secs: default_discovery_timeout(),
            quick_timeout_secs: default_quick_timeout(),
            targets: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicationSection {
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_replication_idle")]
    pub idle_interval_secs: u64,
    #[serde(default = "default_no_peers")]
    pub no_peers_interval_secs: u64,
    #[serde(default = "default_target_copies")]
    pub target_copies: usize,
}

impl Default for ReplicationSection {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            idle_interval_secs: default_replication_idle(),
            no_peers_interval_secs: default_no_peers(),
            target_copies: default_target_copies(),
        }
    }
}

// Default value functions
fn default_archive_dir() -> String {
    "~/.archivist/archive".into()
}
fn default_capacity() -> u64 {
    DEFAULTS.capacity_bytes
}
fn default_log_format() -> String {
    "text".into()
}
fn default_listen_addr() -> String {
    format!("0.0.0.0:{}", DEFAULTS.data_port)
}
fn default_data_port() -> u16 {
    DEFAULTS.data_port
}
fn default_max_connections() -> usize {
    DEFAULTS.max_connections
}
fn default_connect_timeout() -> u64 {
    DEFAULTS.connect_timeout_secs
}
fn default_idle_timeout() -> u64 {
    DEFAULTS.idle_timeout_secs
}
fn default_discovery_bind() -> String {
    "0.0.0.0".into()
}
fn default_discovery_port() -> u16 {
    DEFAULTS.discovery_port
}
fn default_discovery_timeout() -> u64 {
    DEFAULTS.discovery_timeout_secs
}
fn default_quick_timeout() -> u64 {
    DEFAULTS.quick_discovery_timeout_secs
}
fn default_batch_size() -> usize {
    DEFAULTS.replication_batch_size
}
fn default_replication_idle() -> u64 {
    DEFAULTS.replication_idle_secs
}
fn default_no_peers() -> u64 {
    DEFAULTS.replication_no_peers_secs
}
fn default_target_copies() -> usize {
    DEFAULTS.target_copies
}

impl NodeConfig {
    /// Load config from file, or use defaults if missing.
    pub fn load_or_default(path: &Path) -> anyhow::Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            let config: NodeConfig = toml::from_str(&content)?;
            config.validate()?;
            Ok(config)
        } else {
            Ok(Self::default())
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        self.network.listen_addr.parse::<SocketAddr>().map_err(|e| {
            anyhow::anyhow!("network.listen_addr {:?}: {e}", self.network.listen_addr)
        })?;
        self.discovery_targets()?;
        if self.network.max_connections == 0 {
            anyhow::bail!("network.max_connections must be at least 1");
        }
        if self.replication.batch_size == 0 {
            anyhow::bail!("replication.batch_size must be at least 1");
        }
        if let Some(id) = &self.node.id {
            uuid::Uuid::parse_str(id).map_err(|e| anyhow::anyhow!("node.id {id:?}: {e}"))?;
        }
        Ok(())
    }

    pub fn discovery_targets(&self) -> anyhow::Result<Vec<SocketAddr>> {
        self.discovery
            .targets
            .iter()
            .map(|t| {
                t.parse::<SocketAddr>()
                    .map_err(|e| anyhow::anyhow!("discovery target {t:?}: {e}"))
            })
            .collect()
    }

    pub fn replication_config(&self) -> ReplicationConfig {
        ReplicationConfig {
            batch_size: self.replication.batch_size,
            idle_interval_secs: self.replication.idle_interval_secs,
            no_peers_interval_secs: self.replication.no_peers_interval_secs,
            target_copies: self.replication.target_copies,
        }
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.network.connect_timeout_secs)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.network.idle_timeout_secs)
    }
}
