//! Configuration for minisvc nodes

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Default config file looked up by [`Config::load`]
pub const DEFAULT_CONFIG_FILE: &str = "minisvc.toml";

/// Environment prefix for overrides (`MINISVC_NODE_ID`, `MINISVC_BIND_ADDR`, ...)
pub const ENV_PREFIX: &str = "MINISVC";

/// Node configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Node ID (unique identifier within the cluster)
    pub node_id: String,

    /// Bind address for the HTTP API
    #[serde(default = "default_bind_addr")]
    pub bind_addr: SocketAddr,

    /// Directory for persisted state (in-memory when unset)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_dir: Option<PathBuf>,

    /// Cluster members, this node included
    #[serde(default)]
    pub peers: Vec<PeerConfig>,

    /// Initial leader id; this node leads when it names itself
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub leader: Option<String>,

    /// Deadline for every peer call
    #[serde(default = "default_peer_timeout")]
    pub peer_timeout_ms: u64,

    /// Periodic heal on the leader (0 disables)
    #[serde(default)]
    pub heal_interval_secs: u64,

    /// Push changed mounts to followers after each write
    #[serde(default = "default_true")]
    pub replicate_on_write: bool,

    /// Replication flush interval
    #[serde(default = "default_replication_interval")]
    pub replication_interval_ms: u64,

    /// Maximum accepted request body (bundles travel base64-encoded)
    #[serde(default = "default_max_bundle_bytes")]
    pub max_bundle_bytes: usize,

    /// Logging level
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Bundle-less `/_` services the leader registers at startup
    #[serde(default)]
    pub internal_services: Vec<InternalServiceConfig>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InternalServiceConfig {
    pub mount: String,
    pub name: String,
    pub version: String,
}

/// A cluster member reachable over the internal channel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerConfig {
    pub id: String,
    pub url: String,
}

fn default_bind_addr() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 8529))
}
fn default_peer_timeout() -> u64 {
    5_000
}
fn default_true() -> bool {
    true
}
fn default_replication_interval() -> u64 {
    1_000
}
fn default_max_bundle_bytes() -> usize {
    64 * 1024 * 1024
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            node_id: "node-1".to_string(),
            bind_addr: default_bind_addr(),
            data_dir: None,
            peers: Vec::new(),
            leader: None,
            peer_timeout_ms: default_peer_timeout(),
            heal_interval_secs: 0,
            replicate_on_write: true,
            replication_interval_ms: default_replication_interval(),
            max_bundle_bytes: default_max_bundle_bytes(),
            log_level: default_log_level(),
            internal_services: Vec::new(),
        }
    }
}

impl Config {
    /// Load from `minisvc.toml` (if present) layered under `MINISVC_*`
    /// environment variables. Falls back to defaults when neither is set.
    pub fn load() -> crate::Result<Self> {
        Self::load_from(DEFAULT_CONFIG_FILE)
    }

    pub fn load_from(path: impl AsRef<std::path::Path>) -> crate::Result<Self> {
        let defaults = config::Config::try_from(&Config::default())
            .map_err(|e| crate::Error::InvalidConfig(e.to_string()))?;
        let settings = config::Config::builder()
            .add_source(defaults)
            .add_source(config::File::from(path.as_ref()).required(false))
            .add_source(config::Environment::with_prefix(ENV_PREFIX))
            .build()
            .map_err(|e| crate::Error::InvalidConfig(e.to_string()))?;
        let config: Config = settings
            .try_deserialize()
            .map_err(|e| crate::Error::InvalidConfig(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> crate::Result<()> {
        if self.node_id.trim().is_empty() {
            return Err(crate::Error::InvalidConfig("node_id cannot be empty".into()));
        }
        if self.peer_timeout_ms == 0 {
            return Err(crate::Error::InvalidConfig(
                "peer_timeout_ms must be positive".into(),
            ));
        }
        let mut seen = std::collections::HashSet::new();
        for peer in &self.peers {
            if !seen.insert(peer.id.as_str()) {
                return Err(crate::Error::InvalidConfig(format!(
                    "duplicate peer id: {}",
                    peer.id
                )));
            }
        }
        for service in &self.internal_services {
            if !crate::common::is_internal_mount(&service.mount) {
                return Err(crate::Error::InvalidConfig(format!(
                    "internal service mount {} must start with /_",
                    service.mount
                )));
            }
        }
        if let Some(leader) = &self.leader {
            if leader != &self.node_id && !self.peers.iter().any(|p| &p.id == leader) {
                return Err(crate::Error::InvalidConfig(format!(
                    "leader {} is not a known peer",
                    leader
                )));
            }
        }
        Ok(())
    }

    pub fn peer_timeout(&self) -> Duration {
        Duration::from_millis(self.peer_timeout_ms)
    }

    pub fn heal_interval(&self) -> Option<Duration> {
        (self.heal_interval_secs > 0).then(|| Duration::from_secs(self.heal_interval_secs))
    }

    pub fn replication_interval(&self) -> Duration {
        Duration::from_millis(self.replication_interval_ms)
    }
}
