//! Configuration for Shardcache

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::types::NodeId;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ShardCacheConfig {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub master: MasterConfig,

    #[serde(default)]
    pub auxiliary: AuxiliaryConfig,

    #[serde(default)]
    pub coordination: CoordinationConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

impl ShardCacheConfig {
    pub fn from_file(path: &str) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| crate::Error::InvalidConfig(format!("Failed to read config: {}", e)))?;

        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> crate::Result<Self> {
        toml::from_str(content)
            .map_err(|e| crate::Error::InvalidConfig(format!("Failed to parse config: {}", e)))
    }

    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(addr) = std::env::var("SHARDCACHE_BIND_ADDRESS") {
            config.server.bind_address = addr;
        }
        if let Ok(port) = std::env::var("SHARDCACHE_PORT") {
            if let Ok(p) = port.parse() {
                config.server.port = p;
            }
        }
        if let Ok(level) = std::env::var("SHARDCACHE_LOG_LEVEL") {
            config.logging.level = level;
        }

        // Master
        if let Ok(servers) = std::env::var("SHARDCACHE_AUX_SERVERS") {
            config.master.aux_servers = parse_node_list(&servers);
        }
        if let Ok(replicas) = std::env::var("SHARDCACHE_REPLICAS") {
            if let Ok(r) = replicas.parse() {
                config.master.replicas = r;
            }
        }
        if let Ok(path) = std::env::var("SHARDCACHE_BACKUP_PATH") {
            config.master.backup_path = PathBuf::from(path);
        }

        // Auxiliary
        if let Ok(id) = std::env::var("SHARDCACHE_NODE_ID") {
            config.auxiliary.node_id = Some(id);
        }
        if let Ok(capacity) = std::env::var("SHARDCACHE_CAPACITY") {
            if let Ok(c) = capacity.parse() {
                config.auxiliary.capacity = c;
            }
        }
        if let Ok(dir) = std::env::var("SHARDCACHE_DATA_DIR") {
            config.auxiliary.snapshot_dir = PathBuf::from(dir);
        }
        if let Ok(master) = std::env::var("SHARDCACHE_MASTER_SERVER") {
            config.auxiliary.master_endpoint = master;
        }

        if std::env::var("SHARDCACHE_COORDINATION_ENABLED")
            .map(|v| v == "false")
            .unwrap_or(false)
        {
            config.coordination.enabled = false;
        }

        config
    }

    /// Validate settings needed by the master role
    pub fn validate_master(&self) -> crate::Result<()> {
        if self.master.replicas == 0 {
            return Err(crate::Error::InvalidConfig(
                "master.replicas must be at least 1".into(),
            ));
        }
        if self.master.aux_servers.is_empty() {
            return Err(crate::Error::InvalidConfig(
                "master.aux_servers must list at least one auxiliary".into(),
            ));
        }
        Ok(())
    }

    /// Validate settings needed by the auxiliary role
    pub fn validate_auxiliary(&self) -> crate::Result<()> {
        if self.auxiliary.capacity == 0 {
            return Err(crate::Error::InvalidConfig(
                "auxiliary.capacity must be at least 1".into(),
            ));
        }
        if self.auxiliary.master_endpoint.is_empty() {
            return Err(crate::Error::InvalidConfig(
                "auxiliary.master_endpoint must be set".into(),
            ));
        }
        Ok(())
    }

    /// This auxiliary's node id, `<hostname>:<port>` unless configured
    pub fn auxiliary_node_id(&self) -> NodeId {
        self.auxiliary.node_id.clone().unwrap_or_else(|| {
            let host = hostname::get()
                .map(|h| h.to_string_lossy().to_string())
                .unwrap_or_else(|_| "localhost".to_string());
            format!("{}:{}", host, self.server.port)
        })
    }
}

/// Split a comma separated `host:port` list, dropping blanks
pub fn parse_node_list(raw: &str) -> Vec<NodeId> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind_address: String,
    pub port: u16,
    pub request_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            port: 8080,
            request_timeout_secs: 15,
        }
    }
}

/// Routing tier configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MasterConfig {
    /// Statically known auxiliaries, probed for liveness
    pub aux_servers: Vec<NodeId>,
    /// Virtual points per node on the hash ring
    pub replicas: usize,
    /// Delay between two probes of the same auxiliary
    pub health_check_interval_secs: u64,
    /// Disaster-recovery backup file
    pub backup_path: PathBuf,
    /// Ceiling on rebalance workers per batch
    pub rebalance_workers: usize,
}

impl Default for MasterConfig {
    fn default() -> Self {
        Self {
            aux_servers: Vec::new(),
            replicas: crate::DEFAULT_REPLICAS,
            health_check_interval_secs: 5,
            backup_path: PathBuf::from("/data/backupCache.dat"),
            rebalance_workers: crate::MAX_REBALANCE_WORKERS,
        }
    }
}

/// Cache node configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuxiliaryConfig {
    /// Node id announced to the master (defaults to `<hostname>:<port>`)
    pub node_id: Option<NodeId>,
    /// LRU capacity in entries
    pub capacity: usize,
    /// Directory holding the periodic snapshot
    pub snapshot_dir: PathBuf,
    pub snapshot_interval_secs: u64,
    /// `host:port` of the master
    pub master_endpoint: String,
    /// Hand the full mapping to the master before shutting down
    pub handoff_on_shutdown: bool,
}

impl Default for AuxiliaryConfig {
    fn default() -> Self {
        Self {
            node_id: None,
            capacity: crate::DEFAULT_CAPACITY,
            snapshot_dir: PathBuf::from("/data"),
            snapshot_interval_secs: 10,
            master_endpoint: "localhost:8080".to_string(),
            handoff_on_shutdown: true,
        }
    }
}

impl AuxiliaryConfig {
    /// Per-node snapshot file inside `snapshot_dir`
    pub fn snapshot_path(&self, node_id: &str) -> PathBuf {
        let file = format!("{}-data.dat", node_id.replace([':', '/'], "_"));
        self.snapshot_dir.join(file)
    }
}

/// Coordination service layout
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinationConfig {
    pub enabled: bool,
    /// Root under which auxiliaries register
    pub auxiliaries_path: String,
    /// Root under which masters register (ephemeral)
    pub masters_path: String,
    /// Queue path for the topology lock
    pub lock_path: String,
}

impl Default for CoordinationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            auxiliaries_path: "/auxiliaries".to_string(),
            masters_path: "/masters".to_string(),
            lock_path: "/remove-auxes".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
        }
    }
}
