//! Configuration for AtlasRepo
//!
//! Centralized configuration with sensible defaults.

use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{RepoError, Result};

/// One node of the static cluster topology
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerConfig {
    /// Node id, unique within the cluster (1-based by convention)
    pub id: u32,

    /// Peer transport address (host:port)
    pub addr: String,

    /// Optional synchronous backup store (path of a WAL backup file)
    pub backup: Option<PathBuf>,
}

impl PeerConfig {
    pub fn new(id: u32, addr: impl Into<String>) -> Self {
        Self {
            id,
            addr: addr.into(),
            backup: None,
        }
    }

    pub fn with_backup(mut self, path: impl Into<PathBuf>) -> Self {
        self.backup = Some(path.into());
        self
    }

    /// Parse a topology list: `1=127.0.0.1:7001,2=127.0.0.1:7002@/var/backup.wal`
    ///
    /// The order of the list is the order of the topology.
    pub fn parse_list(spec: &str) -> Result<Vec<PeerConfig>> {
        let mut peers = Vec::new();

        for part in spec.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            let (id, rest) = part.split_once('=').ok_or_else(|| {
                RepoError::Config(format!("peer entry '{}' must look like <id>=<addr>", part))
            })?;

            let id: u32 = id
                .trim()
                .parse()
                .map_err(|_| RepoError::Config(format!("invalid peer id in '{}'", part)))?;

            let peer = match rest.split_once('@') {
                Some((addr, backup)) => PeerConfig::new(id, addr.trim()).with_backup(backup.trim()),
                None => PeerConfig::new(id, rest.trim()),
            };
            peers.push(peer);
        }

        if peers.is_empty() {
            return Err(RepoError::Config("empty peer list".to_string()));
        }
        Ok(peers)
    }
}

/// Main configuration for an AtlasRepo node
#[derive(Debug, Clone)]
pub struct Config {
    // -------------------------------------------------------------------------
    // Cluster Topology
    // -------------------------------------------------------------------------
    /// Id of this node (must appear in `peers`)
    pub node_id: u32,

    /// Ordered cluster topology, this node included
    pub peers: Vec<PeerConfig>,

    /// Number of nodes owning each entity (clamped to the cluster size)
    pub replication_factor: u32,

    // -------------------------------------------------------------------------
    // Transaction Configuration
    // -------------------------------------------------------------------------
    /// Overall transaction timeout, including the 2PC round trip (milliseconds)
    pub transaction_timeout_ms: u64,

    /// Timeout for loads used by ownership (re)acquisition (milliseconds)
    pub query_load_timeout_ms: u64,

    /// Max cached (non-owned) queries kept per entity type
    pub cache_capacity: usize,

    // -------------------------------------------------------------------------
    // Two-Phase Commit Participant
    // -------------------------------------------------------------------------
    /// Prepared external transactions older than this are aborted (milliseconds)
    pub prepared_ttl_ms: u64,

    // -------------------------------------------------------------------------
    // Ownership Recovery
    // -------------------------------------------------------------------------
    /// Attempts before ownership loss is treated as fatal
    pub ownership_max_attempts: u32,

    /// Randomized backoff range between attempts (milliseconds)
    pub ownership_backoff_min_ms: u64,
    pub ownership_backoff_max_ms: u64,

    // -------------------------------------------------------------------------
    // Network Configuration
    // -------------------------------------------------------------------------
    /// TCP listen address for peer messages
    pub listen_addr: String,

    /// Max concurrent peer connections
    pub max_connections: usize,

    /// Connection read timeout (milliseconds)
    pub read_timeout_ms: u64,

    /// Connection write timeout (milliseconds)
    pub write_timeout_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            node_id: 1,
            peers: vec![PeerConfig::new(1, "127.0.0.1:7001")],
            replication_factor: 2,
            transaction_timeout_ms: 5000,
            query_load_timeout_ms: 5000,
            cache_capacity: 256,
            prepared_ttl_ms: 30_000,
            ownership_max_attempts: 15,
            ownership_backoff_min_ms: 500,
            ownership_backoff_max_ms: 1000,
            listen_addr: "127.0.0.1:7001".to_string(),
            max_connections: 1024,
            read_timeout_ms: 5000,
            write_timeout_ms: 5000,
        }
    }
}

impl Config {
    /// Create a new config builder
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::default()
    }

    /// Check topology and bounds
    pub fn validate(&self) -> Result<()> {
        if self.peers.is_empty() {
            return Err(RepoError::Config("topology has no peers".to_string()));
        }

        let mut seen = HashSet::new();
        for peer in &self.peers {
            if !seen.insert(peer.id) {
                return Err(RepoError::Config(format!("duplicate peer id {}", peer.id)));
            }
        }

        if !seen.contains(&self.node_id) {
            return Err(RepoError::Config(format!(
                "node id {} is not part of the topology",
                self.node_id
            )));
        }

        if self.replication_factor == 0 {
            return Err(RepoError::Config("replication factor must be >= 1".to_string()));
        }

        if self.ownership_backoff_min_ms > self.ownership_backoff_max_ms {
            return Err(RepoError::Config("ownership backoff range is inverted".to_string()));
        }

        if self.ownership_max_attempts == 0 {
            return Err(RepoError::Config("ownership attempts must be >= 1".to_string()));
        }

        Ok(())
    }

    /// This node's entry in the topology
    pub fn me(&self) -> Option<&PeerConfig> {
        self.peers.iter().find(|p| p.id == self.node_id)
    }

    /// Position of this node in the ordered topology
    pub fn position(&self) -> Option<u32> {
        self.peers
            .iter()
            .position(|p| p.id == self.node_id)
            .map(|p| p as u32)
    }

    /// Replication factor clamped to the cluster size
    pub fn effective_replicas(&self) -> u32 {
        self.replication_factor.clamp(1, self.peers.len().max(1) as u32)
    }

    pub fn transaction_timeout(&self) -> Duration {
        Duration::from_millis(self.transaction_timeout_ms)
    }

    pub fn query_load_timeout(&self) -> Duration {
        Duration::from_millis(self.query_load_timeout_ms)
    }

    pub fn prepared_ttl(&self) -> Duration {
        Duration::from_millis(self.prepared_ttl_ms)
    }
}

/// Builder for Config
#[derive(Default)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    /// Set this node's id
    pub fn node_id(mut self, id: u32) -> Self {
        self.config.node_id = id;
        self
    }

    /// Set the ordered cluster topology
    pub fn peers(mut self, peers: Vec<PeerConfig>) -> Self {
        self.config.peers = peers;
        self
    }

    /// Set the replication factor
    pub fn replication_factor(mut self, factor: u32) -> Self {
        self.config.replication_factor = factor;
        self
    }

    /// Set the transaction timeout (in milliseconds)
    pub fn transaction_timeout_ms(mut self, ms: u64) -> Self {
        self.config.transaction_timeout_ms = ms;
        self
    }

    /// Set the ownership load timeout (in milliseconds)
    pub fn query_load_timeout_ms(mut self, ms: u64) -> Self {
        self.config.query_load_timeout_ms = ms;
        self
    }

    /// Set the per-type cached query capacity
    pub fn cache_capacity(mut self, capacity: usize) -> Self {
        self.config.cache_capacity = capacity;
        self
    }

    /// Set the prepared transaction expiry (in milliseconds)
    pub fn prepared_ttl_ms(mut self, ms: u64) -> Self {
        self.config.prepared_ttl_ms = ms;
        self
    }

    /// Set the ownership recovery attempt budget
    pub fn ownership_max_attempts(mut self, attempts: u32) -> Self {
        self.config.ownership_max_attempts = attempts;
        self
    }

    /// Set the ownership recovery backoff range (in milliseconds)
    pub fn ownership_backoff_ms(mut self, min: u64, max: u64) -> Self {
        self.config.ownership_backoff_min_ms = min;
        self.config.ownership_backoff_max_ms = max;
        self
    }

    /// Set the TCP listen address
    pub fn listen_addr(mut self, addr: impl Into<String>) -> Self {
        self.config.listen_addr = addr.into();
        self
    }

    /// Set the maximum number of concurrent connections
    pub fn max_connections(mut self, count: usize) -> Self {
        self.config.max_connections = count;
        self
    }

    /// Set the read timeout (in milliseconds)
    pub fn read_timeout_ms(mut self, ms: u64) -> Self {
        self.config.read_timeout_ms = ms;
        self
    }

    /// Set the write timeout (in milliseconds)
    pub fn write_timeout_ms(mut self, ms: u64) -> Self {
        self.config.write_timeout_ms = ms;
        self
    }

    pub fn build(self) -> Config {
        self.config
    }
}
