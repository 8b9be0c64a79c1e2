//! Ownership Module
//!
//! Deterministic hash partitioning of entities over the cluster topology, and
//! the background loop that (re)acquires ownership of a query.
//!
//! ## Partition Function
//! ```text
//!   primary = crc32(key bytes) % nodes
//!   owners  = { (primary + i) % nodes | i in 0..replicas }
//! ```
//! Positions are indexes into the ordered topology, not node ids.

mod recovery;

pub use recovery::{
    default_fatal_hook, spawn_recovery, FatalHook, FatalOwnershipLoss, Reacquire, RecoveryPolicy,
};

use crate::config::Config;
use crate::entity::{KeyBytes, Query};

/// Whether the node at topology `position` owns `key`
pub fn is_owner(position: u32, key: &KeyBytes, nodes: u32, replicas: u32) -> bool {
    owners(key, nodes, replicas).contains(&position)
}

/// Topology positions owning `key`; always `replicas` entries (clamped to `nodes`)
pub fn owners(key: &KeyBytes, nodes: u32, replicas: u32) -> Vec<u32> {
    if nodes == 0 {
        return Vec::new();
    }
    let replicas = replicas.clamp(1, nodes);
    let primary = key.stable_hash() % nodes;
    (0..replicas).map(|i| (primary + i) % nodes).collect()
}

/// The query this node is authoritative for
///
/// A node with a backup store can serve any entity, so it owns everything.
pub fn ownership_query(config: &Config) -> Query {
    let has_backup = config.me().map_or(false, |me| me.backup.is_some());
    match config.position() {
        Some(position) if !has_backup => Query::partition(
            position,
            config.peers.len() as u32,
            config.effective_replicas(),
        ),
        _ => Query::All,
    }
}
