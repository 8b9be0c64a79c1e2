//! Repository statistics

use std::sync::atomic::{AtomicU64, Ordering};

use crate::stm::StmStats;

/// Live counters
#[derive(Debug, Default)]
pub struct RepoStats {
    pub commits: AtomicU64,
    pub replicated_ops: AtomicU64,
    pub replication_failures: AtomicU64,
    /// Commits that went through despite a post-commit replication or backup error
    pub replication_anomalies: AtomicU64,
    pub remote_loads: AtomicU64,
}

/// Point-in-time copy of the repository and engine counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RepoStatsSnapshot {
    pub commits: u64,
    pub replicated_ops: u64,
    pub replication_failures: u64,
    pub replication_anomalies: u64,
    pub remote_loads: u64,
    pub conflicts: u64,
    pub load_retries: u64,
    pub timeouts: u64,
}

impl RepoStats {
    pub fn snapshot(&self, stm: &StmStats) -> RepoStatsSnapshot {
        RepoStatsSnapshot {
            commits: self.commits.load(Ordering::Relaxed),
            replicated_ops: self.replicated_ops.load(Ordering::Relaxed),
            replication_failures: self.replication_failures.load(Ordering::Relaxed),
            replication_anomalies: self.replication_anomalies.load(Ordering::Relaxed),
            remote_loads: self.remote_loads.load(Ordering::Relaxed),
            conflicts: stm.conflicts.load(Ordering::Relaxed),
            load_retries: stm.load_retries.load(Ordering::Relaxed),
            timeouts: stm.timeouts.load(Ordering::Relaxed),
        }
    }
}
