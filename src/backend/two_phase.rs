//! Two-phase commit coordinator
//!
//! Drives prepare / commit / abort over a transport and writes the optional
//! synchronous backup once the peers have committed.

use std::sync::Arc;

use uuid::Uuid;

use crate::entity::{DataOp, Query, QueryResult};
use crate::error::{RepoError, Result};
use super::{Backend, BackendResult};

/// Message layer of a two-phase commit
pub trait TwoPhaseTransport: Send + Sync {
    fn name(&self) -> &str;

    /// Ask every participant to stage `ops`; `ok` only if all accepted
    fn prepare(&self, txn_id: Uuid, ops: &[DataOp]) -> Result<BackendResult>;

    fn commit(&self, txn_id: Uuid, ops: &[DataOp]) -> Result<()>;

    /// Best effort; participants also expire prepared transactions on their own
    fn abort(&self, txn_id: Uuid, ops: &[DataOp]);

    fn query(&self, entity_type: &str, query: &Query) -> Result<Option<QueryResult>>;
}

/// `Backend` running a two-phase commit over `T`
pub struct TwoPhaseBackend<T: TwoPhaseTransport> {
    transport: T,
    backup: Option<Arc<dyn Backend>>,
}

impl<T: TwoPhaseTransport> TwoPhaseBackend<T> {
    pub fn new(transport: T) -> Self {
        Self {
            transport,
            backup: None,
        }
    }

    /// Write every committed batch to `backup` as well
    pub fn with_backup(mut self, backup: Arc<dyn Backend>) -> Self {
        self.backup = Some(backup);
        self
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }
}

impl<T: TwoPhaseTransport> Backend for TwoPhaseBackend<T> {
    fn name(&self) -> &str {
        self.transport.name()
    }

    fn run(&self, ops: &[DataOp]) -> Result<BackendResult> {
        let txn_id = Uuid::new_v4();

        // Phase 1: Prepare
        let prepared = match self.transport.prepare(txn_id, ops) {
            Ok(res) => res,
            Err(e) => {
                tracing::warn!(%txn_id, error = %e, "prepare failed");
                self.transport.abort(txn_id, ops);
                return Ok(BackendResult::rejected(ops));
            }
        };

        if !prepared.ok {
            tracing::debug!(%txn_id, ops = ops.len(), "prepare rejected, aborting");
            self.transport.abort(txn_id, ops);
            return Ok(prepared);
        }

        // Phase 2: Commit
        if let Err(e) = self.transport.commit(txn_id, ops) {
            tracing::error!(%txn_id, error = %e, "commit failed after a successful prepare");
            return Err(match e {
                RepoError::Replication { .. } => e,
                other => RepoError::Replication {
                    during_commit: true,
                    reason: other.to_string(),
                },
            });
        }

        // Step 3: Synchronous backup
        if let Some(backup) = &self.backup {
            let written = backup.run(ops);
            match written {
                Ok(res) if res.ok => {}
                Ok(_) => {
                    return Err(RepoError::BackupWrite(format!(
                        "backup '{}' rejected the batch",
                        backup.name()
                    )))
                }
                Err(e) => return Err(RepoError::BackupWrite(e.to_string())),
            }
        }

        tracing::trace!(%txn_id, ops = ops.len(), "two-phase commit complete");
        Ok(BackendResult::success())
    }

    fn query(&self, entity_type: &str, query: &Query) -> Result<Option<QueryResult>> {
        let Some(backup) = &self.backup else {
            return self.transport.query(entity_type, query);
        };

        let (from_backup, from_peers) = crossbeam::scope(|scope| {
            let backup_handle = scope.spawn(move |_| backup.query(entity_type, query));
            let from_peers = self.transport.query(entity_type, query);
            let from_backup = backup_handle.join().unwrap_or_else(|_| {
                Err(RepoError::Protocol("backup query panicked".to_string()))
            });
            (from_backup, from_peers)
        })
        .map_err(|_| RepoError::Protocol("backend query scope panicked".to_string()))?;

        let mut parts = Vec::new();
        for answer in [from_backup, from_peers] {
            match answer {
                Ok(Some(res)) => parts.push(res),
                Ok(None) => {}
                Err(e) => tracing::warn!(entity_type, query = %query, error = %e, "query part failed"),
            }
        }
        Ok(QueryResult::merge(parts).map(QueryResult::dedup_by_version))
    }
}
