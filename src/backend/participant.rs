//! Two-phase commit participant
//!
//! The receiving side of replication: stages prepared operations as held-open
//! commits, finishes them on commit/abort, and answers peer queries.
//!
//! ## Pending Table
//! ```text
//!   Prepare(id, ops) ──► pending[id] = Staging ──► prepare_extern ──► pending[id] = Prepared
//!   Commit(id)       ──► pending.remove(id).commit()
//!   Abort(id)        ──► pending.remove(id).rollback()
//!   reaper           ──► roll back entries older than the TTL
//! ```
//!
//! The id is reserved before staging, so a second prepare with the same id
//! is refused while the first is still running.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use uuid::Uuid;

use crate::entity::{DataOp, Query, QueryResult};
use crate::error::Result;
use crate::network::PeerHandler;
use crate::protocol::{PeerRequest, PeerResponse};
use crate::repository::Repository;
use crate::stm::Continuation;
use super::Backend;

struct PendingTxn {
    continuation: Continuation,
    prepared_at: Instant,
}

enum Slot {
    /// Id reserved, operations still being staged
    Staging,
    Prepared(PendingTxn),
}

/// Handles 2PC and query messages for one repository
pub struct Participant {
    repo: Arc<Repository>,
    backup: Option<Arc<dyn Backend>>,
    pending: Mutex<HashMap<Uuid, Slot>>,
    ttl: Duration,
    /// Bound on staging one prepare; shorter than the coordinator's timeout
    /// so crossing transactions reject instead of both timing out
    prepare_timeout: Duration,
}

impl Participant {
    pub fn new(repo: Arc<Repository>) -> Self {
        let ttl = repo.config().prepared_ttl();
        let prepare_timeout = repo.config().transaction_timeout() / 2;
        Self {
            repo,
            backup: None,
            pending: Mutex::new(HashMap::new()),
            ttl,
            prepare_timeout,
        }
    }

    /// Local backup store: written on commit, consulted for unowned queries
    pub fn with_backup(mut self, backup: Arc<dyn Backend>) -> Self {
        self.backup = Some(backup);
        self
    }

    pub fn repository(&self) -> &Arc<Repository> {
        &self.repo
    }

    /// Prepared transactions awaiting commit or abort
    pub fn pending_count(&self) -> usize {
        self.pending
            .lock()
            .values()
            .filter(|slot| matches!(slot, Slot::Prepared(_)))
            .count()
    }

    fn take_prepared(&self, txn_id: &Uuid) -> Option<PendingTxn> {
        let mut pending = self.pending.lock();
        if !matches!(pending.get(txn_id), Some(Slot::Prepared(_))) {
            return None;
        }
        match pending.remove(txn_id) {
            Some(Slot::Prepared(p)) => Some(p),
            _ => None,
        }
    }

    /// Drop a reservation that never reached the prepared state
    fn release(&self, txn_id: &Uuid) {
        let mut pending = self.pending.lock();
        if matches!(pending.get(txn_id), Some(Slot::Staging)) {
            pending.remove(txn_id);
        }
    }

    // =========================================================================
    // Two-Phase Commit
    // =========================================================================

    /// Stage `ops`; true if they were accepted and are now held
    pub fn prepare(&self, txn_id: Uuid, ops: Vec<DataOp>) -> bool {
        // Step 1: Reserve the id
        match self.pending.lock().entry(txn_id) {
            Entry::Occupied(_) => {
                tracing::warn!(%txn_id, "duplicate prepare");
                return false;
            }
            Entry::Vacant(slot) => {
                slot.insert(Slot::Staging);
            }
        }

        // Step 2: Stage the operations as a held-open commit
        let staged = self.stage(txn_id, ops);

        // Step 3: Publish, unless aborted while staging
        let Some(continuation) = staged else {
            self.release(&txn_id);
            return false;
        };
        let orphaned = match self.pending.lock().get_mut(&txn_id) {
            Some(slot) if matches!(slot, Slot::Staging) => {
                *slot = Slot::Prepared(PendingTxn {
                    continuation,
                    prepared_at: Instant::now(),
                });
                None
            }
            _ => Some(continuation),
        };

        match orphaned {
            None => true,
            Some(continuation) => {
                tracing::debug!(%txn_id, "aborted while staging");
                continuation.rollback();
                false
            }
        }
    }

    fn stage(&self, txn_id: Uuid, ops: Vec<DataOp>) -> Option<Continuation> {
        let mut continuation = match self.repo.prepare_extern(&ops, Some(self.prepare_timeout)) {
            Ok(Some(continuation)) => continuation,
            Ok(None) => {
                tracing::debug!(%txn_id, ops = ops.len(), "prepare rejected");
                return None;
            }
            Err(e) => {
                tracing::warn!(%txn_id, error = %e, "prepare failed");
                return None;
            }
        };

        if let Some(backup) = &self.backup {
            let backup = Arc::clone(backup);
            let registered = continuation.on_commit(move || match backup.run(&ops) {
                Ok(res) if res.ok => {}
                Ok(_) => tracing::error!(%txn_id, "local backup rejected a committed batch"),
                Err(e) => tracing::error!(%txn_id, error = %e, "local backup write failed"),
            });
            if let Err(e) = registered {
                tracing::warn!(%txn_id, error = %e, "prepare failed");
                return None;
            }
        }
        Some(continuation)
    }

    /// Publish a prepared transaction; false if it is unknown (expired or aborted)
    pub fn commit(&self, txn_id: Uuid) -> bool {
        let Some(pending) = self.take_prepared(&txn_id) else {
            tracing::warn!(%txn_id, "commit for unknown transaction");
            return false;
        };

        match pending.continuation.commit() {
            Ok(()) => true,
            Err(e) => {
                tracing::error!(%txn_id, error = %e, "commit of prepared transaction failed");
                false
            }
        }
    }

    /// Roll back a prepared transaction; one still staging is rolled back when staging ends
    pub fn abort(&self, txn_id: Uuid) {
        let removed = self.pending.lock().remove(&txn_id);
        if let Some(Slot::Prepared(pending)) = removed {
            pending.continuation.rollback();
            tracing::debug!(%txn_id, "prepared transaction aborted");
        }
    }

    /// Roll back prepared transactions older than the TTL; returns how many
    pub fn expire_prepared(&self) -> usize {
        let expired: Vec<(Uuid, PendingTxn)> = {
            let mut pending = self.pending.lock();
            let stale: Vec<Uuid> = pending
                .iter()
                .filter(|(_, slot)| match slot {
                    Slot::Prepared(p) => p.prepared_at.elapsed() >= self.ttl,
                    Slot::Staging => false,
                })
                .map(|(id, _)| *id)
                .collect();
            stale
                .into_iter()
                .filter_map(|id| match pending.remove(&id) {
                    Some(Slot::Prepared(p)) => Some((id, p)),
                    _ => None,
                })
                .collect()
        };

        for (txn_id, pending) in &expired {
            tracing::warn!(%txn_id, age = ?pending.prepared_at.elapsed(), "expiring prepared transaction");
        }
        let count = expired.len();
        for (_, pending) in expired {
            pending.continuation.rollback();
        }
        count
    }

    /// Background thread running `expire_prepared`; stops with the participant
    pub fn spawn_reaper(self: &Arc<Self>) -> Result<JoinHandle<()>> {
        let weak: Weak<Self> = Arc::downgrade(self);
        let interval = (self.ttl / 4).clamp(Duration::from_millis(10), Duration::from_secs(1));

        let handle = std::thread::Builder::new()
            .name("prepared-reaper".to_string())
            .spawn(move || loop {
                std::thread::sleep(interval);
                match weak.upgrade() {
                    Some(participant) => {
                        participant.expire_prepared();
                    }
                    None => return,
                }
            })?;
        Ok(handle)
    }

    // =========================================================================
    // Queries
    // =========================================================================

    /// Local matches; merged with the backup when the query is not owned here
    pub fn query(&self, entity_type: &str, query: &Query) -> Result<QueryResult> {
        let local = self.repo.serve_query(entity_type, query)?;

        let backup = match &self.backup {
            Some(backup) if !local.owned => backup,
            _ => return Ok(local),
        };

        let from_backup = backup.query(entity_type, query)?;
        let merged = QueryResult::merge(std::iter::once(local).chain(from_backup))
            .unwrap_or_default()
            .dedup_by_version();
        Ok(merged)
    }
}

impl PeerHandler for Participant {
    fn handle(&self, request: PeerRequest) -> PeerResponse {
        match request {
            PeerRequest::Prepare { txn_id, ops } => PeerResponse::Ack(self.prepare(txn_id, ops)),
            PeerRequest::Commit { txn_id } => PeerResponse::Ack(self.commit(txn_id)),
            PeerRequest::Abort { txn_id } => {
                self.abort(txn_id);
                PeerResponse::Ack(true)
            }
            PeerRequest::Query { entity_type, query } => match self.query(&entity_type, &query) {
                Ok(result) => PeerResponse::QueryResult(result),
                Err(e) => {
                    tracing::warn!(entity_type = %entity_type, query = %query, error = %e, "query failed");
                    PeerResponse::error(e)
                }
            },
            PeerRequest::Ping => PeerResponse::Pong,
        }
    }
}
