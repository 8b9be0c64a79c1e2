//! Repository Module
//!
//! The transaction coordinator: the only way to mutate distributed entities.
//!
//! ## Responsibilities
//! - Run transaction bodies under the optimistic engine (`in_transaction`)
//! - Detect undeclared entity writes and record them as updates
//! - Bump versions, snapshot dirty entities and replicate them through every
//!   registered backend while the local commit locks are held
//! - Commit locally on success; roll back and reconcile on failure
//! - Stage external (peer) transactions for the 2PC participant side
//!
//! ## Top-level Transaction Flow
//! ```text
//!   run_to_commit(body)                  body: action, implicit updates,
//!        │                                     version bump, snapshots
//!        ▼
//!   no ops? ───────────────► commit
//!        │
//!        ▼
//!   backends.run(ops) in parallel, bounded by the transaction timeout
//!        │
//!        ├── all ok ───────────────────► commit
//!        ├── post-commit anomaly ──────► commit, return the anomaly error
//!        └── rejected / timed out ─────► rollback, import/invalidate hints,
//!                                        ConcurrencyError
//! ```

mod txn;
mod accessor;
mod stats;

use std::collections::BTreeMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam::channel;
use parking_lot::RwLock;

pub use txn::RepoTxn;
pub use accessor::Accessor;
pub use stats::{RepoStats, RepoStatsSnapshot};

use crate::backend::{Backend, BackendResult};
use crate::config::Config;
use crate::entity::{DataOp, DataOpKind, Entity, EntityRecord, Query, QueryResult};
use crate::error::{RepoError, Result};
use crate::ownership::{FatalHook, RecoveryPolicy};
use crate::stm::{Continuation, Stm, Txn};
use crate::store::{EntityStore, QuerySource, StoreContext, StoreRegistry};
use txn::TodoList;

// =============================================================================
// Backend Set
// =============================================================================

/// Registered backends; also the query source of every store
#[derive(Default)]
struct Backends {
    list: RwLock<Vec<Arc<dyn Backend>>>,
}

impl Backends {
    fn snapshot(&self) -> Vec<Arc<dyn Backend>> {
        self.list.read().clone()
    }
}

impl QuerySource for Backends {
    fn run_query(&self, entity_type: &str, query: &Query) -> Result<Option<QueryResult>> {
        let backends = self.snapshot();

        let answers: Vec<Result<Option<QueryResult>>> = if backends.len() == 1 {
            vec![backends[0].query(entity_type, query)]
        } else {
            crossbeam::scope(|scope| {
                let handles: Vec<_> = backends
                    .iter()
                    .map(|backend| scope.spawn(move |_| backend.query(entity_type, query)))
                    .collect();
                handles
                    .into_iter()
                    .map(|handle| {
                        handle.join().unwrap_or_else(|_| {
                            Err(RepoError::Protocol("backend query panicked".to_string()))
                        })
                    })
                    .collect()
            })
            .map_err(|_| RepoError::Protocol("backend query scope panicked".to_string()))?
        };

        let mut results = Vec::new();
        for (backend, answer) in backends.iter().zip(answers) {
            match answer {
                Ok(Some(result)) => results.push(result),
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(backend = backend.name(), entity_type, query = %query, error = %e, "backend query failed");
                }
            }
        }

        Ok(QueryResult::merge(results).map(QueryResult::dedup_by_version))
    }
}

/// Result of the replication round of one transaction
enum Replication {
    Committed,
    Rejected(BackendResult),
    TimedOut,
    /// Peers committed but something failed afterwards
    Anomaly(RepoError),
}

// =============================================================================
// Repository
// =============================================================================

/// A node's replicated object repository
pub struct Repository {
    config: Config,
    stm: Arc<Stm>,
    registry: StoreRegistry,
    backends: Arc<Backends>,
    recovery: Arc<RecoveryPolicy>,
    stats: Arc<RepoStats>,
}

impl Repository {
    pub fn new(config: Config) -> Result<Self> {
        config.validate()?;

        let recovery = Arc::new(RecoveryPolicy::from_config(&config));
        Ok(Self {
            config,
            stm: Arc::new(Stm::new()),
            registry: StoreRegistry::default(),
            backends: Arc::new(Backends::default()),
            recovery,
            stats: Arc::new(RepoStats::default()),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    // =========================================================================
    // Setup
    // =========================================================================

    /// Register an entity type; must happen before it is used
    pub fn register<T: Entity>(&self) -> Result<EntityStore<T>> {
        let ctx = StoreContext {
            stm: Arc::clone(&self.stm),
            source: Arc::clone(&self.backends) as Arc<dyn QuerySource>,
            recovery: Arc::clone(&self.recovery),
            stats: Arc::clone(&self.stats),
            transaction_timeout: self.config.transaction_timeout(),
            load_timeout: self.config.query_load_timeout(),
            cache_capacity: self.config.cache_capacity,
        };

        let store = EntityStore::<T>::new(ctx);
        self.registry.register(Arc::new(store.clone()))?;
        tracing::debug!(entity_type = T::TYPE_NAME, "registered entity type");
        Ok(store)
    }

    pub fn add_backend(&self, backend: Arc<dyn Backend>) {
        tracing::info!(backend = backend.name(), "backend added");
        self.backends.list.write().push(backend);
    }

    /// Policy run when ownership cannot be recovered
    pub fn set_fatal_hook(&self, hook: FatalHook) {
        self.recovery.set_fatal_hook(hook);
    }

    pub fn entity_types(&self) -> Vec<&'static str> {
        self.registry.type_names()
    }

    pub fn store<T: Entity>(&self) -> Result<EntityStore<T>> {
        self.registry.typed::<T>()
    }

    pub fn accessor<T: Entity>(&self) -> Accessor<'_, T> {
        Accessor::new(self)
    }

    // =========================================================================
    // Ownership
    // =========================================================================

    /// Claim `query` for every registered type
    pub fn claim_ownership(&self, query: &Query) {
        for store in self.registry.all() {
            store.own(query.clone());
        }
    }

    pub fn own<T: Entity>(&self, query: Query) -> Result<()> {
        self.store::<T>()?.own(query);
        Ok(())
    }

    pub fn owns<T: Entity>(&self, query: &Query) -> Result<bool> {
        Ok(self.store::<T>()?.owns(query))
    }

    /// One synchronous ownership attempt
    pub fn acquire<T: Entity>(&self, query: &Query) -> Result<bool> {
        self.store::<T>()?.acquire(query)
    }

    /// Set once ownership recovery has failed; all transactions are refused
    pub fn is_poisoned(&self) -> bool {
        self.recovery.is_poisoned()
    }

    pub fn stats(&self) -> RepoStatsSnapshot {
        self.stats.snapshot(self.stm.stats())
    }

    // =========================================================================
    // Transactions
    // =========================================================================

    /// Run `action` as one distributed transaction
    ///
    /// Local conflicts re-run `action` transparently; a rejected or timed out
    /// replication round rolls back and returns `RepoError::Concurrency`.
    pub fn in_transaction<R, F>(&self, mut action: F) -> Result<R>
    where
        F: FnMut(&mut RepoTxn<'_>) -> Result<R>,
    {
        if self.recovery.is_poisoned() {
            return Err(RepoError::OwnershipLost(
                "ownership recovery failed; refusing to run transactions".to_string(),
            ));
        }

        let timeout = self.config.transaction_timeout();

        let ((result, ops), continuation) = self.stm.run_to_commit(timeout, |txn| {
            let mut todo = TodoList::default();
            let result = {
                let mut handle = RepoTxn {
                    repo: self,
                    txn: &mut *txn,
                    todo: &mut todo,
                };
                action(&mut handle)?
            };
            let ops = self.finish(txn, &todo)?;
            Ok((result, ops))
        })?;

        if ops.is_empty() {
            continuation.commit()?;
            self.stats.commits.fetch_add(1, Ordering::Relaxed);
            return Ok(result);
        }

        match self.replicate(&ops, timeout) {
            Replication::Committed => {
                continuation.commit()?;
                self.stats.commits.fetch_add(1, Ordering::Relaxed);
                self.stats.replicated_ops.fetch_add(ops.len() as u64, Ordering::Relaxed);
                Ok(result)
            }
            Replication::Anomaly(err) => {
                continuation.commit()?;
                self.stats.commits.fetch_add(1, Ordering::Relaxed);
                self.stats.replication_anomalies.fetch_add(1, Ordering::Relaxed);
                tracing::error!(ops = ops.len(), error = %err, "transaction committed with a replication anomaly");
                Err(err)
            }
            Replication::Rejected(res) => {
                continuation.rollback();
                self.stats.replication_failures.fetch_add(1, Ordering::Relaxed);
                self.reconcile(&res);
                Err(RepoError::Concurrency(
                    "replication was rejected; re-read and retry".to_string(),
                ))
            }
            Replication::TimedOut => {
                continuation.rollback();
                self.stats.replication_failures.fetch_add(1, Ordering::Relaxed);
                Err(RepoError::Concurrency(format!(
                    "replication did not complete within {:?}",
                    timeout
                )))
            }
        }
    }

    /// Implicit updates, version bump and snapshots, inside the body
    fn finish(&self, txn: &mut Txn, todo: &TodoList) -> Result<Vec<DataOp>> {
        let mut todo_implicit = Vec::new();

        // Step 1: Undeclared writes to entity slots become updates
        for tag in txn.written_tags() {
            if todo.contains(tag.type_name, &tag.key) {
                continue;
            }
            let store = self.registry.get(tag.type_name)?;
            if let Some(value) = store.implicit_update(txn, &tag.key)? {
                tracing::trace!(entity_type = tag.type_name, key = ?tag.key, "implicit update");
                todo_implicit.push((tag, value));
            }
        }

        // Step 2: Bump versions and snapshot, skipping collapsed pairs
        let mut ops = Vec::new();
        for entry in todo.entries() {
            if entry.kind == DataOpKind::Ignore {
                continue;
            }
            let store = self.registry.get(entry.type_name)?;
            let record = store.finalize(txn, &entry.key, entry.kind, &entry.value)?;
            ops.push(DataOp::new(entry.kind, record));
        }
        for (tag, value) in todo_implicit {
            let store = self.registry.get(tag.type_name)?;
            let record = store.finalize(txn, &tag.key, DataOpKind::Update, &value)?;
            ops.push(DataOp::update(record));
        }

        Ok(ops)
    }

    /// Run every backend in parallel, bounded by `timeout`
    fn replicate(&self, ops: &[DataOp], timeout: Duration) -> Replication {
        let backends = self.backends.snapshot();
        if backends.is_empty() {
            return Replication::Committed;
        }

        let deadline = Instant::now() + timeout;
        let ops: Arc<Vec<DataOp>> = Arc::new(ops.to_vec());
        let (tx, rx) = channel::bounded(backends.len());

        for backend in backends.iter().cloned() {
            let tx = tx.clone();
            let ops = Arc::clone(&ops);
            let spawned = std::thread::Builder::new()
                .name("replicate".to_string())
                .spawn(move || {
                    let outcome = backend.run(&ops);
                    let _ = tx.send((backend.name().to_string(), outcome));
                });
            if let Err(e) = spawned {
                tracing::error!(error = %e, "failed to spawn replication thread");
                return Replication::Rejected(BackendResult::failure());
            }
        }
        drop(tx);

        let mut results = Vec::with_capacity(backends.len());
        let mut anomaly = None;
        for _ in 0..backends.len() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match rx.recv_timeout(remaining) {
                Ok((_, Ok(res))) => results.push(res),
                Ok((name, Err(e))) => {
                    tracing::error!(backend = %name, error = %e, "backend failed after the point of no return");
                    anomaly.get_or_insert(e);
                }
                Err(_) => {
                    tracing::warn!(timeout = ?timeout, "replication round timed out");
                    return Replication::TimedOut;
                }
            }
        }

        let merged = BackendResult::merge(results);
        if !merged.ok {
            return Replication::Rejected(merged);
        }
        match anomaly {
            Some(err) => Replication::Anomaly(err),
            None => Replication::Committed,
        }
    }

    /// Apply reconciliation hints after a failed replication round
    fn reconcile(&self, res: &BackendResult) {
        if let Err(e) = self.import(&res.update) {
            tracing::warn!(error = %e, "failed to import reconciliation updates");
        }
        if let Err(e) = self.invalidate(&res.invalidate) {
            tracing::warn!(error = %e, "failed to apply invalidations");
        }
    }

    // =========================================================================
    // Import / Invalidate
    // =========================================================================

    /// Merge snapshots (higher version wins); never part of a larger transaction
    pub fn import(&self, records: &[EntityRecord]) -> Result<()> {
        for (type_name, group) in group_by_type(records) {
            self.registry.get(&type_name)?.import_records(&group)?;
        }
        Ok(())
    }

    /// Drop entities and the queries they make unauthoritative
    pub fn invalidate(&self, records: &[EntityRecord]) -> Result<()> {
        for (type_name, group) in group_by_type(records) {
            self.registry.get(&type_name)?.invalidate_records(&group)?;
        }
        Ok(())
    }

    // =========================================================================
    // External Transactions (2PC participant side)
    // =========================================================================

    /// Stage another node's operations and hold the commit open
    ///
    /// `Ok(None)` if any operation conflicts with local state.
    pub fn prepare_extern(&self, ops: &[DataOp], timeout: Option<Duration>) -> Result<Option<Continuation>> {
        if Stm::in_transaction() {
            return Err(RepoError::Protocol(
                "external transactions cannot be prepared inside a transaction".to_string(),
            ));
        }

        let timeout = timeout.unwrap_or_else(|| self.config.transaction_timeout());
        let (accepted, continuation) = self.stm.run_to_commit(timeout, |txn| {
            for op in ops {
                let store = self.registry.get(&op.record.type_name)?;
                if !store.perform_extern(txn, op)? {
                    tracing::debug!(entity_type = %op.record.type_name, kind = ?op.kind, "external op rejected");
                    return Ok(false);
                }
            }
            Ok(true)
        })?;

        if accepted {
            Ok(Some(continuation))
        } else {
            continuation.rollback();
            Ok(None)
        }
    }

    /// Answer a peer query from local state
    pub fn serve_query(&self, entity_type: &str, query: &Query) -> Result<QueryResult> {
        self.registry.get(entity_type)?.serve_query(query)
    }
}

fn group_by_type(records: &[EntityRecord]) -> BTreeMap<String, Vec<EntityRecord>> {
    let mut groups: BTreeMap<String, Vec<EntityRecord>> = BTreeMap::new();
    for record in records {
        groups
            .entry(record.type_name.clone())
            .or_default()
            .push(record.clone());
    }
    groups
}
