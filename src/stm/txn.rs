//! Transaction handle
//!
//! Tracks the read set, the write set and the deferred effects of one
//! speculative run of a transaction body.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::entity::EntityTag;
use crate::error::{RepoError, Result};
use super::var::{downcast, AnyValue, VarCell};
use super::TVar;

/// Load run once, outside any transaction, before the body is re-run
pub(crate) type DeferredLoad = Box<dyn FnOnce() -> Result<()> + Send>;

/// Effect run once after the transaction commits or rolls back
pub(crate) type Effect = Box<dyn FnOnce() + Send>;

/// Check re-run under the commit locks; receives the committing transaction id
pub(crate) type KeyGuard = Box<dyn Fn(u64) -> bool + Send>;

struct ReadEntry {
    cell: Arc<VarCell>,
    version: u64,
    value: AnyValue,
}

struct WriteEntry {
    cell: Arc<VarCell>,
    value: AnyValue,
}

/// One speculative run of a transaction
///
/// Passed explicitly to every transactional operation. Never shared between
/// threads while the body runs.
pub struct Txn {
    id: u64,
    read_stamp: u64,
    reads: HashMap<u64, ReadEntry>,
    /// Ordered by cell id so commit locks are always taken in the same order
    writes: BTreeMap<u64, WriteEntry>,
    /// Structure generations observed by map iteration
    structure: Vec<(Arc<AtomicU64>, u64)>,
    /// Structure generations advanced by this transaction when it commits
    created: Vec<Arc<AtomicU64>>,
    /// Absent-key reads and slot bindings of map operations
    guards: Vec<KeyGuard>,
    /// Empty-slot cleanup, run after commit or abort
    reclaims: Vec<Effect>,
    loads: Vec<DeferredLoad>,
    commit_effects: Vec<Effect>,
    rollback_effects: Vec<Effect>,
    locked: bool,
}

impl Txn {
    pub(crate) fn begin() -> Self {
        Self {
            id: super::next_id(),
            read_stamp: super::current_stamp(),
            reads: HashMap::new(),
            writes: BTreeMap::new(),
            structure: Vec::new(),
            created: Vec::new(),
            guards: Vec::new(),
            reclaims: Vec::new(),
            loads: Vec::new(),
            commit_effects: Vec::new(),
            rollback_effects: Vec::new(),
            locked: false,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    // =========================================================================
    // Reads and Writes
    // =========================================================================

    /// Read a cell, recording the observed version
    ///
    /// Fails with `Conflict` if the cell is being committed by another
    /// transaction or changed after this transaction began.
    pub fn read<T: Send + Sync + 'static>(&mut self, var: &TVar<T>) -> Result<Arc<T>> {
        let id = var.cell.id;

        if let Some(entry) = self.writes.get(&id) {
            return downcast(Arc::clone(&entry.value));
        }
        if let Some(entry) = self.reads.get(&id) {
            return downcast(Arc::clone(&entry.value));
        }

        let (version, value) = {
            let state = var.cell.state.lock();
            if state.owner.is_some_and(|owner| owner != self.id) || state.version > self.read_stamp {
                return Err(RepoError::Conflict);
            }
            (state.version, Arc::clone(&state.value))
        };

        self.reads.insert(
            id,
            ReadEntry {
                cell: Arc::clone(&var.cell),
                version,
                value: Arc::clone(&value),
            },
        );
        downcast(value)
    }

    /// Buffer a write; visible to this transaction only until commit
    pub fn write<T: Send + Sync + 'static>(&mut self, var: &TVar<T>, value: T) -> Result<()> {
        let id = var.cell.id;

        if self.locked && !self.writes.contains_key(&id) {
            return Err(RepoError::Protocol(
                "write to a cell outside the locked write set".to_string(),
            ));
        }

        self.writes.insert(
            id,
            WriteEntry {
                cell: Arc::clone(&var.cell),
                value: Arc::new(value),
            },
        );
        Ok(())
    }

    /// Record the generation of a map's key structure (phantom protection)
    pub(crate) fn observe_structure(&mut self, generation: &Arc<AtomicU64>) {
        if self.structure.iter().any(|(g, _)| Arc::ptr_eq(g, generation)) {
            return;
        }
        let seen = generation.load(Ordering::Acquire);
        self.structure.push((Arc::clone(generation), seen));
    }

    /// Advance `generation` at commit: this transaction makes an absent key present
    pub(crate) fn create_key(&mut self, generation: &Arc<AtomicU64>) {
        if !self.created.iter().any(|g| Arc::ptr_eq(g, generation)) {
            self.created.push(Arc::clone(generation));
        }
    }

    pub(crate) fn guard_key(&mut self, guard: KeyGuard) {
        self.guards.push(guard);
    }

    pub(crate) fn reclaim_later(&mut self, reclaim: Effect) {
        self.reclaims.push(reclaim);
    }

    /// Entity slots written by this transaction
    pub fn written_tags(&self) -> Vec<EntityTag> {
        self.writes
            .values()
            .filter_map(|entry| entry.cell.tag.clone())
            .collect()
    }

    // =========================================================================
    // Deferred Effects
    // =========================================================================

    /// Register a load to run once, outside the transaction, before the body is re-run
    pub fn defer_load<F>(&mut self, load: F)
    where
        F: FnOnce() -> Result<()> + Send + 'static,
    {
        self.loads.push(Box::new(load));
    }

    /// Signal that the body must be discarded and re-run after deferred loads
    pub fn retry(&self) -> RepoError {
        RepoError::RetryRequired
    }

    /// Register an effect to run once after a successful commit
    pub fn on_commit<F>(&mut self, effect: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.commit_effects.push(Box::new(effect));
    }

    /// Register an effect to run once if this run is rolled back
    pub fn on_rollback<F>(&mut self, effect: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.rollback_effects.push(Box::new(effect));
    }

    // =========================================================================
    // Commit Protocol
    // =========================================================================

    /// Take commit locks on the write set and validate the read set
    pub(crate) fn lock_and_validate(&mut self) -> Result<()> {
        // Step 1: Lock write cells in id order
        for entry in self.writes.values() {
            let mut state = entry.cell.state.lock();
            match state.owner {
                Some(owner) if owner != self.id => {
                    drop(state);
                    self.release_locks();
                    return Err(RepoError::Conflict);
                }
                _ => state.owner = Some(self.id),
            }
        }

        // Step 2: Announce keys this transaction creates
        for generation in &self.created {
            generation.fetch_add(1, Ordering::AcqRel);
        }

        // Step 3: Every read must still be current
        let reads_valid = self.reads.values().all(|entry| {
            let state = entry.cell.state.lock();
            state.version == entry.version && state.owner.map_or(true, |owner| owner == self.id)
        });

        // Step 4: Missed keys are still missing, written slots still live
        let guards_valid = reads_valid && self.guards.iter().all(|guard| guard(self.id));

        // Step 5: No other key appeared in an iterated map
        let structure_valid = self.structure.iter().all(|(generation, seen)| {
            let own = self.created.iter().any(|g| Arc::ptr_eq(g, generation));
            generation.load(Ordering::Acquire) == *seen + u64::from(own)
        });

        if !guards_valid || !structure_valid {
            self.release_locks();
            return Err(RepoError::Conflict);
        }

        self.locked = true;
        Ok(())
    }

    /// Publish the write set; returns the commit effects to run
    pub(crate) fn commit_locked(&mut self) -> Vec<Effect> {
        if !self.writes.is_empty() {
            let stamp = super::next_stamp();
            for entry in self.writes.values() {
                let mut state = entry.cell.state.lock();
                state.value = Arc::clone(&entry.value);
                state.version = stamp;
                state.owner = None;
            }
        }

        self.locked = false;
        self.writes.clear();
        self.reads.clear();
        self.guards.clear();
        self.created.clear();
        self.rollback_effects.clear();
        self.run_reclaims();
        std::mem::take(&mut self.commit_effects)
    }

    /// Discard this run; returns the deferred loads it registered
    pub(crate) fn abort(&mut self) -> Vec<DeferredLoad> {
        self.release_locks();
        self.locked = false;
        self.writes.clear();
        self.reads.clear();
        self.guards.clear();
        self.created.clear();
        self.commit_effects.clear();
        self.run_reclaims();

        for effect in std::mem::take(&mut self.rollback_effects) {
            effect();
        }
        std::mem::take(&mut self.loads)
    }

    fn run_reclaims(&mut self) {
        for reclaim in std::mem::take(&mut self.reclaims) {
            reclaim();
        }
    }

    fn release_locks(&self) {
        for entry in self.writes.values() {
            let mut state = entry.cell.state.lock();
            if state.owner == Some(self.id) {
                state.owner = None;
            }
        }
    }
}
