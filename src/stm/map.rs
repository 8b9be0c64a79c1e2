//! Transactional map
//!
//! One `TVar` slot per key, so point reads and writes on different keys never
//! conflict. Iteration additionally observes the key-structure generation,
//! which changes whenever a commit makes an absent key present.
//!
//! Reading a missing key never creates a slot. The miss is recorded as a key
//! guard and re-checked when the transaction commits. Slots left empty by a
//! commit or an abort are reclaimed.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::atomic::AtomicU64;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::entity::EntityTag;
use crate::error::Result;
use super::{TVar, Txn};

type Slot<V> = TVar<Option<Arc<V>>>;
type Slots<K, V> = Arc<RwLock<HashMap<K, Slot<V>>>>;
type Tagger<K> = Arc<dyn Fn(&K) -> EntityTag + Send + Sync>;

/// Transactional hash map
pub struct TMap<K, V> {
    slots: Slots<K, V>,
    generation: Arc<AtomicU64>,
    tagger: Option<Tagger<K>>,
}

/// Committed value is absent and no transaction other than `holder` holds the slot
fn vacant<V: Send + Sync + 'static>(slot: &Slot<V>, holder: Option<u64>) -> bool {
    let state = slot.cell.state.lock();
    (state.owner.is_none() || state.owner == holder)
        && state
            .value
            .downcast_ref::<Option<Arc<V>>>()
            .is_some_and(Option::is_none)
}

impl<K, V> TMap<K, V>
where
    K: Clone + Eq + Hash + Send + Sync + 'static,
    V: Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self {
            slots: Arc::new(RwLock::new(HashMap::new())),
            generation: Arc::new(AtomicU64::new(0)),
            tagger: None,
        }
    }

    /// Map whose slots carry an entity tag, so writes are discoverable
    /// from a transaction's write set
    pub fn tagged<F>(tagger: F) -> Self
    where
        F: Fn(&K) -> EntityTag + Send + Sync + 'static,
    {
        Self {
            tagger: Some(Arc::new(tagger)),
            ..Self::new()
        }
    }

    fn lookup(&self, key: &K) -> Option<Slot<V>> {
        self.slots.read().get(key).cloned()
    }

    /// Slot to write into, creating it if needed; the flag is true when created here
    fn slot_for_write(&self, key: &K) -> (Slot<V>, bool) {
        if let Some(slot) = self.lookup(key) {
            return (slot, false);
        }

        let mut slots = self.slots.write();
        if let Some(slot) = slots.get(key) {
            return (slot.clone(), false);
        }
        let tag = self.tagger.as_ref().map(|tagger| tagger(key));
        let slot = TVar::with_tag(None, tag);
        slots.insert(key.clone(), slot.clone());
        (slot, true)
    }

    /// At commit, the key must still be absent (or held only by this transaction)
    fn guard_absent(&self, txn: &mut Txn, key: &K) {
        let slots = Arc::clone(&self.slots);
        let key = key.clone();
        txn.guard_key(Box::new(move |txn_id| match slots.read().get(&key) {
            None => true,
            Some(slot) => vacant(slot, Some(txn_id)),
        }));
    }

    /// At commit, `slot` must still be the live slot for `key`
    fn guard_binding(&self, txn: &mut Txn, key: &K, slot: &Slot<V>) {
        let slots = Arc::clone(&self.slots);
        let key = key.clone();
        let cell = Arc::clone(&slot.cell);
        txn.guard_key(Box::new(move |_| {
            slots
                .read()
                .get(&key)
                .is_some_and(|live| Arc::ptr_eq(&live.cell, &cell))
        }));
    }

    /// Drop `slot` once the transaction finishes, if it ends up empty and unheld
    fn reclaim_later(&self, txn: &mut Txn, key: &K, slot: &Slot<V>) {
        let slots = Arc::clone(&self.slots);
        let key = key.clone();
        let cell = Arc::clone(&slot.cell);
        txn.reclaim_later(Box::new(move || {
            let mut slots = slots.write();
            let empty = slots
                .get(&key)
                .is_some_and(|live| Arc::ptr_eq(&live.cell, &cell) && vacant(live, None));
            if empty {
                slots.remove(&key);
            }
        }));
    }

    // =========================================================================
    // Point Operations
    // =========================================================================

    pub fn get(&self, txn: &mut Txn, key: &K) -> Result<Option<Arc<V>>> {
        let value = match self.lookup(key) {
            Some(slot) => (*slot.get(txn)?).clone(),
            None => None,
        };
        if value.is_none() {
            self.guard_absent(txn, key);
        }
        Ok(value)
    }

    pub fn contains_key(&self, txn: &mut Txn, key: &K) -> Result<bool> {
        Ok(self.get(txn, key)?.is_some())
    }

    pub fn insert(&self, txn: &mut Txn, key: K, value: V) -> Result<()> {
        self.insert_arc(txn, key, Arc::new(value))
    }

    pub fn insert_arc(&self, txn: &mut Txn, key: K, value: Arc<V>) -> Result<()> {
        let (slot, created) = self.slot_for_write(&key);
        let was_absent = created || slot.load()?.is_none();

        slot.set(txn, Some(value))?;
        self.guard_binding(txn, &key, &slot);
        if was_absent {
            txn.create_key(&self.generation);
        }
        if created {
            self.reclaim_later(txn, &key, &slot);
        }
        Ok(())
    }

    /// Remove a key, returning the value it had in this transaction
    pub fn remove(&self, txn: &mut Txn, key: &K) -> Result<Option<Arc<V>>> {
        let previous = self.get(txn, key)?;
        if previous.is_some() {
            if let Some(slot) = self.lookup(key) {
                slot.set(txn, None)?;
                self.guard_binding(txn, key, &slot);
                self.reclaim_later(txn, key, &slot);
            }
        }
        Ok(previous)
    }

    // =========================================================================
    // Iteration
    // =========================================================================

    pub fn entries(&self, txn: &mut Txn) -> Result<Vec<(K, Arc<V>)>> {
        txn.observe_structure(&self.generation);

        let slots: Vec<(K, Slot<V>)> = self
            .slots
            .read()
            .iter()
            .map(|(k, slot)| (k.clone(), slot.clone()))
            .collect();

        let mut entries = Vec::with_capacity(slots.len());
        for (key, slot) in slots {
            if let Some(value) = (*slot.get(txn)?).clone() {
                entries.push((key, value));
            }
        }
        Ok(entries)
    }

    pub fn values(&self, txn: &mut Txn) -> Result<Vec<Arc<V>>> {
        Ok(self.entries(txn)?.into_iter().map(|(_, v)| v).collect())
    }

    pub fn keys(&self, txn: &mut Txn) -> Result<Vec<K>> {
        Ok(self.entries(txn)?.into_iter().map(|(k, _)| k).collect())
    }

    // =========================================================================
    // Non-transactional Inspection
    // =========================================================================

    /// Number of present keys as of the last commit
    pub fn committed_len(&self) -> usize {
        self.slots
            .read()
            .values()
            .filter(|slot| matches!(slot.load().map(|v| v.is_some()), Ok(true)))
            .count()
    }

    /// Number of slots currently allocated, present or not
    pub fn slot_count(&self) -> usize {
        self.slots.read().len()
    }

    /// Key-structure generation; advances when a commit adds a key
    pub fn generation(&self) -> u64 {
        self.generation.load(std::sync::atomic::Ordering::Acquire)
    }
}

impl<K, V> Default for TMap<K, V>
where
    K: Clone + Eq + Hash + Send + Sync + 'static,
    V: Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}
