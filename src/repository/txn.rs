//! Repository transaction handle
//!
//! `RepoTxn` is the explicit context threaded through every entity operation
//! of one transaction run. It records the to-do list of replication intents.

use std::collections::HashMap;
use std::sync::Arc;

use crate::entity::{DataOpKind, Entity, KeyBytes, Query};
use crate::error::{RepoError, Result};
use crate::stm::Txn;
use crate::store::{EntityStore, PendingValue};
use super::Repository;

pub(crate) struct TodoEntry {
    pub(crate) type_name: &'static str,
    pub(crate) key: KeyBytes,
    pub(crate) kind: DataOpKind,
    pub(crate) value: PendingValue,
}

/// Replication intents of one transaction run, one per dirty entity, in
/// first-touch order
#[derive(Default)]
pub(crate) struct TodoList {
    entries: Vec<TodoEntry>,
    index: HashMap<(&'static str, KeyBytes), usize>,
}

impl TodoList {
    pub(crate) fn kind_of(&self, type_name: &'static str, key: &KeyBytes) -> Option<DataOpKind> {
        self.index
            .get(&(type_name, key.clone()))
            .map(|&i| self.entries[i].kind)
    }

    pub(crate) fn contains(&self, type_name: &'static str, key: &KeyBytes) -> bool {
        self.index.contains_key(&(type_name, key.clone()))
    }

    fn value_of<T: Entity>(&self, key: &KeyBytes) -> Option<Arc<T>> {
        let i = *self.index.get(&(T::TYPE_NAME, key.clone()))?;
        Arc::clone(&self.entries[i].value).downcast::<T>().ok()
    }

    pub(crate) fn set(&mut self, type_name: &'static str, key: KeyBytes, kind: DataOpKind, value: PendingValue) {
        match self.index.get(&(type_name, key.clone())) {
            Some(&i) => {
                self.entries[i].kind = kind;
                self.entries[i].value = value;
            }
            None => {
                self.index.insert((type_name, key.clone()), self.entries.len());
                self.entries.push(TodoEntry {
                    type_name,
                    key,
                    kind,
                    value,
                });
            }
        }
    }

    /// Replace the pending value of an already queued entry, keeping its kind
    fn refresh(&mut self, type_name: &'static str, key: &KeyBytes, value: PendingValue) {
        if let Some(&i) = self.index.get(&(type_name, key.clone())) {
            self.entries[i].value = value;
        }
    }

    pub(crate) fn entries(&self) -> &[TodoEntry] {
        &self.entries
    }
}

/// Handle of a running repository transaction
pub struct RepoTxn<'a> {
    pub(crate) repo: &'a Repository,
    pub(crate) txn: &'a mut Txn,
    pub(crate) todo: &'a mut TodoList,
}

impl<'a> RepoTxn<'a> {
    /// The underlying optimistic transaction, for custom `TVar`/`TMap` state
    pub fn txn(&mut self) -> &mut Txn {
        self.txn
    }

    pub fn repository(&self) -> &Repository {
        self.repo
    }

    /// Nested transaction: runs inline, replicated with the enclosing one
    pub fn in_transaction<R, F>(&mut self, f: F) -> Result<R>
    where
        F: FnOnce(&mut RepoTxn<'a>) -> Result<R>,
    {
        f(self)
    }

    fn store<T: Entity>(&self) -> Result<EntityStore<T>> {
        self.repo.registry.typed::<T>()
    }

    // =========================================================================
    // Reads
    // =========================================================================

    /// Entity by id, loading it from peers if necessary
    pub fn find<T: Entity>(&mut self, id: &T::Key) -> Result<Arc<T>> {
        self.try_find::<T>(id)?.ok_or_else(|| {
            RepoError::NotFound(format!("{} {:?} does not exist", T::TYPE_NAME, id))
        })
    }

    pub fn try_find<T: Entity>(&mut self, id: &T::Key) -> Result<Option<Arc<T>>> {
        let store = self.store::<T>()?;
        let key = KeyBytes::encode(id)?;

        if matches!(
            self.todo.kind_of(T::TYPE_NAME, &key),
            Some(DataOpKind::Delete) | Some(DataOpKind::Ignore)
        ) {
            return Ok(None);
        }

        // Step 1: Tracked locally
        if let Some(found) = store.query(self.txn, None, |txn, map| map.get(txn, &key))? {
            return Ok(Some(found));
        }

        // Step 2: Owned, cached or loaded by id
        let query = Query::ByIds([key.clone()].into_iter().collect());
        store.query(self.txn, Some(&query), |txn, map| map.get(txn, &key))
    }

    /// All entities matching `query`, loading the query if it is neither
    /// owned nor cached
    pub fn get_all<T: Entity>(&mut self, query: &Query) -> Result<Vec<Arc<T>>> {
        let store = self.store::<T>()?;
        store.query(self.txn, Some(query), |txn, map| EntityStore::<T>::select(txn, map, query))
    }

    /// Tracked entities matching `query`; never loads
    pub fn get_local<T: Entity>(&mut self, query: &Query) -> Result<Vec<Arc<T>>> {
        let store = self.store::<T>()?;
        store.query(self.txn, None, |txn, map| EntityStore::<T>::select(txn, map, query))
    }

    // =========================================================================
    // Writes
    // =========================================================================

    /// Returns the live entity
    pub fn insert<T: Entity>(&mut self, mut entity: T) -> Result<Arc<T>> {
        let store = self.store::<T>()?;
        let key = KeyBytes::encode(&entity.id())?;
        let prior = self.todo.kind_of(T::TYPE_NAME, &key);

        // Delete then insert is an update of the deleted record
        let kind = if prior == Some(DataOpKind::Delete) {
            if let Some(deleted) = self.todo.value_of::<T>(&key) {
                entity.set_version(entity.version().max(deleted.version()));
            }
            DataOpKind::Update
        } else {
            DataOpKind::Insert
        };

        let live = store.add(self.txn, entity)?;
        self.todo.set(T::TYPE_NAME, key, kind, Arc::clone(&live) as PendingValue);
        Ok(live)
    }

    /// Returns the live entity
    pub fn update<T: Entity>(&mut self, entity: T) -> Result<Arc<T>> {
        let store = self.store::<T>()?;
        let key = KeyBytes::encode(&entity.id())?;
        let prior = self.todo.kind_of(T::TYPE_NAME, &key);

        if prior == Some(DataOpKind::Delete) {
            return Err(RepoError::NotFound(format!(
                "{} {:?} was removed in this transaction",
                T::TYPE_NAME,
                entity.id()
            )));
        }

        let live = store.update(self.txn, entity)?;
        let kind = prior.unwrap_or(DataOpKind::Update);
        self.todo.set(T::TYPE_NAME, key, kind, Arc::clone(&live) as PendingValue);
        Ok(live)
    }

    pub fn remove<T: Entity>(&mut self, entity: &T) -> Result<()> {
        let store = self.store::<T>()?;
        let key = KeyBytes::encode(&entity.id())?;
        let prior = self.todo.kind_of(T::TYPE_NAME, &key);

        let removed = store.remove(self.txn, entity)?;
        let kind = if prior == Some(DataOpKind::Insert) {
            DataOpKind::Ignore
        } else {
            DataOpKind::Delete
        };
        self.todo.set(T::TYPE_NAME, key, kind, removed as PendingValue);
        Ok(())
    }

    /// Change a tracked entity in place without declaring it
    ///
    /// The write is picked up as an implicit update at commit. Entities that
    /// are not tracked here go through `update`.
    pub fn modify<T, F>(&mut self, id: &T::Key, f: F) -> Result<Arc<T>>
    where
        T: Entity,
        F: FnOnce(&mut T),
    {
        let current = self.find::<T>(id)?;
        let mut next = (*current).clone();
        f(&mut next);

        let store = self.store::<T>()?;
        if store.overwrite_tracked(self.txn, next.clone())? {
            let live = Arc::new(next);
            let key = KeyBytes::encode(id)?;
            self.todo.refresh(T::TYPE_NAME, &key, Arc::clone(&live) as PendingValue);
            Ok(live)
        } else {
            self.update(next)
        }
    }
}
