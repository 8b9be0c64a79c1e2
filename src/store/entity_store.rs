//! Per-type entity store
//!
//! All mutating operations take the caller's `Txn` and are only reachable
//! through a repository transaction.

use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use crate::entity::{
    merge_newer, DataOp, DataOpKind, Entity, EntityRecord, EntityTag, KeyBytes, Query, QueryResult,
};
use crate::error::{RepoError, Result};
use crate::ownership::{self, Reacquire};
use crate::stm::{TMap, TVar, Txn};
use super::StoreContext;

/// Snapshot of a non-owned query result, kept current by local writes
struct CachedQuery<T> {
    query: Query,
    entries: Arc<TMap<KeyBytes, T>>,
}

impl<T> Clone for CachedQuery<T> {
    fn clone(&self) -> Self {
        Self {
            query: self.query.clone(),
            entries: Arc::clone(&self.entries),
        }
    }
}

struct StoreMeta<T> {
    owned: Vec<Query>,
    cached: Vec<CachedQuery<T>>,
}

impl<T> Clone for StoreMeta<T> {
    fn clone(&self) -> Self {
        Self {
            owned: self.owned.clone(),
            cached: self.cached.clone(),
        }
    }
}

impl<T: Entity> StoreMeta<T> {
    fn owns_entity(&self, entity: &T) -> bool {
        self.owned.iter().any(|q| q.matches(entity))
    }

    fn owns_query(&self, query: &Query) -> bool {
        self.owned.iter().any(|owned| owned.covers(query))
    }
}

struct StoreInner<T: Entity> {
    entities: TMap<KeyBytes, T>,
    meta: TVar<StoreMeta<T>>,
    ctx: StoreContext,
}

/// Store of one entity type; a cheap handle
pub struct EntityStore<T: Entity> {
    inner: Arc<StoreInner<T>>,
}

impl<T: Entity> Clone for EntityStore<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Entity> EntityStore<T> {
    pub fn new(ctx: StoreContext) -> Self {
        let entities = TMap::tagged(|key: &KeyBytes| EntityTag {
            type_name: T::TYPE_NAME,
            key: key.clone(),
        });

        Self {
            inner: Arc::new(StoreInner {
                entities,
                meta: TVar::new(StoreMeta {
                    owned: Vec::new(),
                    cached: Vec::new(),
                }),
                ctx,
            }),
        }
    }

    pub fn type_name(&self) -> &'static str {
        T::TYPE_NAME
    }

    fn key_of(entity: &T) -> Result<KeyBytes> {
        KeyBytes::encode(&entity.id())
    }

    // =========================================================================
    // Queries
    // =========================================================================

    /// Run `f` over the data relevant to `query`
    ///
    /// - `None`: the tracked entities, never loads
    /// - owned or cached query: the tracked entities or the cached snapshot
    /// - otherwise: registers a remote load and returns `RetryRequired`
    pub(crate) fn query<R, F>(&self, txn: &mut Txn, query: Option<&Query>, f: F) -> Result<R>
    where
        F: FnOnce(&mut Txn, &TMap<KeyBytes, T>) -> Result<R>,
    {
        let Some(query) = query else {
            return f(txn, &self.inner.entities);
        };

        let meta = self.inner.meta.get(txn)?;
        if meta.owns_query(query) {
            return f(txn, &self.inner.entities);
        }
        if let Some(cached) = meta.cached.iter().find(|c| &c.query == query) {
            let entries = Arc::clone(&cached.entries);
            return f(txn, &entries);
        }

        let store = self.clone();
        let query = query.clone();
        txn.defer_load(move || store.load_remote(&query));
        Err(txn.retry())
    }

    /// Entities of `map` matching `query`; id queries use point lookups
    pub(crate) fn select(txn: &mut Txn, map: &TMap<KeyBytes, T>, query: &Query) -> Result<Vec<Arc<T>>> {
        if let Some(ids) = query.ids() {
            let mut found = Vec::with_capacity(ids.len());
            for key in ids {
                if let Some(entity) = map.get(txn, key)? {
                    found.push(entity);
                }
            }
            return Ok(found);
        }

        Ok(map
            .values(txn)?
            .into_iter()
            .filter(|entity| query.matches::<T>(entity))
            .collect())
    }

    /// Answer a peer's query from local state
    pub fn serve_query(&self, query: &Query) -> Result<QueryResult> {
        let ctx = &self.inner.ctx;
        ctx.stm.run(ctx.transaction_timeout, |txn| {
            let owned = self.inner.meta.get(txn)?.owns_query(query);
            let records = Self::select(txn, &self.inner.entities, query)?
                .iter()
                .map(|entity| EntityRecord::from_entity::<T>(entity))
                .collect::<Result<Vec<_>>>()?;
            Ok(QueryResult::new(owned, records))
        })
    }

    // =========================================================================
    // Loading
    // =========================================================================

    /// Fetch `query` from the backends and import the result
    pub(crate) fn load_remote(&self, query: &Query) -> Result<()> {
        let ctx = &self.inner.ctx;
        ctx.stats.remote_loads.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(entity_type = T::TYPE_NAME, query = %query, "loading query from backends");

        let result = ctx.source.run_query(T::TYPE_NAME, query)?.ok_or_else(|| {
            RepoError::Network(format!("unable to load {} query {}", T::TYPE_NAME, query))
        })?;
        self.import_query(query, result)
    }

    /// Owned results are merged into the tracked set and the query becomes
    /// owned; others become a cached snapshot.
    fn import_query(&self, query: &Query, result: QueryResult) -> Result<()> {
        let records: Vec<T> = result
            .decode::<T>()?
            .into_iter()
            .filter(|dto| query.matches::<T>(dto))
            .collect();
        let owned = result.owned;
        let capacity = self.inner.ctx.cache_capacity.max(1);
        let ctx = &self.inner.ctx;

        ctx.stm.run(ctx.load_timeout, |txn| {
            let mut meta = (*self.inner.meta.get(txn)?).clone();
            meta.cached.retain(|c| &c.query != query);

            if owned {
                for dto in &records {
                    self.import_one(txn, &meta, dto.clone())?;
                }
                if !meta.owned.contains(query) {
                    meta.owned.push(query.clone());
                }
            } else {
                let entries = self.merge_and_filter(txn, &records, query)?;
                meta.cached.push(CachedQuery {
                    query: query.clone(),
                    entries: Arc::new(entries),
                });
                while meta.cached.len() > capacity {
                    let evicted = meta.cached.remove(0);
                    tracing::trace!(entity_type = T::TYPE_NAME, query = %evicted.query, "evicted cached query");
                }
            }

            self.inner.meta.set(txn, meta)
        })?;

        tracing::debug!(
            entity_type = T::TYPE_NAME,
            query = %query,
            owned,
            records = records.len(),
            "imported query result"
        );
        Ok(())
    }

    /// Locally known matches merged with `records`, higher version wins
    fn merge_and_filter(&self, txn: &mut Txn, records: &[T], query: &Query) -> Result<TMap<KeyBytes, T>> {
        let mut merged: HashMap<KeyBytes, T> = HashMap::new();

        for local in Self::select(txn, &self.inner.entities, query)? {
            merged.insert(Self::key_of(&local)?, (*local).clone());
        }
        for dto in records {
            let key = Self::key_of(dto)?;
            match merged.get_mut(&key) {
                Some(current) => {
                    merge_newer(current, dto);
                }
                None => {
                    merged.insert(key, dto.clone());
                }
            }
        }

        let map = TMap::new();
        for (key, entity) in merged {
            map.insert(txn, key, entity)?;
        }
        Ok(map)
    }

    fn import_one(&self, txn: &mut Txn, meta: &StoreMeta<T>, dto: T) -> Result<()> {
        let key = Self::key_of(&dto)?;

        let value = match self.inner.entities.get(txn, &key)? {
            Some(existing) => {
                let mut current = (*existing).clone();
                if !merge_newer(&mut current, &dto) {
                    return self.update_cached(txn, meta, &key, &existing);
                }
                Arc::new(current)
            }
            None => Arc::new(dto),
        };

        self.inner.entities.insert_arc(txn, key.clone(), Arc::clone(&value))?;
        self.update_cached(txn, meta, &key, &value)
    }

    /// Merge snapshots into the tracked set, in a transaction of their own
    pub fn import_records(&self, records: &[EntityRecord]) -> Result<()> {
        let dtos = records
            .iter()
            .map(EntityRecord::to_entity::<T>)
            .collect::<Result<Vec<_>>>()?;
        if dtos.is_empty() {
            return Ok(());
        }

        let ctx = &self.inner.ctx;
        ctx.stm.run(ctx.transaction_timeout, |txn| {
            let meta = self.inner.meta.get(txn)?;
            for dto in &dtos {
                self.import_one(txn, &meta, dto.clone())?;
            }
            Ok(())
        })
    }

    /// Drop entities, and every owned or cached query they make unauthoritative
    ///
    /// Each dropped owned query gets an ownership recovery loop.
    pub fn invalidate_records(&self, records: &[EntityRecord]) -> Result<()> {
        let dtos = records
            .iter()
            .map(EntityRecord::to_entity::<T>)
            .collect::<Result<Vec<_>>>()?;
        if dtos.is_empty() {
            return Ok(());
        }

        let ctx = &self.inner.ctx;
        let dropped = ctx.stm.run(ctx.transaction_timeout, |txn| {
            let mut meta = (*self.inner.meta.get(txn)?).clone();
            let mut dropped = Vec::new();

            for dto in &dtos {
                self.inner.entities.remove(txn, &Self::key_of(dto)?)?;

                let (lost, kept): (Vec<Query>, Vec<Query>) =
                    meta.owned.drain(..).partition(|q| q.matches(dto));
                meta.owned = kept;
                dropped.extend(lost);

                meta.cached.retain(|c| !c.query.matches(dto));
            }

            self.inner.meta.set(txn, meta)?;
            Ok(dropped)
        })?;

        for query in dropped {
            tracing::warn!(entity_type = T::TYPE_NAME, query = %query, "ownership dropped by invalidation");
            self.own(query);
        }
        Ok(())
    }

    // =========================================================================
    // Local Mutations
    // =========================================================================

    pub(crate) fn add(&self, txn: &mut Txn, entity: T) -> Result<Arc<T>> {
        let key = Self::key_of(&entity)?;
        if self.inner.entities.contains_key(txn, &key)? {
            return Err(RepoError::DuplicateEntity(format!(
                "{} {:?} is already known",
                T::TYPE_NAME,
                entity.id()
            )));
        }

        let meta = self.inner.meta.get(txn)?;
        let value = Arc::new(entity);
        if meta.owns_entity(&value) {
            self.inner.entities.insert_arc(txn, key.clone(), Arc::clone(&value))?;
        }
        self.update_cached(txn, &meta, &key, &value)?;
        Ok(value)
    }

    pub(crate) fn update(&self, txn: &mut Txn, entity: T) -> Result<Arc<T>> {
        let key = Self::key_of(&entity)?;
        let meta = self.inner.meta.get(txn)?;

        let Some(existing) = self.inner.entities.get(txn, &key)? else {
            if meta.owns_entity(&entity) {
                return Err(RepoError::NotFound(format!(
                    "{} {:?} does not exist",
                    T::TYPE_NAME,
                    entity.id()
                )));
            }
            let value = Arc::new(entity);
            self.update_cached(txn, &meta, &key, &value)?;
            return Ok(value);
        };

        if entity.version() < existing.version() {
            return Err(RepoError::Concurrency(format!(
                "{} {:?}: version {} is older than tracked version {}",
                T::TYPE_NAME,
                entity.id(),
                entity.version(),
                existing.version()
            )));
        }

        let mut merged = (*existing).clone();
        merged.merge_from(&entity);
        merged.set_version(entity.version());
        let value = Arc::new(merged);

        if meta.owns_entity(&value) {
            self.inner.entities.insert_arc(txn, key.clone(), Arc::clone(&value))?;
        } else {
            self.inner.entities.remove(txn, &key)?;
        }
        self.update_cached(txn, &meta, &key, &value)?;
        Ok(value)
    }

    /// Returns the removed value (the tracked one, if any)
    pub(crate) fn remove(&self, txn: &mut Txn, entity: &T) -> Result<Arc<T>> {
        let key = Self::key_of(entity)?;
        let meta = self.inner.meta.get(txn)?;

        let removed = match self.inner.entities.get(txn, &key)? {
            Some(existing) => {
                if entity.version() < existing.version() {
                    return Err(RepoError::Concurrency(format!(
                        "{} {:?}: removing version {} but tracked version is {}",
                        T::TYPE_NAME,
                        entity.id(),
                        entity.version(),
                        existing.version()
                    )));
                }
                self.inner.entities.remove(txn, &key)?;
                existing
            }
            None if meta.owns_entity(entity) => {
                return Err(RepoError::NotFound(format!(
                    "{} {:?} does not exist",
                    T::TYPE_NAME,
                    entity.id()
                )));
            }
            None => Arc::new(entity.clone()),
        };

        self.remove_cached(txn, &meta, &key)?;
        Ok(removed)
    }

    /// Replace a tracked entity without declaring the write
    ///
    /// Returns false if the entity is not tracked here.
    pub(crate) fn overwrite_tracked(&self, txn: &mut Txn, entity: T) -> Result<bool> {
        let key = Self::key_of(&entity)?;
        if !self.inner.entities.contains_key(txn, &key)? {
            return Ok(false);
        }
        self.inner.entities.insert(txn, key, entity)?;
        Ok(true)
    }

    /// Treat an undeclared write to a tracked slot as an update
    pub(crate) fn implicit_update(&self, txn: &mut Txn, key: &KeyBytes) -> Result<Option<Arc<T>>> {
        let Some(current) = self.inner.entities.get(txn, key)? else {
            return Ok(None);
        };

        let meta = self.inner.meta.get(txn)?;
        if !meta.owns_entity(&current) {
            self.inner.entities.remove(txn, key)?;
        }
        self.update_cached(txn, &meta, key, &current)?;
        Ok(Some(current))
    }

    /// Bump the version of a dirty entity and snapshot it
    pub(crate) fn finalize(
        &self,
        txn: &mut Txn,
        key: &KeyBytes,
        kind: DataOpKind,
        value: &T,
    ) -> Result<EntityRecord> {
        // A tracked slot may hold later in-place changes than the pending value
        let tracked = match kind {
            DataOpKind::Delete => None,
            _ => self.inner.entities.get(txn, key)?,
        };
        let base = tracked.as_deref().unwrap_or(value);
        let mut next = base.clone();
        next.set_version(base.version() + 1);

        if kind != DataOpKind::Delete {
            let next = Arc::new(next.clone());
            if tracked.is_some() {
                self.inner.entities.insert_arc(txn, key.clone(), Arc::clone(&next))?;
            }
            let meta = self.inner.meta.get(txn)?;
            self.update_cached(txn, &meta, key, &next)?;
        }

        EntityRecord::from_entity(&next)
    }

    // =========================================================================
    // External Operations (2PC participant side)
    // =========================================================================

    /// Stage one operation prepared by another node
    ///
    /// Returns false if the operation conflicts with local state.
    pub(crate) fn perform_extern(&self, txn: &mut Txn, op: &DataOp) -> Result<bool> {
        if op.kind == DataOpKind::Ignore {
            return Ok(true);
        }

        let dto: T = op.record.to_entity()?;
        let key = Self::key_of(&dto)?;
        let meta = self.inner.meta.get(txn)?;

        let Some(existing) = self.inner.entities.get(txn, &key)? else {
            if !meta.owns_entity(&dto) {
                // Not ours: only keep cached snapshots current
                if op.kind == DataOpKind::Delete {
                    self.remove_cached(txn, &meta, &key)?;
                } else {
                    self.update_cached(txn, &meta, &key, &Arc::new(dto))?;
                }
                return Ok(true);
            }
            if op.kind != DataOpKind::Insert {
                return Ok(false);
            }
            let value = Arc::new(dto);
            self.inner.entities.insert_arc(txn, key.clone(), Arc::clone(&value))?;
            self.update_cached(txn, &meta, &key, &value)?;
            return Ok(true);
        };

        if op.kind == DataOpKind::Insert || dto.version() <= existing.version() {
            return Ok(false);
        }

        if op.kind == DataOpKind::Delete {
            self.inner.entities.remove(txn, &key)?;
            self.remove_cached(txn, &meta, &key)?;
        } else {
            let mut merged = (*existing).clone();
            merge_newer(&mut merged, &dto);
            let value = Arc::new(merged);
            self.inner.entities.insert_arc(txn, key.clone(), Arc::clone(&value))?;
            self.update_cached(txn, &meta, &key, &value)?;
        }
        Ok(true)
    }

    // =========================================================================
    // Cache Maintenance
    // =========================================================================

    fn update_cached(&self, txn: &mut Txn, meta: &StoreMeta<T>, key: &KeyBytes, value: &Arc<T>) -> Result<()> {
        for cache in &meta.cached {
            if cache.query.matches::<T>(value) {
                cache.entries.insert_arc(txn, key.clone(), Arc::clone(value))?;
            } else {
                cache.entries.remove(txn, key)?;
            }
        }
        Ok(())
    }

    fn remove_cached(&self, txn: &mut Txn, meta: &StoreMeta<T>, key: &KeyBytes) -> Result<()> {
        for cache in &meta.cached {
            cache.entries.remove(txn, key)?;
        }
        Ok(())
    }

    // =========================================================================
    // Ownership
    // =========================================================================

    /// Exact membership in the owned query set
    pub fn owns(&self, query: &Query) -> bool {
        self.inner
            .meta
            .load()
            .map(|meta| meta.owned.contains(query))
            .unwrap_or(false)
    }

    /// Claim `query`: a background loop loads it until it is owned
    pub fn own(&self, query: Query) {
        let target: Arc<dyn Reacquire> = Arc::new(self.clone());
        ownership::spawn_recovery(Arc::clone(&self.inner.ctx.recovery), target, query);
    }

    /// One synchronous acquisition attempt
    pub fn acquire(&self, query: &Query) -> Result<bool> {
        self.load_remote(query)?;
        Ok(self.owns(query))
    }

    pub fn owned_queries(&self) -> Vec<Query> {
        self.inner
            .meta
            .load()
            .map(|meta| meta.owned.clone())
            .unwrap_or_default()
    }

    pub fn cached_queries(&self) -> Vec<Query> {
        self.inner
            .meta
            .load()
            .map(|meta| meta.cached.iter().map(|c| c.query.clone()).collect())
            .unwrap_or_default()
    }

    /// Number of tracked entities as of the last commit
    pub fn tracked_len(&self) -> usize {
        self.inner.entities.committed_len()
    }
}

impl<T: Entity> Reacquire for EntityStore<T> {
    fn entity_type(&self) -> &'static str {
        T::TYPE_NAME
    }

    fn try_acquire(&self, query: &Query) -> Result<bool> {
        self.acquire(query)
    }
}
