//! Type-erased store dispatch
//!
//! Operations that only know a type tag (replication ops, peer queries,
//! write-set tags) reach the typed store through this table.

use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::entity::{DataOp, DataOpKind, Entity, EntityRecord, KeyBytes, Query, QueryResult};
use crate::error::{RepoError, Result};
use crate::stm::Txn;
use super::EntityStore;

/// A dirty entity held by a transaction's to-do list (an `Arc<T>`)
pub(crate) type PendingValue = Arc<dyn Any + Send + Sync>;

/// Store operations keyed by type tag
pub(crate) trait ErasedStore: Send + Sync {
    fn type_name(&self) -> &'static str;

    fn as_any(&self) -> &dyn Any;

    fn import_records(&self, records: &[EntityRecord]) -> Result<()>;

    fn invalidate_records(&self, records: &[EntityRecord]) -> Result<()>;

    fn perform_extern(&self, txn: &mut Txn, op: &DataOp) -> Result<bool>;

    fn implicit_update(&self, txn: &mut Txn, key: &KeyBytes) -> Result<Option<PendingValue>>;

    fn finalize(
        &self,
        txn: &mut Txn,
        key: &KeyBytes,
        kind: DataOpKind,
        value: &PendingValue,
    ) -> Result<EntityRecord>;

    fn serve_query(&self, query: &Query) -> Result<QueryResult>;

    fn own(&self, query: Query);
}

impl<T: Entity> ErasedStore for EntityStore<T> {
    fn type_name(&self) -> &'static str {
        T::TYPE_NAME
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn import_records(&self, records: &[EntityRecord]) -> Result<()> {
        EntityStore::import_records(self, records)
    }

    fn invalidate_records(&self, records: &[EntityRecord]) -> Result<()> {
        EntityStore::invalidate_records(self, records)
    }

    fn perform_extern(&self, txn: &mut Txn, op: &DataOp) -> Result<bool> {
        EntityStore::perform_extern(self, txn, op)
    }

    fn implicit_update(&self, txn: &mut Txn, key: &KeyBytes) -> Result<Option<PendingValue>> {
        Ok(EntityStore::implicit_update(self, txn, key)?.map(|value| value as PendingValue))
    }

    fn finalize(
        &self,
        txn: &mut Txn,
        key: &KeyBytes,
        kind: DataOpKind,
        value: &PendingValue,
    ) -> Result<EntityRecord> {
        let value = Arc::clone(value).downcast::<T>().map_err(|_| {
            RepoError::Protocol(format!("pending value is not a {}", T::TYPE_NAME))
        })?;
        EntityStore::finalize(self, txn, key, kind, &value)
    }

    fn serve_query(&self, query: &Query) -> Result<QueryResult> {
        EntityStore::serve_query(self, query)
    }

    fn own(&self, query: Query) {
        EntityStore::own(self, query)
    }
}

/// Table of registered stores, filled once at startup
#[derive(Default)]
pub(crate) struct StoreRegistry {
    stores: RwLock<HashMap<&'static str, Arc<dyn ErasedStore>>>,
}

impl StoreRegistry {
    pub(crate) fn register(&self, store: Arc<dyn ErasedStore>) -> Result<()> {
        let mut stores = self.stores.write();
        let name = store.type_name();
        if stores.contains_key(name) {
            return Err(RepoError::Config(format!("entity type '{}' registered twice", name)));
        }
        stores.insert(name, store);
        Ok(())
    }

    pub(crate) fn get(&self, type_name: &str) -> Result<Arc<dyn ErasedStore>> {
        self.stores
            .read()
            .get(type_name)
            .cloned()
            .ok_or_else(|| RepoError::UnknownEntityType(type_name.to_string()))
    }

    pub(crate) fn typed<T: Entity>(&self) -> Result<EntityStore<T>> {
        let store = self.get(T::TYPE_NAME)?;
        store
            .as_any()
            .downcast_ref::<EntityStore<T>>()
            .cloned()
            .ok_or_else(|| {
                RepoError::Config(format!(
                    "entity type name '{}' is shared by two Rust types",
                    T::TYPE_NAME
                ))
            })
    }

    pub(crate) fn all(&self) -> Vec<Arc<dyn ErasedStore>> {
        self.stores.read().values().cloned().collect()
    }

    pub(crate) fn type_names(&self) -> Vec<&'static str> {
        let mut names: Vec<_> = self.stores.read().keys().copied().collect();
        names.sort_unstable();
        names
    }
}
