//! Transactional cells

use std::any::Any;
use std::marker::PhantomData;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::entity::EntityTag;
use crate::error::{RepoError, Result};
use super::Txn;

pub(crate) type AnyValue = Arc<dyn Any + Send + Sync>;

/// Committed state of a cell
pub(crate) struct CellState {
    /// Stamp of the commit that produced `value`
    pub(crate) version: u64,
    pub(crate) value: AnyValue,
    /// Transaction currently holding the commit lock
    pub(crate) owner: Option<u64>,
}

/// Untyped cell shared by `TVar` handles and transaction read/write sets
pub(crate) struct VarCell {
    pub(crate) id: u64,
    pub(crate) tag: Option<EntityTag>,
    pub(crate) state: Mutex<CellState>,
}

impl VarCell {
    pub(crate) fn new(value: AnyValue, tag: Option<EntityTag>) -> Arc<Self> {
        Arc::new(Self {
            id: super::next_id(),
            tag,
            state: Mutex::new(CellState {
                version: 0,
                value,
                owner: None,
            }),
        })
    }
}

pub(crate) fn downcast<T: Send + Sync + 'static>(value: AnyValue) -> Result<Arc<T>> {
    value
        .downcast::<T>()
        .map_err(|_| RepoError::Protocol("transactional cell type mismatch".to_string()))
}

/// A transactional cell holding a `T`
///
/// Reads hand out `Arc<T>` snapshots; writes replace the whole value.
pub struct TVar<T> {
    pub(crate) cell: Arc<VarCell>,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Clone for TVar<T> {
    fn clone(&self) -> Self {
        Self {
            cell: Arc::clone(&self.cell),
            _marker: PhantomData,
        }
    }
}

impl<T: Send + Sync + 'static> TVar<T> {
    pub fn new(value: T) -> Self {
        Self::with_tag(value, None)
    }

    pub(crate) fn with_tag(value: T, tag: Option<EntityTag>) -> Self {
        Self {
            cell: VarCell::new(Arc::new(value), tag),
            _marker: PhantomData,
        }
    }

    /// Transactional read
    pub fn get(&self, txn: &mut Txn) -> Result<Arc<T>> {
        txn.read(self)
    }

    /// Transactional write
    pub fn set(&self, txn: &mut Txn, value: T) -> Result<()> {
        txn.write(self, value)
    }

    /// Read, mutate a clone, write back
    pub fn modify<F>(&self, txn: &mut Txn, f: F) -> Result<()>
    where
        T: Clone,
        F: FnOnce(&mut T),
    {
        let mut value = (*self.get(txn)?).clone();
        f(&mut value);
        self.set(txn, value)
    }

    /// Last committed value, outside any transaction
    pub fn load(&self) -> Result<Arc<T>> {
        let value = Arc::clone(&self.cell.state.lock().value);
        downcast(value)
    }

    /// Stamp of the last commit to this cell
    pub fn version(&self) -> u64 {
        self.cell.state.lock().version
    }

    pub fn tag(&self) -> Option<&EntityTag> {
        self.cell.tag.as_ref()
    }
}
