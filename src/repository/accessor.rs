//! Typed convenience facade
//!
//! Each call is a complete transaction of its own. Use
//! `Repository::in_transaction` to group several operations.

use std::marker::PhantomData;
use std::sync::Arc;

use crate::entity::{Entity, Query};
use crate::error::Result;
use super::Repository;

/// Single-operation access to one entity type
pub struct Accessor<'a, T: Entity> {
    repo: &'a Repository,
    _marker: PhantomData<fn() -> T>,
}

impl<'a, T: Entity> Clone for Accessor<'a, T> {
    fn clone(&self) -> Self {
        Self::new(self.repo)
    }
}

impl<'a, T: Entity> Accessor<'a, T> {
    pub(crate) fn new(repo: &'a Repository) -> Self {
        Self {
            repo,
            _marker: PhantomData,
        }
    }

    pub fn find(&self, id: &T::Key) -> Result<Arc<T>> {
        self.repo.in_transaction(|tx| tx.find::<T>(id))
    }

    pub fn try_find(&self, id: &T::Key) -> Result<Option<Arc<T>>> {
        self.repo.in_transaction(|tx| tx.try_find::<T>(id))
    }

    pub fn get_all(&self, query: &Query) -> Result<Vec<Arc<T>>> {
        self.repo.in_transaction(|tx| tx.get_all::<T>(query))
    }

    pub fn get_local(&self, query: &Query) -> Result<Vec<Arc<T>>> {
        self.repo.in_transaction(|tx| tx.get_local::<T>(query))
    }

    pub fn insert(&self, entity: T) -> Result<Arc<T>> {
        self.repo.in_transaction(|tx| tx.insert(entity.clone()))
    }

    pub fn update(&self, entity: T) -> Result<Arc<T>> {
        self.repo.in_transaction(|tx| tx.update(entity.clone()))
    }

    pub fn remove(&self, entity: &T) -> Result<()> {
        self.repo.in_transaction(|tx| tx.remove(entity))
    }

    /// Read-modify-write of one entity; `f` may run more than once
    pub fn modify<F>(&self, id: &T::Key, f: F) -> Result<Arc<T>>
    where
        F: Fn(&mut T),
    {
        self.repo.in_transaction(|tx| tx.modify::<T, _>(id, &f))
    }

    pub fn owns(&self, query: &Query) -> Result<bool> {
        self.repo.owns::<T>(query)
    }

    pub fn own(&self, query: Query) -> Result<()> {
        self.repo.own::<T>(query)
    }

    pub fn acquire(&self, query: &Query) -> Result<bool> {
        self.repo.acquire::<T>(query)
    }
}
