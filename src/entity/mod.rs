//! Entity Module
//!
//! The data model shared by every other component.
//!
//! ## Responsibilities
//! - `Entity`: a typed, versioned record with a never-null key
//! - `KeyBytes`: the type-erased identity of a key (bincode encoded)
//! - `EntityRecord`: a plain, detached snapshot handed to backends and peers
//! - `DataOp`: one replication intent per dirty entity
//! - `Query` / `QueryResult`: predicates used as filters and as cache/ownership keys
//!
//! ## Merge Rule
//! Two records of the same type with the same key are the same logical record.
//! The one with the strictly higher version wins; equal versions are a no-op.

mod record;
mod query;

use std::fmt;
use std::hash::Hash;

use serde::de::DeserializeOwned;
use serde::Serialize;

pub use record::{DataOp, DataOpKind, EntityRecord, EntityTag, KeyBytes};
pub use query::{Query, QueryResult};

/// A distributed entity
///
/// Implementors are plain values. The repository keeps the live copy and
/// hands out `Arc` snapshots; mutations go through a transaction handle.
pub trait Entity: Clone + fmt::Debug + Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Type-scoped key, never null
    type Key: Clone + Eq + Hash + fmt::Debug + Serialize + DeserializeOwned + Send + Sync + 'static;

    /// Type tag used by the registry and on the wire
    const TYPE_NAME: &'static str;

    fn id(&self) -> Self::Key;

    fn version(&self) -> u64;

    fn set_version(&mut self, version: u64);

    /// Attribute lookup for `Query::FieldEq`
    fn field(&self, _name: &str) -> Option<String> {
        None
    }

    /// Field-level merge copy from a newer snapshot of the same record
    fn merge_from(&mut self, newer: &Self) {
        *self = newer.clone();
    }
}

/// Apply the higher-version-wins rule in place. Returns true if `current` changed.
pub fn merge_newer<T: Entity>(current: &mut T, incoming: &T) -> bool {
    if incoming.version() > current.version() {
        current.merge_from(incoming);
        current.set_version(incoming.version());
        true
    } else {
        false
    }
}
