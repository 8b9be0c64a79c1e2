//! Queries and query results
//!
//! A `Query` is an immutable predicate with value equality and a stable hash,
//! so it can key the owned and cached query sets of a store.

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::ownership;
use super::{Entity, EntityRecord, KeyBytes};

/// Predicate over the entities of one type
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Query {
    /// Matches everything
    All,

    /// Matches a fixed, sorted id set
    ByIds(BTreeSet<KeyBytes>),

    /// Hash partition owned by the node at `node` (topology position)
    Partition { node: u32, nodes: u32, replicas: u32 },

    /// Matches entities whose attribute `field` renders as `value`
    FieldEq { field: String, value: String },
}

impl Query {
    pub fn by_id<K: Serialize>(id: &K) -> Result<Self> {
        let mut ids = BTreeSet::new();
        ids.insert(KeyBytes::encode(id)?);
        Ok(Query::ByIds(ids))
    }

    pub fn by_ids<'a, K: Serialize + 'a>(ids: impl IntoIterator<Item = &'a K>) -> Result<Self> {
        let ids = ids
            .into_iter()
            .map(KeyBytes::encode)
            .collect::<Result<BTreeSet<_>>>()?;
        Ok(Query::ByIds(ids))
    }

    pub fn partition(node: u32, nodes: u32, replicas: u32) -> Self {
        Query::Partition { node, nodes, replicas }
    }

    pub fn field_eq(field: impl Into<String>, value: impl ToString) -> Self {
        Query::FieldEq {
            field: field.into(),
            value: value.to_string(),
        }
    }

    /// Decide the predicate from the key alone, if the query allows it
    pub fn matches_key(&self, key: &KeyBytes) -> Option<bool> {
        match self {
            Query::All => Some(true),
            Query::ByIds(ids) => Some(ids.contains(key)),
            Query::Partition { node, nodes, replicas } => {
                Some(ownership::is_owner(*node, key, *nodes, *replicas))
            }
            Query::FieldEq { .. } => None,
        }
    }

    pub fn matches<T: Entity>(&self, entity: &T) -> bool {
        match self {
            Query::FieldEq { field, value } => entity.field(field).as_deref() == Some(value.as_str()),
            _ => match KeyBytes::encode(&entity.id()) {
                Ok(key) => self.matches_key(&key).unwrap_or(false),
                Err(_) => false,
            },
        }
    }

    /// True if owning `self` implies owning every entity matched by `other`
    pub fn covers(&self, other: &Query) -> bool {
        if matches!(self, Query::All) || self == other {
            return true;
        }
        match other {
            Query::ByIds(ids) => ids.iter().all(|key| self.matches_key(key) == Some(true)),
            _ => false,
        }
    }

    /// Fixed key set of an id query, for direct lookups
    pub fn ids(&self) -> Option<&BTreeSet<KeyBytes>> {
        match self {
            Query::ByIds(ids) => Some(ids),
            _ => None,
        }
    }
}

impl fmt::Display for Query {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Query::All => write!(f, "QueryAll"),
            Query::ByIds(ids) => write!(f, "QueryByIds({} ids)", ids.len()),
            Query::Partition { node, nodes, replicas } => {
                write!(f, "Partition({}/{} x{})", node, nodes, replicas)
            }
            Query::FieldEq { field, value } => write!(f, "FieldEq({}={})", field, value),
        }
    }
}

/// Response to a query: the matching records, and whether the responder owns
/// the query (the result is then exhaustive and authoritative)
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryResult {
    pub owned: bool,
    pub records: Vec<EntityRecord>,
}

impl QueryResult {
    pub fn new(owned: bool, records: Vec<EntityRecord>) -> Self {
        Self { owned, records }
    }

    pub fn not_owned() -> Self {
        Self::default()
    }

    /// Owned if any part is owned; records are concatenated
    pub fn merge(results: impl IntoIterator<Item = QueryResult>) -> Option<QueryResult> {
        let mut merged: Option<QueryResult> = None;
        for res in results {
            let acc = merged.get_or_insert_with(QueryResult::not_owned);
            acc.owned |= res.owned;
            acc.records.extend(res.records);
        }
        merged
    }

    /// Collapse duplicate keys, keeping the highest version of each
    pub fn dedup_by_version(mut self) -> Self {
        self.records.sort_by(|a, b| a.key.cmp(&b.key).then(b.version.cmp(&a.version)));
        self.records.dedup_by(|later, first| later.key == first.key);
        self
    }

    pub fn decode<T: Entity>(&self) -> Result<Vec<T>> {
        self.records.iter().map(|r| r.to_entity::<T>()).collect()
    }
}
