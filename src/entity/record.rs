//! Detached records and replication intents
//!
//! Everything here is plain data: safe to clone, send across threads and
//! serialize for peers and backup stores.

use std::fmt;

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{RepoError, Result};
use super::Entity;

/// Type-erased key: bincode encoding of an entity key
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct KeyBytes(Vec<u8>);

impl KeyBytes {
    pub fn encode<K: Serialize>(key: &K) -> Result<Self> {
        Ok(Self(bincode::serialize(key)?))
    }

    pub fn decode<K: DeserializeOwned>(&self) -> Result<K> {
        Ok(bincode::deserialize(&self.0)?)
    }

    pub fn from_raw(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Stable across processes and platforms (used for sharding)
    pub fn stable_hash(&self) -> u32 {
        crc32fast::hash(&self.0)
    }
}

impl fmt::Debug for KeyBytes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "KeyBytes(")?;
        for b in &self.0 {
            write!(f, "{:02x}", b)?;
        }
        write!(f, ")")
    }
}

/// Marks a transactional slot as holding one entity
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EntityTag {
    pub type_name: &'static str,
    pub key: KeyBytes,
}

/// Plain snapshot of an entity, detached from any transaction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityRecord {
    pub type_name: String,
    pub key: KeyBytes,
    pub version: u64,
    pub payload: Bytes,
}

impl EntityRecord {
    pub fn from_entity<T: Entity>(entity: &T) -> Result<Self> {
        Ok(Self {
            type_name: T::TYPE_NAME.to_string(),
            key: KeyBytes::encode(&entity.id())?,
            version: entity.version(),
            payload: Bytes::from(bincode::serialize(entity)?),
        })
    }

    pub fn to_entity<T: Entity>(&self) -> Result<T> {
        if self.type_name != T::TYPE_NAME {
            return Err(RepoError::Serialization(format!(
                "record of type '{}' decoded as '{}'",
                self.type_name,
                T::TYPE_NAME
            )));
        }
        Ok(bincode::deserialize(&self.payload)?)
    }
}

/// Kind of replication intent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DataOpKind {
    Insert,
    Update,
    Delete,
    /// Insert followed by delete in the same transaction
    Ignore,
}

/// A replication intent: one per dirty entity per transaction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataOp {
    pub kind: DataOpKind,
    pub record: EntityRecord,
}

impl DataOp {
    pub fn new(kind: DataOpKind, record: EntityRecord) -> Self {
        Self { kind, record }
    }

    pub fn insert(record: EntityRecord) -> Self {
        Self::new(DataOpKind::Insert, record)
    }

    pub fn update(record: EntityRecord) -> Self {
        Self::new(DataOpKind::Update, record)
    }

    pub fn delete(record: EntityRecord) -> Self {
        Self::new(DataOpKind::Delete, record)
    }

    pub fn ignore(record: EntityRecord) -> Self {
        Self::new(DataOpKind::Ignore, record)
    }
}
