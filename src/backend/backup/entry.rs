//! Backup log entry definitions
//!
//! One entry per replicated batch.

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::entity::DataOp;
use crate::error::{RepoError, Result};

/// Header size: LSN (8) + CRC (4) + Len (4)
pub const HEADER_SIZE: usize = 16;

/// Largest accepted entry payload (64 MB)
pub const MAX_ENTRY_SIZE: u32 = 64 * 1024 * 1024;

/// Body of an entry, bincode encoded after the header
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct EntryBody {
    ops: Vec<DataOp>,
    timestamp: u64,
}

/// A single batch in the backup log
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupEntry {
    /// Log Sequence Number, monotonically increasing from 1
    pub lsn: u64,

    /// The replicated operations
    pub ops: Vec<DataOp>,

    /// Unix millis when the entry was created
    pub timestamp: u64,
}

/// Outcome of parsing one entry from a buffer
#[derive(Debug)]
pub enum Parsed {
    /// A valid entry and the number of bytes it used
    Entry(BackupEntry, usize),
    /// Well framed but the checksum does not match; skip `usize` bytes
    Corrupted(usize),
    /// Not enough bytes for a whole entry (torn tail)
    Incomplete,
}

impl BackupEntry {
    pub fn new(lsn: u64, ops: Vec<DataOp>) -> Self {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        Self { lsn, ops, timestamp }
    }

    fn body_bytes(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(&EntryBody {
            ops: self.ops.clone(),
            timestamp: self.timestamp,
        })?)
    }

    /// CRC over the LSN and the body
    fn checksum(lsn: u64, body: &[u8]) -> u32 {
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&lsn.to_be_bytes());
        hasher.update(body);
        hasher.finalize()
    }

    pub fn compute_crc(&self) -> Result<u32> {
        Ok(Self::checksum(self.lsn, &self.body_bytes()?))
    }

    /// LSN (8) | CRC (4) | Len (4) | Data, big-endian
    pub fn serialize(&self) -> Result<Vec<u8>> {
        let body = self.body_bytes()?;
        if body.len() > MAX_ENTRY_SIZE as usize {
            return Err(RepoError::Serialization(format!(
                "backup entry too large: {} bytes",
                body.len()
            )));
        }

        let mut bytes = Vec::with_capacity(HEADER_SIZE + body.len());
        bytes.extend_from_slice(&self.lsn.to_be_bytes());
        bytes.extend_from_slice(&Self::checksum(self.lsn, &body).to_be_bytes());
        bytes.extend_from_slice(&(body.len() as u32).to_be_bytes());
        bytes.extend_from_slice(&body);
        Ok(bytes)
    }

    /// Parse the entry at the start of `bytes`
    pub fn parse(bytes: &[u8]) -> Parsed {
        if bytes.len() < HEADER_SIZE {
            return Parsed::Incomplete;
        }

        let mut lsn = [0u8; 8];
        lsn.copy_from_slice(&bytes[0..8]);
        let lsn = u64::from_be_bytes(lsn);
        let crc = u32::from_be_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]);
        let len = u32::from_be_bytes([bytes[12], bytes[13], bytes[14], bytes[15]]);

        // A garbage length cannot be skipped reliably: treat it as the tail
        if len > MAX_ENTRY_SIZE {
            return Parsed::Incomplete;
        }
        let total = HEADER_SIZE + len as usize;
        if bytes.len() < total {
            return Parsed::Incomplete;
        }

        let body = &bytes[HEADER_SIZE..total];
        if Self::checksum(lsn, body) != crc {
            return Parsed::Corrupted(total);
        }

        match bincode::deserialize::<EntryBody>(body) {
            Ok(body) => Parsed::Entry(
                BackupEntry {
                    lsn,
                    ops: body.ops,
                    timestamp: body.timestamp,
                },
                total,
            ),
            Err(_) => Parsed::Corrupted(total),
        }
    }

    pub fn deserialize(bytes: &[u8]) -> Result<Self> {
        match Self::parse(bytes) {
            Parsed::Entry(entry, _) => Ok(entry),
            Parsed::Corrupted(_) => Err(RepoError::Serialization(
                "backup entry checksum mismatch".to_string(),
            )),
            Parsed::Incomplete => Err(RepoError::Serialization(
                "incomplete backup entry".to_string(),
            )),
        }
    }
}
