//! Backup log recovery
//!
//! Replays the log at startup. A torn tail (partial write at the end) is cut
//! off; well-framed entries with a bad checksum are skipped.

use std::fs::{self, OpenOptions};
use std::path::Path;

use crate::error::Result;
use super::entry::Parsed;
use super::BackupEntry;

/// Handles backup log recovery
pub struct BackupRecovery;

/// Result of a recovery operation
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryResult {
    /// Number of entries successfully recovered
    pub entries_recovered: u64,

    /// Number of corrupted entries skipped
    pub entries_corrupted: u64,

    /// Last valid LSN
    pub last_lsn: u64,

    /// Whether the log was truncated (partial writes removed)
    pub was_truncated: bool,
}

impl BackupRecovery {
    /// Read every valid entry in order, truncating a torn tail
    pub fn recover(path: &Path) -> Result<(Vec<BackupEntry>, RecoveryResult)> {
        let (entries, result, valid_len) = Self::scan(path)?;

        if result.was_truncated {
            let file = OpenOptions::new().write(true).open(path)?;
            file.set_len(valid_len as u64)?;
            file.sync_all()?;
            tracing::warn!(path = %path.display(), valid_len, "truncated torn tail of backup log");
        }

        Ok((entries, result))
    }

    /// Integrity statistics, without modifying the file
    pub fn verify(path: &Path) -> Result<RecoveryResult> {
        let (_, result, _) = Self::scan(path)?;
        Ok(result)
    }

    fn scan(path: &Path) -> Result<(Vec<BackupEntry>, RecoveryResult, usize)> {
        let mut result = RecoveryResult::default();
        let mut entries = Vec::new();

        if !path.exists() {
            return Ok((entries, result, 0));
        }

        let bytes = fs::read(path)?;
        let mut offset = 0;

        while offset < bytes.len() {
            match BackupEntry::parse(&bytes[offset..]) {
                Parsed::Entry(entry, used) => {
                    result.entries_recovered += 1;
                    result.last_lsn = result.last_lsn.max(entry.lsn);
                    entries.push(entry);
                    offset += used;
                }
                Parsed::Corrupted(used) => {
                    tracing::warn!(path = %path.display(), offset, "skipping corrupted backup entry");
                    result.entries_corrupted += 1;
                    offset += used;
                }
                Parsed::Incomplete => {
                    result.was_truncated = true;
                    break;
                }
            }
        }

        Ok((entries, result, offset))
    }
}
