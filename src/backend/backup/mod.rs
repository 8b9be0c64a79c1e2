//! Backup Store
//!
//! Append-only log of replicated batches, used as a synchronous backup of the
//! cluster. The log is replayed into an in-memory index at open, so queries
//! never touch the file.
//!
//! ## Responsibilities
//! - Append every committed batch, synced before acknowledging
//! - CRC32 checksums for corruption detection
//! - Log Sequence Numbers (LSN) for ordering
//! - Replay at open: torn tail truncated, corrupted entries skipped
//! - Answer any query (a backup holds every entity, so results are owned)
//!
//! ## File Format
//! ```text
//! ┌─────────────────────────────────────────┐
//! │ Entry 1                                 │
//! │ ┌─────────┬─────────┬────────┬────────┐ │
//! │ │ LSN (8) │ CRC (4) │Len (4) │ Data   │ │
//! │ └─────────┴─────────┴────────┴────────┘ │
//! ├─────────────────────────────────────────┤
//! │ Entry 2                                 │
//! │ ┌─────────┬─────────┬────────┬────────┐ │
//! │ │ LSN (8) │ CRC (4) │Len (4) │ Data   │ │
//! │ └─────────┴─────────┴────────┴────────┘ │
//! └─────────────────────────────────────────┘
//! ```
//! Data is the bincode encoding of the batch and its timestamp.

mod entry;
mod writer;
mod recovery;

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use parking_lot::{Mutex, RwLock};

pub use entry::{BackupEntry, HEADER_SIZE};
pub use writer::BackupWriter;
pub use recovery::{BackupRecovery, RecoveryResult};

use crate::entity::{DataOp, DataOpKind, EntityRecord, KeyBytes, Query, QueryResult};
use crate::error::Result;
use super::{Backend, BackendResult};

type Index = HashMap<String, HashMap<KeyBytes, EntityRecord>>;

/// Log-backed backup store
pub struct WalBackup {
    path: PathBuf,
    writer: Mutex<BackupWriter>,
    index: RwLock<Index>,
    recovery: RecoveryResult,
}

impl WalBackup {
    /// Open (or create) the log at `path` and replay it
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let (entries, recovery) = BackupRecovery::recover(&path)?;

        let mut index = Index::new();
        for entry in &entries {
            apply(&mut index, &entry.ops);
        }

        tracing::info!(
            path = %path.display(),
            entries = recovery.entries_recovered,
            corrupted = recovery.entries_corrupted,
            last_lsn = recovery.last_lsn,
            "backup log replayed"
        );

        let writer = BackupWriter::open(&path, recovery.last_lsn)?;
        Ok(Self {
            path,
            writer: Mutex::new(writer),
            index: RwLock::new(index),
            recovery,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Statistics of the replay done at open
    pub fn recovery(&self) -> &RecoveryResult {
        &self.recovery
    }

    pub fn current_lsn(&self) -> u64 {
        self.writer.lock().current_lsn()
    }

    /// Number of live records of `entity_type`
    pub fn len(&self, entity_type: &str) -> usize {
        self.index.read().get(entity_type).map_or(0, HashMap::len)
    }

    pub fn is_empty(&self) -> bool {
        self.index.read().values().all(HashMap::is_empty)
    }
}

/// Higher version wins; deletes drop the record
fn apply(index: &mut Index, ops: &[DataOp]) {
    for op in ops {
        let records = index.entry(op.record.type_name.clone()).or_default();
        match op.kind {
            DataOpKind::Insert | DataOpKind::Update => {
                let newer = records
                    .get(&op.record.key)
                    .map_or(true, |current| op.record.version > current.version);
                if newer {
                    records.insert(op.record.key.clone(), op.record.clone());
                }
            }
            DataOpKind::Delete => {
                records.remove(&op.record.key);
            }
            DataOpKind::Ignore => {}
        }
    }
}

impl Backend for WalBackup {
    fn name(&self) -> &str {
        "wal-backup"
    }

    fn run(&self, ops: &[DataOp]) -> Result<BackendResult> {
        let lsn = self.writer.lock().append(ops.to_vec())?;
        apply(&mut self.index.write(), ops);

        tracing::trace!(lsn, ops = ops.len(), "batch written to backup");
        Ok(BackendResult::success())
    }

    /// Field predicates cannot be decided on type-erased records; every
    /// record of the type is returned and the caller filters
    fn query(&self, entity_type: &str, query: &Query) -> Result<Option<QueryResult>> {
        let index = self.index.read();
        let records = index
            .get(entity_type)
            .map(|records| {
                records
                    .values()
                    .filter(|record| query.matches_key(&record.key).unwrap_or(true))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();

        Ok(Some(QueryResult::new(true, records)))
    }
}
