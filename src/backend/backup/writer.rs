//! Backup log writer
//!
//! Appends entries and syncs every write before acknowledging it.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;

use crate::entity::DataOp;
use crate::error::Result;
use super::BackupEntry;

/// Appends entries to the backup log
pub struct BackupWriter {
    file: File,
    current_lsn: u64,
}

impl BackupWriter {
    /// Open or create a log whose last valid entry has `last_lsn`
    pub fn open(path: &Path, last_lsn: u64) -> Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            file,
            current_lsn: last_lsn,
        })
    }

    /// Append one batch; returns its LSN
    pub fn append(&mut self, ops: Vec<DataOp>) -> Result<u64> {
        let entry = BackupEntry::new(self.current_lsn + 1, ops);
        let bytes = entry.serialize()?;

        self.file.write_all(&bytes)?;
        self.sync()?;

        self.current_lsn = entry.lsn;
        Ok(entry.lsn)
    }

    /// Force sync to disk
    pub fn sync(&mut self) -> Result<()> {
        self.file.sync_data()?;
        Ok(())
    }

    pub fn current_lsn(&self) -> u64 {
        self.current_lsn
    }
}
