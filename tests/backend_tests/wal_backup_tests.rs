//! Tests for the log-backed backup store
//!
//! These tests verify:
//! - Entry framing and checksum detection
//! - Append and replay across reopen
//! - Recovery with partial writes (truncated tail)
//! - Recovery with corrupted entries (CRC mismatch)
//! - Queries: owned answers, higher version wins, deletes

#[path = "../common/mod.rs"]
mod common;

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::PathBuf;

use atlasrepo::backend::backup::{BackupEntry, BackupRecovery, BackupWriter, HEADER_SIZE};
use atlasrepo::backend::{Backend, WalBackup};
use atlasrepo::{DataOp, EntityRecord, KeyBytes, Query};
use common::Account;
use tempfile::TempDir;

// =============================================================================
// Helper Functions
// =============================================================================

fn setup_temp_log() -> (TempDir, PathBuf) {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("backup.wal");
    (temp_dir, path)
}

fn record(id: u64, version: u64, balance: i64) -> EntityRecord {
    let mut account = Account::new(id, "ann", balance);
    account.version = version;
    EntityRecord::from_entity(&account).unwrap()
}

fn write_raw_entries(path: &PathBuf, entries: &[BackupEntry]) {
    let mut file = File::create(path).unwrap();
    for entry in entries {
        file.write_all(&entry.serialize().unwrap()).unwrap();
    }
    file.sync_all().unwrap();
}

// =============================================================================
// Entry Tests
// =============================================================================

#[test]
fn test_entry_roundtrip_and_header() {
    let entry = BackupEntry::new(3, vec![DataOp::insert(record(1, 1, 10))]);
    let bytes = entry.serialize().unwrap();

    assert!(bytes.len() > HEADER_SIZE);
    assert_eq!(&bytes[0..8], &3u64.to_be_bytes());
    assert_eq!(BackupEntry::deserialize(&bytes).unwrap(), entry);
}

#[test]
fn test_entry_detects_flipped_bit() {
    let entry = BackupEntry::new(1, vec![DataOp::insert(record(1, 1, 10))]);
    let mut bytes = entry.serialize().unwrap();
    let last = bytes.len() - 1;
    bytes[last] ^= 0xFF;

    assert!(BackupEntry::deserialize(&bytes).is_err());
    assert!(BackupEntry::deserialize(&bytes[..HEADER_SIZE - 1]).is_err());
}

// =============================================================================
// Writer / Replay Tests
// =============================================================================

#[test]
fn test_writer_assigns_increasing_lsns() {
    let (_temp, path) = setup_temp_log();
    let mut writer = BackupWriter::open(&path, 0).unwrap();

    assert_eq!(writer.append(vec![DataOp::insert(record(1, 1, 1))]).unwrap(), 1);
    assert_eq!(writer.append(vec![DataOp::insert(record(2, 1, 1))]).unwrap(), 2);
    assert_eq!(writer.current_lsn(), 2);

    let (entries, result) = BackupRecovery::recover(&path).unwrap();
    assert_eq!(entries.len(), 2);
    assert_eq!(result.last_lsn, 2);
    assert!(!result.was_truncated);
}

#[test]
fn test_reopen_replays_and_continues_lsn() {
    let (_temp, path) = setup_temp_log();
    {
        let backup = WalBackup::open(&path).unwrap();
        assert!(backup.is_empty());
        backup.run(&[DataOp::insert(record(1, 1, 10))]).unwrap();
        backup.run(&[DataOp::update(record(1, 2, 20)), DataOp::insert(record(2, 1, 5))]).unwrap();
    }

    let backup = WalBackup::open(&path).unwrap();
    assert_eq!(backup.recovery().entries_recovered, 2);
    assert_eq!(backup.current_lsn(), 2);
    assert_eq!(backup.len("Account"), 2);

    backup.run(&[DataOp::delete(record(2, 2, 5))]).unwrap();
    assert_eq!(backup.current_lsn(), 3);
    assert_eq!(backup.len("Account"), 1);

    let result = backup.query("Account", &Query::All).unwrap().unwrap();
    let accounts: Vec<Account> = result.decode().unwrap();
    assert_eq!(accounts.len(), 1);
    assert_eq!(accounts[0].balance, 20);
    assert_eq!(accounts[0].version, 2);
}

// =============================================================================
// Recovery Tests
// =============================================================================

#[test]
fn test_recover_missing_file() {
    let (_temp, path) = setup_temp_log();
    let (entries, result) = BackupRecovery::recover(&path).unwrap();

    assert!(entries.is_empty());
    assert_eq!(result.last_lsn, 0);
}

#[test]
fn test_recover_truncates_torn_tail() {
    let (_temp, path) = setup_temp_log();
    let entries = vec![
        BackupEntry::new(1, vec![DataOp::insert(record(1, 1, 1))]),
        BackupEntry::new(2, vec![DataOp::insert(record(2, 1, 1))]),
    ];
    write_raw_entries(&path, &entries);
    let valid_len = std::fs::metadata(&path).unwrap().len();

    // Half of a third entry
    let torn = BackupEntry::new(3, vec![DataOp::insert(record(3, 1, 1))]).serialize().unwrap();
    let mut file = OpenOptions::new().append(true).open(&path).unwrap();
    file.write_all(&torn[..torn.len() / 2]).unwrap();
    drop(file);

    let verified = BackupRecovery::verify(&path).unwrap();
    assert!(verified.was_truncated);
    assert!(std::fs::metadata(&path).unwrap().len() > valid_len);

    let (recovered, result) = BackupRecovery::recover(&path).unwrap();
    assert_eq!(recovered, entries);
    assert_eq!(result.entries_recovered, 2);
    assert_eq!(result.last_lsn, 2);
    assert!(result.was_truncated);
    assert_eq!(std::fs::metadata(&path).unwrap().len(), valid_len);

    // Appends continue after the cut
    let backup = WalBackup::open(&path).unwrap();
    backup.run(&[DataOp::insert(record(3, 1, 1))]).unwrap();
    assert_eq!(backup.current_lsn(), 3);
    assert!(!BackupRecovery::verify(&path).unwrap().was_truncated);
}

#[test]
fn test_recover_skips_corrupted_entry() {
    let (_temp, path) = setup_temp_log();
    let first = BackupEntry::new(1, vec![DataOp::insert(record(1, 1, 1))]);
    let second = BackupEntry::new(2, vec![DataOp::insert(record(2, 1, 1))]);
    let third = BackupEntry::new(3, vec![DataOp::insert(record(3, 1, 1))]);

    let mut bytes = first.serialize().unwrap();
    let mut corrupted = second.serialize().unwrap();
    corrupted[HEADER_SIZE] ^= 0xFF;
    bytes.extend_from_slice(&corrupted);
    bytes.extend_from_slice(&third.serialize().unwrap());
    std::fs::write(&path, &bytes).unwrap();

    let (entries, result) = BackupRecovery::recover(&path).unwrap();
    assert_eq!(entries, vec![first, third]);
    assert_eq!(result.entries_corrupted, 1);
    assert_eq!(result.last_lsn, 3);
    assert!(!result.was_truncated);
}

// =============================================================================
// Query Tests
// =============================================================================

#[test]
fn test_query_is_owned_and_filters_ids() {
    let (_temp, path) = setup_temp_log();
    let backup = WalBackup::open(&path).unwrap();
    backup
        .run(&[
            DataOp::insert(record(1, 1, 1)),
            DataOp::insert(record(2, 1, 2)),
            DataOp::insert(record(3, 1, 3)),
        ])
        .unwrap();

    let ids = Query::by_ids([1u64, 3].iter()).unwrap();
    let result = backup.query("Account", &ids).unwrap().unwrap();
    assert!(result.owned);
    let mut keys: Vec<KeyBytes> = result.records.iter().map(|r| r.key.clone()).collect();
    keys.sort();
    let mut expected = vec![KeyBytes::encode(&1u64).unwrap(), KeyBytes::encode(&3u64).unwrap()];
    expected.sort();
    assert_eq!(keys, expected);

    // Unknown types are owned and empty
    let other = backup.query("Order", &Query::All).unwrap().unwrap();
    assert!(other.owned);
    assert!(other.records.is_empty());
}

#[test]
fn test_older_versions_do_not_overwrite() {
    let (_temp, path) = setup_temp_log();
    let backup = WalBackup::open(&path).unwrap();
    backup.run(&[DataOp::insert(record(1, 3, 30))]).unwrap();
    backup.run(&[DataOp::update(record(1, 2, 20))]).unwrap();

    let result = backup.query("Account", &Query::by_id(&1u64).unwrap()).unwrap().unwrap();
    let accounts: Vec<Account> = result.decode().unwrap();
    assert_eq!(accounts[0].version, 3);
    assert_eq!(accounts[0].balance, 30);
}
