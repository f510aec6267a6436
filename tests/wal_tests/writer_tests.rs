//! Tests for the WAL segment writer

use std::fs;

use cirruskv::config::WalSyncStrategy;
use cirruskv::wal::{segment_path, WalReader, WalWriter};
use tempfile::TempDir;

use super::batch_entry;

#[test]
fn test_append_grows_segment() {
    let temp = TempDir::new().unwrap();
    let path = segment_path(temp.path(), 1);
    let mut writer = WalWriter::open(&path, WalSyncStrategy::EveryWrite).unwrap();

    assert_eq!(writer.size(), 0);
    let after_first = writer.append(&batch_entry(1, &["a"]), false).unwrap();
    let after_second = writer.append(&batch_entry(2, &["b", "c"]), false).unwrap();

    assert!(after_second > after_first);
    assert_eq!(writer.size(), fs::metadata(&path).unwrap().len());
    assert_eq!(writer.current_lsn(), 3);
}

#[test]
fn test_reopen_appends_after_existing_entries() {
    let temp = TempDir::new().unwrap();
    let path = segment_path(temp.path(), 1);

    {
        let mut writer = WalWriter::open(&path, WalSyncStrategy::EveryWrite).unwrap();
        writer.append(&batch_entry(1, &["a"]), false).unwrap();
    }
    {
        let mut writer = WalWriter::open(&path, WalSyncStrategy::EveryWrite).unwrap();
        assert!(writer.size() > 0);
        writer.append(&batch_entry(2, &["b"]), false).unwrap();
    }

    let lsns: Vec<u64> = WalReader::open(&path)
        .unwrap()
        .entries()
        .map(|e| e.unwrap().lsn)
        .collect();
    assert_eq!(lsns, vec![1, 2]);
}

#[test]
fn test_batched_sync_strategy() {
    let temp = TempDir::new().unwrap();
    let path = segment_path(temp.path(), 1);
    let mut writer =
        WalWriter::open(&path, WalSyncStrategy::EveryNEntries { count: 10 }).unwrap();

    for i in 0..25 {
        writer.append(&batch_entry(i + 1, &["k"]), false).unwrap();
    }
    writer.sync().unwrap();

    let count = WalReader::open(&path).unwrap().entries().count();
    assert_eq!(count, 25);
}

#[test]
fn test_rollback_keeps_complete_frames() {
    let temp = TempDir::new().unwrap();
    let path = segment_path(temp.path(), 1);
    let mut writer = WalWriter::open(&path, WalSyncStrategy::EveryWrite).unwrap();
    writer.append(&batch_entry(1, &["a"]), false).unwrap();
    let size = writer.size();

    writer.rollback();
    writer.append(&batch_entry(2, &["b"]), false).unwrap();

    assert!(writer.size() > size);
    let lsns: Vec<u64> = WalReader::open(&path)
        .unwrap()
        .entries()
        .map(|e| e.unwrap().lsn)
        .collect();
    assert_eq!(lsns, vec![1, 2]);
}

#[cfg(target_os = "linux")]
#[test]
fn test_failed_append_does_not_advance() {
    let full = std::path::Path::new("/dev/full");
    if !full.exists() {
        return;
    }
    let mut writer = WalWriter::open(full, WalSyncStrategy::EveryWrite).unwrap();

    assert!(writer.append(&batch_entry(1, &["a"]), true).is_err());
    assert_eq!(writer.size(), 0);
    assert_eq!(writer.current_lsn(), 0);
    assert!(writer.append(&batch_entry(1, &["a"]), true).is_err());
}
