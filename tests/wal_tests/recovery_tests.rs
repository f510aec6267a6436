//! Tests for WAL recovery across segments
//!
//! These tests verify:
//! - Recovery from a clean WAL directory
//! - Recovery from an empty or missing directory
//! - Torn tail truncation in the last segment
//! - Corruption in an earlier segment is fatal
//! - Damage in the middle of the last segment is fatal
//! - Verify mode reports without modifying

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::Path;

use cirruskv::config::WalSyncStrategy;
use cirruskv::wal::{segment_path, WalRecovery, WalWriter};
use cirruskv::CirrusError;
use tempfile::TempDir;

use super::batch_entry;

fn write_segment(dir: &Path, number: u64, lsns: &[u64]) {
    let mut writer =
        WalWriter::open(&segment_path(dir, number), WalSyncStrategy::EveryWrite).unwrap();
    for lsn in lsns {
        writer.append(&batch_entry(*lsn, &["k"]), false).unwrap();
    }
}

fn overwrite(path: &Path, offset: usize, bytes: &[u8]) {
    let mut data = fs::read(path).unwrap();
    data[offset..offset + bytes.len()].copy_from_slice(bytes);
    fs::write(path, data).unwrap();
}

fn append_garbage(path: &Path, bytes: &[u8]) {
    let mut file = OpenOptions::new().append(true).open(path).unwrap();
    file.write_all(bytes).unwrap();
}

#[test]
fn test_recover_missing_directory() {
    let temp = TempDir::new().unwrap();

    let (entries, result) = WalRecovery::recover(&temp.path().join("nope")).unwrap();

    assert!(entries.is_empty());
    assert_eq!(result.segments_replayed, 0);
    assert_eq!(result.last_lsn, 0);
}

#[test]
fn test_recover_segments_in_order() {
    let temp = TempDir::new().unwrap();
    write_segment(temp.path(), 2, &[4, 5]);
    write_segment(temp.path(), 1, &[1, 2, 3]);

    let (entries, result) = WalRecovery::recover(temp.path()).unwrap();

    let lsns: Vec<u64> = entries.iter().map(|e| e.lsn).collect();
    assert_eq!(lsns, vec![1, 2, 3, 4, 5]);
    assert_eq!(result.segments_replayed, 2);
    assert_eq!(result.entries_recovered, 5);
    assert_eq!(result.last_lsn, 5);
    assert!(!result.torn_tail);
}

#[test]
fn test_recover_truncates_torn_tail() {
    let temp = TempDir::new().unwrap();
    write_segment(temp.path(), 1, &[1, 2]);
    let path = segment_path(temp.path(), 1);
    let valid_len = fs::metadata(&path).unwrap().len();

    let frame = batch_entry(3, &["torn"]).encode().unwrap();
    append_garbage(&path, &frame[..frame.len() - 3]);

    let (entries, result) = WalRecovery::recover(temp.path()).unwrap();

    assert_eq!(entries.len(), 2);
    assert!(result.torn_tail);
    assert!(result.was_truncated);
    assert_eq!(result.bytes_truncated, frame.len() as u64 - 3);
    assert_eq!(fs::metadata(&path).unwrap().len(), valid_len);
}

#[test]
fn test_verify_does_not_modify() {
    let temp = TempDir::new().unwrap();
    write_segment(temp.path(), 1, &[1]);
    let path = segment_path(temp.path(), 1);
    append_garbage(&path, &[1, 2, 3, 4, 5]);
    let len_before = fs::metadata(&path).unwrap().len();

    let result = WalRecovery::verify(temp.path()).unwrap();

    assert!(result.torn_tail);
    assert!(!result.was_truncated);
    assert_eq!(result.bytes_truncated, 5);
    assert_eq!(fs::metadata(&path).unwrap().len(), len_before);
}

#[test]
fn test_torn_earlier_segment_is_corruption() {
    let temp = TempDir::new().unwrap();
    write_segment(temp.path(), 1, &[1]);
    write_segment(temp.path(), 2, &[2]);
    append_garbage(&segment_path(temp.path(), 1), &[9, 9, 9]);

    let result = WalRecovery::recover(temp.path());
    assert!(matches!(result, Err(CirrusError::WalCorruption(_))));
}

#[test]
fn test_recover_truncates_zero_filled_tail() {
    let temp = TempDir::new().unwrap();
    write_segment(temp.path(), 1, &[1, 2]);
    let path = segment_path(temp.path(), 1);
    let valid_len = fs::metadata(&path).unwrap().len();
    append_garbage(&path, &[0u8; 64]);

    let (entries, result) = WalRecovery::recover(temp.path()).unwrap();

    assert_eq!(entries.len(), 2);
    assert!(result.torn_tail);
    assert_eq!(fs::metadata(&path).unwrap().len(), valid_len);
}

#[test]
fn test_zeroed_header_mid_segment_is_corruption() {
    let temp = TempDir::new().unwrap();
    write_segment(temp.path(), 1, &[1, 2, 3]);
    let path = segment_path(temp.path(), 1);
    let frame_len = batch_entry(1, &["k"]).encode().unwrap().len();
    let len_before = fs::metadata(&path).unwrap().len();

    overwrite(&path, frame_len, &[0u8; 16]);

    let result = WalRecovery::recover(temp.path());
    assert!(matches!(result, Err(CirrusError::WalCorruption(_))));
    assert_eq!(fs::metadata(&path).unwrap().len(), len_before);
}

#[test]
fn test_oversized_length_mid_segment_is_corruption() {
    let temp = TempDir::new().unwrap();
    write_segment(temp.path(), 1, &[1, 2, 3]);
    let path = segment_path(temp.path(), 1);
    let len_before = fs::metadata(&path).unwrap().len();

    // High bit of the first frame's length field
    let mut byte = fs::read(&path).unwrap()[15];
    byte ^= 0x80;
    overwrite(&path, 15, &[byte]);

    let result = WalRecovery::recover(temp.path());
    assert!(matches!(result, Err(CirrusError::WalCorruption(_))));
    assert_eq!(fs::metadata(&path).unwrap().len(), len_before);
}

#[test]
fn test_list_segments_ignores_other_files() {
    let temp = TempDir::new().unwrap();
    write_segment(temp.path(), 3, &[1]);
    fs::write(temp.path().join("notes.txt"), b"x").unwrap();
    fs::create_dir(temp.path().join("archive")).unwrap();

    let segments = WalRecovery::list_segments(temp.path()).unwrap();
    let numbers: Vec<u64> = segments.iter().map(|(n, _)| *n).collect();
    assert_eq!(numbers, vec![3]);
}
