//! Tests for the WAL segment reader
//!
//! These tests verify:
//! - Sequential reads of valid segments
//! - Torn tail detection (partial frame, zero fill)
//! - Mid-segment corruption is an error, not a tail

use std::fs::{self, OpenOptions};
use std::io::Write;

use cirruskv::config::WalSyncStrategy;
use cirruskv::wal::{segment_path, WalReader, WalTail, WalWriter};
use cirruskv::CirrusError;
use tempfile::TempDir;

use super::batch_entry;

fn write_segment(dir: &std::path::Path, count: u64) -> std::path::PathBuf {
    let path = segment_path(dir, 1);
    let mut writer = WalWriter::open(&path, WalSyncStrategy::EveryWrite).unwrap();
    for i in 0..count {
        writer.append(&batch_entry(i + 1, &["key"]), false).unwrap();
    }
    path
}

#[test]
fn test_read_all_entries() {
    let temp = TempDir::new().unwrap();
    let path = write_segment(temp.path(), 5);

    let mut reader = WalReader::open(&path).unwrap();
    let mut lsns = Vec::new();
    while let Some(entry) = reader.next_entry().unwrap() {
        lsns.push(entry.lsn);
    }

    assert_eq!(lsns, vec![1, 2, 3, 4, 5]);
    assert_eq!(reader.tail(), WalTail::Clean);
    assert_eq!(reader.position(), reader.file_len());
}

#[test]
fn test_empty_segment() {
    let temp = TempDir::new().unwrap();
    let path = write_segment(temp.path(), 0);

    let mut reader = WalReader::open(&path).unwrap();
    assert!(reader.next_entry().unwrap().is_none());
    assert_eq!(reader.tail(), WalTail::Clean);
}

#[test]
fn test_partial_final_frame_is_torn_tail() {
    let temp = TempDir::new().unwrap();
    let path = write_segment(temp.path(), 3);
    let valid_len = fs::metadata(&path).unwrap().len();

    let frame = batch_entry(4, &["partial"]).encode().unwrap();
    let mut file = OpenOptions::new().append(true).open(&path).unwrap();
    file.write_all(&frame[..frame.len() / 2]).unwrap();

    let mut iter = WalReader::open(&path).unwrap().entries();
    let count = iter.by_ref().filter(|e| e.is_ok()).count();

    assert_eq!(count, 3);
    assert_eq!(iter.tail(), WalTail::Torn { offset: valid_len });
}

#[test]
fn test_zero_filled_tail_is_torn() {
    let temp = TempDir::new().unwrap();
    let path = write_segment(temp.path(), 2);

    let mut file = OpenOptions::new().append(true).open(&path).unwrap();
    file.write_all(&[0u8; 64]).unwrap();

    let mut reader = WalReader::open(&path).unwrap();
    assert!(reader.next_entry().unwrap().is_some());
    assert!(reader.next_entry().unwrap().is_some());
    assert!(reader.next_entry().unwrap().is_none());
    assert!(matches!(reader.tail(), WalTail::Torn { .. }));
}

#[test]
fn test_corruption_before_last_frame_is_error() {
    let temp = TempDir::new().unwrap();
    let path = write_segment(temp.path(), 3);

    // Flip a byte inside the first frame's body
    let mut bytes = fs::read(&path).unwrap();
    bytes[20] ^= 0xFF;
    fs::write(&path, &bytes).unwrap();

    let mut reader = WalReader::open(&path).unwrap();
    let result = reader.next_entry();
    assert!(matches!(result, Err(CirrusError::WalCorruption(_))));
}
