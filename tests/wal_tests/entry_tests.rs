//! Tests for WAL entry framing
//!
//! These tests verify:
//! - Frame encoding and decoding of multi-operation batches
//! - CRC32 corruption detection
//! - Sequence range bookkeeping

use cirruskv::batch::Operation;
use cirruskv::wal::{WalEntry, HEADER_SIZE};
use cirruskv::CirrusError;

use super::{batch_entry, put};

#[test]
fn test_encode_decode_batch() {
    let entry = WalEntry::new(
        7,
        vec![
            put("a", "1"),
            Operation::Delete {
                cf_id: 3,
                key: b"b".to_vec(),
            },
        ],
    );

    let frame = entry.encode().unwrap();
    let decoded = WalEntry::decode_frame(&frame).unwrap();

    assert_eq!(decoded, entry);
    assert_eq!(decoded.operations[1].cf_id(), 3);
}

#[test]
fn test_frame_header_layout() {
    let entry = batch_entry(42, &["k"]);
    let frame = entry.encode().unwrap();

    let mut lsn = [0u8; 8];
    lsn.copy_from_slice(&frame[0..8]);
    let mut len = [0u8; 4];
    len.copy_from_slice(&frame[12..16]);

    assert_eq!(u64::from_le_bytes(lsn), 42);
    assert_eq!(u32::from_le_bytes(len) as usize, frame.len() - HEADER_SIZE);
}

#[test]
fn test_last_lsn_covers_every_operation() {
    assert_eq!(batch_entry(10, &["a", "b", "c"]).last_lsn(), 12);
    assert_eq!(batch_entry(10, &["a"]).last_lsn(), 10);
}

#[test]
fn test_crc_corruption_detected() {
    let mut frame = batch_entry(1, &["key"]).encode().unwrap();
    if let Some(byte) = frame.last_mut() {
        *byte ^= 0xFF;
    }

    let result = WalEntry::decode_frame(&frame);
    assert!(matches!(result, Err(CirrusError::WalCorruption(_))));
}

#[test]
fn test_crc_corruption_in_header_detected() {
    let mut frame = batch_entry(1, &["key"]).encode().unwrap();
    frame[8] ^= 0xFF;

    assert!(WalEntry::decode_frame(&frame).is_err());
}

#[test]
fn test_truncated_frame_rejected() {
    let frame = batch_entry(1, &["key"]).encode().unwrap();

    let short = &frame[..frame.len() - 1];
    assert!(matches!(
        WalEntry::decode_frame(short),
        Err(CirrusError::WalCorruption(_))
    ));
    assert!(WalEntry::decode_frame(&frame[..HEADER_SIZE - 1]).is_err());
}
