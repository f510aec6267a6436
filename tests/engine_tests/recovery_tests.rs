//! Tests for open behaviour and crash recovery
//!
//! A `Db` dropped without `close` leaves its WAL behind exactly as a
//! crash would.

use std::fs;

use cirruskv::{CirrusError, Db, DbState, FlushOptions, Options, WalSyncStrategy, WriteOptions};
use tempfile::TempDir;

use super::{get, open, put};

#[test]
fn test_recovers_unflushed_writes_after_crash() {
    let temp = TempDir::new().unwrap();
    {
        let db = open(temp.path());
        for i in 0..50 {
            put(&db, &format!("key{:02}", i), &format!("value{}", i));
        }
        db.delete(&WriteOptions::default(), "key07").unwrap();
        // Dropped without close
    }

    let db = open(temp.path());
    assert_eq!(get(&db, "key00").as_deref(), Some("value0"));
    assert_eq!(get(&db, "key49").as_deref(), Some("value49"));
    assert_eq!(get(&db, "key07"), None);
    assert_eq!(db.latest_sequence_number(), 51);
}

#[test]
fn test_recovers_mix_of_tables_and_wal() {
    let temp = TempDir::new().unwrap();
    {
        let db = open(temp.path());
        put(&db, "flushed", "1");
        db.flush(&FlushOptions::default()).unwrap();
        put(&db, "logged", "2");
    }

    let db = open(temp.path());
    assert_eq!(get(&db, "flushed").as_deref(), Some("1"));
    assert_eq!(get(&db, "logged").as_deref(), Some("2"));

    // New writes continue after the recovered sequence
    put(&db, "after", "3");
    assert_eq!(db.latest_sequence_number(), 3);
}

#[test]
fn test_repeated_crashes_keep_data() {
    let temp = TempDir::new().unwrap();
    for round in 0..3 {
        let db = open(temp.path());
        put(&db, &format!("round{}", round), "done");
    }

    let db = open(temp.path());
    for round in 0..3 {
        assert_eq!(get(&db, &format!("round{}", round)).as_deref(), Some("done"));
    }
}

#[test]
fn test_close_flushes_everything() {
    let temp = TempDir::new().unwrap();
    let db = open(temp.path());
    assert_eq!(db.state(), DbState::Open);
    put(&db, "k", "v");
    db.close().unwrap();

    // Everything was flushed, so a reopen has nothing to replay
    let db = open(temp.path());
    assert_eq!(get(&db, "k").as_deref(), Some("v"));
    let default = db.cf_handle("default").unwrap();
    assert_eq!(db.memtable_size_cf(&default).unwrap(), 0);
}

#[test]
fn test_create_if_missing_false_on_empty_dir() {
    let temp = TempDir::new().unwrap();
    let options = Options::builder().create_if_missing(false).build();

    let result = Db::open(&options, temp.path().join("absent"));
    assert!(matches!(result, Err(CirrusError::InvalidArgument(_))));

    // An existing but empty directory stays empty
    let result = Db::open(&options, temp.path());
    assert!(matches!(result, Err(CirrusError::InvalidArgument(_))));
    assert_eq!(fs::read_dir(temp.path()).unwrap().count(), 0);
}

#[test]
fn test_unlogged_writes_lost_on_crash() {
    let temp = TempDir::new().unwrap();
    let unlogged = WriteOptions {
        disable_wal: true,
        ..WriteOptions::default()
    };
    {
        let db = open(temp.path());
        put(&db, "logged1", "a");
        db.put(&unlogged, "unlogged", "b").unwrap();
        put(&db, "logged2", "c");
        assert_eq!(get(&db, "unlogged").as_deref(), Some("b"));
        assert_eq!(db.latest_sequence_number(), 3);
        // Dropped without close
    }

    let db = open(temp.path());
    assert_eq!(get(&db, "logged1").as_deref(), Some("a"));
    assert_eq!(get(&db, "logged2").as_deref(), Some("c"));
    assert_eq!(get(&db, "unlogged"), None);
    assert_eq!(db.latest_sequence_number(), 3);

    put(&db, "after", "d");
    assert_eq!(db.latest_sequence_number(), 4);
    db.close().unwrap();

    let db = open(temp.path());
    assert_eq!(get(&db, "after").as_deref(), Some("d"));
    assert_eq!(get(&db, "unlogged"), None);
}

#[test]
fn test_unlogged_writes_survive_close() {
    let temp = TempDir::new().unwrap();
    let unlogged = WriteOptions {
        disable_wal: true,
        ..WriteOptions::default()
    };
    {
        let db = open(temp.path());
        db.put(&unlogged, "unlogged", "b").unwrap();
        db.close().unwrap();
    }

    let db = open(temp.path());
    assert_eq!(get(&db, "unlogged").as_deref(), Some("b"));
}

#[test]
fn test_error_if_exists() {
    let temp = TempDir::new().unwrap();
    open(temp.path()).close().unwrap();

    let options = Options::builder().error_if_exists(true).build();
    assert!(matches!(
        Db::open(&options, temp.path()),
        Err(CirrusError::InvalidArgument(_))
    ));
}

#[test]
fn test_orphan_tables_removed_on_open() {
    let temp = TempDir::new().unwrap();
    open(temp.path()).close().unwrap();

    let orphan = temp.path().join("tables").join("000099.sst");
    fs::write(&orphan, b"left behind by a crashed flush").unwrap();

    let _db = open(temp.path());
    assert!(!orphan.exists());
}

#[test]
fn test_torn_wal_tail_is_dropped() {
    let temp = TempDir::new().unwrap();
    let options = Options::builder()
        .wal_sync_strategy(WalSyncStrategy::EveryWrite)
        .build();
    {
        let db = Db::open(&options, temp.path()).unwrap();
        put(&db, "whole", "1");
    }

    // Half-written record at the end of the newest segment
    let wal_dir = temp.path().join("wal");
    let mut segments: Vec<_> = fs::read_dir(&wal_dir)
        .unwrap()
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.extension().map_or(false, |ext| ext == "log"))
        .collect();
    segments.sort();
    let newest = segments.last().unwrap();
    let mut bytes = fs::read(newest).unwrap();
    bytes.extend_from_slice(&[0x40, 0, 0, 0, 0, 0, 0, 0, 0xAB]);
    fs::write(newest, bytes).unwrap();

    let db = open(temp.path());
    assert_eq!(get(&db, "whole").as_deref(), Some("1"));
    assert_eq!(db.latest_sequence_number(), 1);
}
