//! Tests for the read and write paths
//!
//! These tests verify:
//! - Basic put/get/delete
//! - Atomic batches and flushing them to tables
//! - Iteration order, seek and upper bounds
//! - Snapshot isolation of iterators
//! - Compaction and concurrent writers

use std::sync::Arc;
use std::thread;

use cirruskv::{Db, FlushOptions, Options, ReadOptions, WalSyncStrategy, WriteBatch, WriteOptions};
use tempfile::TempDir;

use super::{get, open, put, test_options};

#[test]
fn test_put_get_delete() {
    let temp = TempDir::new().unwrap();
    let db = open(temp.path());

    put(&db, "name", "cirrus");
    assert_eq!(get(&db, "name").as_deref(), Some("cirrus"));

    put(&db, "name", "stratus");
    assert_eq!(get(&db, "name").as_deref(), Some("stratus"));

    db.delete(&WriteOptions::default(), "name").unwrap();
    assert_eq!(get(&db, "name"), None);
    assert_eq!(get(&db, "never-written"), None);

    db.close().unwrap();
}

#[test]
fn test_sequence_advances_per_operation() {
    let temp = TempDir::new().unwrap();
    let db = open(temp.path());

    let mut batch = WriteBatch::new();
    batch.put("a", "1");
    batch.put("b", "2");
    batch.delete("c");
    db.write(&WriteOptions::default(), batch).unwrap();

    assert_eq!(db.latest_sequence_number(), 3);

    // Empty batches are a no-op
    db.write(&WriteOptions::default(), WriteBatch::new()).unwrap();
    assert_eq!(db.latest_sequence_number(), 3);
}

#[test]
fn test_batch_flush_and_iterate_in_order() {
    let temp = TempDir::new().unwrap();
    let db = open(temp.path());

    let mut batch = WriteBatch::new();
    for i in (0..1000).rev() {
        batch.put(format!("key{:04}", i), format!("value{}", i));
    }
    db.write(&WriteOptions::default(), batch).unwrap();
    db.flush(&FlushOptions::default()).unwrap();

    let default = db.cf_handle("default").unwrap();
    assert_eq!(db.sstable_count_cf(&default).unwrap(), 1);
    assert_eq!(db.memtable_size_cf(&default).unwrap(), 0);

    let mut iter = db.iterator(&ReadOptions::default()).unwrap();
    iter.seek_to_first();
    let entries = iter.collect_remaining().unwrap();

    assert_eq!(entries.len(), 1000);
    for (i, (key, value)) in entries.iter().enumerate() {
        assert_eq!(key, format!("key{:04}", i).as_bytes());
        assert_eq!(value, format!("value{}", i).as_bytes());
    }
}

#[test]
fn test_reads_merge_memtable_and_tables() {
    let temp = TempDir::new().unwrap();
    let db = open(temp.path());

    put(&db, "a", "old");
    put(&db, "b", "kept");
    db.flush(&FlushOptions::default()).unwrap();

    put(&db, "a", "new");
    db.delete(&WriteOptions::default(), "b").unwrap();
    put(&db, "c", "fresh");

    assert_eq!(get(&db, "a").as_deref(), Some("new"));
    assert_eq!(get(&db, "b"), None);

    let mut iter = db.iterator(&ReadOptions::default()).unwrap();
    iter.seek_to_first();
    let keys: Vec<Vec<u8>> = iter
        .collect_remaining()
        .unwrap()
        .into_iter()
        .map(|(k, _)| k)
        .collect();
    assert_eq!(keys, vec![b"a".to_vec(), b"c".to_vec()]);
}

#[test]
fn test_seek_and_upper_bound() {
    let temp = TempDir::new().unwrap();
    let db = open(temp.path());
    for i in 0..20 {
        put(&db, &format!("k{:02}", i), "v");
    }

    let opts = ReadOptions::default().iterate_upper_bound("k10");
    let mut iter = db.iterator(&opts).unwrap();
    iter.seek("k05");

    assert_eq!(iter.key(), Some(&b"k05"[..]));
    assert_eq!(iter.collect_remaining().unwrap().len(), 5);
    assert!(!iter.valid());
    assert_eq!(iter.key(), None);
}

#[test]
fn test_iterator_sees_snapshot() {
    let temp = TempDir::new().unwrap();
    let db = open(temp.path());
    put(&db, "a", "1");

    let mut iter = db.iterator(&ReadOptions::default()).unwrap();
    put(&db, "b", "2");
    put(&db, "a", "changed");

    iter.seek_to_first();
    let entries = iter.collect_remaining().unwrap();
    assert_eq!(entries, vec![(b"a".to_vec(), b"1".to_vec())]);
}

#[test]
fn test_small_memtable_flushes_in_background() {
    let temp = TempDir::new().unwrap();
    let options = Options::builder()
        .wal_sync_strategy(WalSyncStrategy::EveryNEntries { count: 50 })
        .memtable_size_limit(4 * 1024)
        .level0_compaction_trigger(4)
        .build();
    let db = Db::open(&options, temp.path()).unwrap();

    for i in 0..2000 {
        put(&db, &format!("key{:05}", i), &"x".repeat(64));
    }
    db.flush(&FlushOptions::default()).unwrap();

    let default = db.cf_handle("default").unwrap();
    assert!(db.sstable_count_cf(&default).unwrap() >= 1);

    // Queued behind any compaction the flushes triggered
    db.compact_cf(&default).unwrap();
    assert_eq!(db.sstable_count_cf(&default).unwrap(), 1);
    for i in (0..2000).step_by(97) {
        assert!(get(&db, &format!("key{:05}", i)).is_some());
    }
    assert!(db.background_error().is_none());
}

#[test]
fn test_compaction_merges_and_drops_tombstones() {
    let temp = TempDir::new().unwrap();
    let db = open(temp.path());
    let default = db.cf_handle("default").unwrap();

    put(&db, "a", "1");
    put(&db, "b", "1");
    db.flush(&FlushOptions::default()).unwrap();
    put(&db, "a", "2");
    db.delete(&WriteOptions::default(), "b").unwrap();
    db.flush(&FlushOptions::default()).unwrap();
    put(&db, "c", "1");
    db.flush(&FlushOptions::default()).unwrap();
    assert_eq!(db.sstable_count_cf(&default).unwrap(), 3);

    db.compact_cf(&default).unwrap();

    assert_eq!(db.sstable_count_cf(&default).unwrap(), 1);
    assert_eq!(get(&db, "a").as_deref(), Some("2"));
    assert_eq!(get(&db, "b"), None);
    assert_eq!(get(&db, "c").as_deref(), Some("1"));

    // Only the manifest and the compacted table remain live
    assert_eq!(db.live_files().unwrap().len(), 2);
}

#[test]
fn test_concurrent_writers() {
    let temp = TempDir::new().unwrap();
    let db = Arc::new(Db::open(&test_options(), temp.path()).unwrap());

    let writers: Vec<_> = (0..4)
        .map(|t| {
            let db = Arc::clone(&db);
            thread::spawn(move || {
                for i in 0..100 {
                    let key = format!("t{}-{:03}", t, i);
                    db.put(&WriteOptions::default(), &key, &key).unwrap();
                }
            })
        })
        .collect();
    for writer in writers {
        writer.join().unwrap();
    }

    assert_eq!(db.latest_sequence_number(), 400);
    for t in 0..4 {
        for i in 0..100 {
            let key = format!("t{}-{:03}", t, i);
            assert_eq!(get(&db, &key).as_deref(), Some(key.as_str()));
        }
    }
}
