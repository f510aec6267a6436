//! Tests for StorageManager and TableHandle
//!
//! These tests verify:
//! - Building tables from sorted entries
//! - Lookups across tables, newest first, tombstones included
//! - Lazy readers validated against manifest metadata
//! - Retired tables are deleted once the last handle goes away
//! - Orphan cleanup
//! - Fetching missing tables from a cloud mirror

use std::collections::BTreeSet;
use std::fs;
use std::sync::Arc;

use cirruskv::cloud::{BucketOptions, CloudBackend, CloudEnv, CloudOptions, PersistentCache};
use cirruskv::memtable::SeqEntry;
use cirruskv::storage::{table_file_name, StorageManager, TableHandle};
use cirruskv::{CirrusError, Result};
use tempfile::TempDir;

use super::{tombstone, value};

fn entries(items: &[(&str, SeqEntry)]) -> Vec<Result<(Vec<u8>, SeqEntry)>> {
    items
        .iter()
        .map(|(k, e)| Ok((k.as_bytes().to_vec(), e.clone())))
        .collect()
}

fn build_handle(storage: &StorageManager, number: u64, items: &[(&str, SeqEntry)]) -> Arc<TableHandle> {
    let (meta, reader) = storage.build_table(number, entries(items)).unwrap().unwrap();
    Arc::new(TableHandle::with_reader(meta, reader))
}

#[test]
fn test_open_creates_directory() {
    let temp = TempDir::new().unwrap();
    let dir = temp.path().join("tables");

    let storage = StorageManager::open(&dir, None, None).unwrap();

    assert!(dir.is_dir());
    assert_eq!(storage.table_path(3), dir.join("000003.sst"));
}

#[test]
fn test_build_table_metadata() {
    let temp = TempDir::new().unwrap();
    let storage = StorageManager::open(temp.path(), None, None).unwrap();

    let (meta, _) = storage
        .build_table(5, entries(&[("a", value(3, "x")), ("m", value(8, "y"))]))
        .unwrap()
        .unwrap();

    assert_eq!(meta.number, 5);
    assert_eq!(meta.entry_count, 2);
    assert_eq!(meta.max_seq, 8);
    assert_eq!(meta.smallest_key, b"a".to_vec());
    assert_eq!(meta.largest_key, b"m".to_vec());
    assert_eq!(meta.file_size, fs::metadata(storage.table_path(5)).unwrap().len());
}

#[test]
fn test_build_empty_table_leaves_no_file() {
    let temp = TempDir::new().unwrap();
    let storage = StorageManager::open(temp.path(), None, None).unwrap();

    let built = storage.build_table(1, Vec::new()).unwrap();

    assert!(built.is_none());
    assert_eq!(fs::read_dir(temp.path()).unwrap().count(), 0);
}

#[test]
fn test_get_newest_table_wins() {
    let temp = TempDir::new().unwrap();
    let storage = StorageManager::open(temp.path(), None, None).unwrap();

    let old = build_handle(&storage, 1, &[("k", value(1, "old")), ("only_old", value(2, "o"))]);
    let new = build_handle(&storage, 2, &[("k", value(5, "new"))]);
    let tables = vec![new, old];

    assert_eq!(storage.get(&tables, b"k").unwrap(), Some(value(5, "new")));
    assert_eq!(storage.get(&tables, b"only_old").unwrap(), Some(value(2, "o")));
    assert_eq!(storage.get(&tables, b"missing").unwrap(), None);
}

#[test]
fn test_get_returns_tombstone() {
    let temp = TempDir::new().unwrap();
    let storage = StorageManager::open(temp.path(), None, None).unwrap();

    let old = build_handle(&storage, 1, &[("k", value(1, "v"))]);
    let new = build_handle(&storage, 2, &[("k", tombstone(2))]);

    let found = storage.get(&[new, old], b"k").unwrap().unwrap();
    assert!(found.entry.is_tombstone());
}

#[test]
fn test_lazy_reader_checks_metadata() {
    let temp = TempDir::new().unwrap();
    let storage = StorageManager::open(temp.path(), None, None).unwrap();
    let (meta, _) = storage
        .build_table(1, entries(&[("a", value(1, "1"))]))
        .unwrap()
        .unwrap();

    let handle = TableHandle::new(meta.clone());
    assert!(!handle.is_open());
    handle.reader(&storage).unwrap();
    assert!(handle.is_open());

    let mut wrong = meta;
    wrong.entry_count = 99;
    let mismatched = TableHandle::new(wrong);
    assert!(matches!(
        mismatched.reader(&storage),
        Err(CirrusError::TableCorruption(_))
    ));
}

#[test]
fn test_missing_table_without_cloud_is_error() {
    let temp = TempDir::new().unwrap();
    let storage = StorageManager::open(temp.path(), None, None).unwrap();

    assert!(matches!(
        storage.materialize(&table_file_name(42)),
        Err(CirrusError::Storage(_))
    ));
}

#[test]
fn test_retired_table_deleted_on_last_drop() {
    let temp = TempDir::new().unwrap();
    let storage = StorageManager::open(temp.path(), None, None).unwrap();
    let handle = build_handle(&storage, 1, &[("a", value(1, "1"))]);
    let path = storage.table_path(1);

    let reader_ref = Arc::clone(&handle);
    handle.retire(path.clone());
    drop(handle);
    assert!(path.exists());

    drop(reader_ref);
    assert!(!path.exists());
}

#[test]
fn test_remove_orphans() {
    let temp = TempDir::new().unwrap();
    let storage = StorageManager::open(temp.path(), None, None).unwrap();
    build_handle(&storage, 1, &[("a", value(1, "1"))]);
    build_handle(&storage, 2, &[("b", value(2, "2"))]);
    fs::write(temp.path().join("000003.sst.tmp"), b"partial").unwrap();

    let live: BTreeSet<u64> = [1].into_iter().collect();
    let removed = storage.remove_orphans(&live).unwrap();

    assert_eq!(removed, 2);
    assert!(storage.table_path(1).exists());
    assert!(!storage.table_path(2).exists());
    assert!(!temp.path().join("000003.sst.tmp").exists());
}

#[test]
fn test_materialize_from_cloud_into_cache() {
    let temp = TempDir::new().unwrap();
    let root = temp.path().join("buckets");

    // A table that only exists in the bucket
    let bucket = BucketOptions::new("db", "main");
    let options = CloudOptions::new(CloudBackend::LocalFileSystem { root: root.clone() })
        .dest_bucket(bucket);
    let env = Arc::new(CloudEnv::new(&options).unwrap());

    let staging = StorageManager::open(&temp.path().join("staging"), None, None).unwrap();
    staging
        .build_table(7, entries(&[("k", value(1, "from-cloud"))]))
        .unwrap()
        .unwrap();
    env.upload_file(&staging.table_path(7), &table_file_name(7)).unwrap();

    let cache = Arc::new(PersistentCache::open(&temp.path().join("cache"), 0).unwrap());
    let storage = StorageManager::open(
        &temp.path().join("tables"),
        Some(Arc::clone(&cache)),
        Some(env),
    )
    .unwrap();

    let path = storage.materialize(&table_file_name(7)).unwrap();

    assert!(path.starts_with(cache.dir()));
    assert!(cache.contains(&table_file_name(7)));
    assert!(!storage.table_path(7).exists());

    storage.fetch_table(7).unwrap();
    assert!(storage.table_path(7).exists());
}
