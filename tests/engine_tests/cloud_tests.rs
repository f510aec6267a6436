//! Tests for cloud mirroring and bootstrap
//!
//! The bucket lives on the local filesystem; a second, empty directory
//! plays the part of a fresh machine.

use std::fs;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use cirruskv::cloud::Bucket;
use cirruskv::cloud::{CloudEnv, LogShipper};
use cirruskv::wal::WalEntry;
use cirruskv::{
    BucketOptions, CloudBackend, CloudOptions, Db, FlushOptions, LogTransport, Options,
    RetryPolicy, WalSyncStrategy,
};
use tempfile::TempDir;

use super::{get, put};

fn cloud(root: &Path) -> CloudOptions {
    CloudOptions::new(CloudBackend::LocalFileSystem {
        root: root.to_path_buf(),
    })
    .dest_bucket(BucketOptions::new("test", "node-1"))
    .retry(RetryPolicy {
        max_attempts: 2,
        initial_backoff: Duration::from_millis(1),
        max_backoff: Duration::from_millis(2),
        operation_timeout: Duration::from_secs(10),
    })
}

fn options(cloud: CloudOptions) -> Options {
    Options::builder()
        .wal_sync_strategy(WalSyncStrategy::EveryWrite)
        .cloud(cloud)
        .build()
}

fn upload_flush() -> FlushOptions {
    FlushOptions {
        wait: true,
        wait_for_upload: true,
    }
}

/// Accepts every batch and remembers each trim bound
#[derive(Default)]
struct RecordingShipper {
    trims: Mutex<Vec<u64>>,
}

impl LogShipper for RecordingShipper {
    fn ship(&self, _entry: &WalEntry) -> cirruskv::Result<()> {
        Ok(())
    }

    fn replay_after(&self, _after: u64) -> cirruskv::Result<Vec<WalEntry>> {
        Ok(Vec::new())
    }

    fn trim(&self, upto: u64) -> cirruskv::Result<()> {
        self.trims.lock().unwrap().push(upto);
        Ok(())
    }
}

#[test]
fn test_fresh_directory_bootstraps_from_bucket() {
    let bucket_root = TempDir::new().unwrap();
    let first = TempDir::new().unwrap();
    let second = TempDir::new().unwrap();

    {
        let db = Db::open(&options(cloud(bucket_root.path())), first.path()).unwrap();
        for i in 0..100 {
            put(&db, &format!("key{:03}", i), &format!("value{}", i));
        }
        db.flush(&upload_flush()).unwrap();
        db.close().unwrap();
    }

    let env = CloudEnv::new(&cloud(bucket_root.path())).unwrap();
    let objects = env.list_objects(Bucket::Dest).unwrap();
    assert!(objects.iter().any(|name| name == "MANIFEST"));
    assert!(objects.iter().any(|name| name.ends_with(".sst")));

    let db = Db::open(&options(cloud(bucket_root.path())), second.path()).unwrap();
    assert_eq!(get(&db, "key000").as_deref(), Some("value0"));
    assert_eq!(get(&db, "key099").as_deref(), Some("value99"));
    assert_eq!(db.latest_sequence_number(), 100);
}

#[test]
fn test_lazy_tables_fill_persistent_cache() {
    let bucket_root = TempDir::new().unwrap();
    let first = TempDir::new().unwrap();
    let second = TempDir::new().unwrap();
    let cache_dir = TempDir::new().unwrap();

    {
        let db = Db::open(&options(cloud(bucket_root.path())), first.path()).unwrap();
        put(&db, "cold", "read");
        db.close().unwrap();
    }

    let lazy = cloud(bucket_root.path()).keep_local_sst_files(false);
    let (db, _) = Db::open_cf_with_cache(
        &options(lazy),
        second.path(),
        Vec::new(),
        Some(cache_dir.path()),
        0,
    )
    .unwrap();

    let local_tables = fs::read_dir(second.path().join("tables")).unwrap().count();
    assert_eq!(local_tables, 0);

    assert_eq!(get(&db, "cold").as_deref(), Some("read"));
    assert_eq!(fs::read_dir(cache_dir.path()).unwrap().count(), 1);
}

#[test]
fn test_compaction_prunes_remote_tables() {
    let bucket_root = TempDir::new().unwrap();
    let dir = TempDir::new().unwrap();
    let db = Db::open(&options(cloud(bucket_root.path())), dir.path()).unwrap();
    let default = db.cf_handle("default").unwrap();

    for round in 0..3 {
        put(&db, &format!("k{}", round), "v");
        db.flush(&upload_flush()).unwrap();
    }
    db.compact_cf(&default).unwrap();
    db.flush(&upload_flush()).unwrap();

    let env = CloudEnv::new(&cloud(bucket_root.path())).unwrap();
    let tables: Vec<String> = env
        .list_objects(Bucket::Dest)
        .unwrap()
        .into_iter()
        .filter(|name| name.ends_with(".sst"))
        .collect();
    assert_eq!(tables.len(), 1);
    assert!(db.background_error().is_none());
}

#[test]
fn test_shipped_log_recovers_unflushed_writes() {
    let bucket_root = TempDir::new().unwrap();
    let first = TempDir::new().unwrap();
    let second = TempDir::new().unwrap();
    let shipping = || cloud(bucket_root.path()).log_transport(LogTransport::ObjectStore);

    {
        let db = Db::open(&options(shipping()), first.path()).unwrap();
        put(&db, "unflushed", "shipped");
        // Dropped without close: nothing reaches a table
    }

    let db = Db::open(&options(shipping()), second.path()).unwrap();
    assert_eq!(get(&db, "unflushed").as_deref(), Some("shipped"));
}

#[test]
fn test_shipping_needs_destination_bucket() {
    let bucket_root = TempDir::new().unwrap();
    let dir = TempDir::new().unwrap();
    let cloud = CloudOptions::new(CloudBackend::LocalFileSystem {
        root: bucket_root.path().to_path_buf(),
    })
    .src_bucket(BucketOptions::new("test", "node-1"))
    .log_transport(LogTransport::ObjectStore);

    let result = Db::open(&options(cloud), dir.path());
    assert!(matches!(result, Err(cirruskv::CirrusError::Config(_))));
}

#[test]
fn test_shipped_log_trimmed_only_after_manifest_upload() {
    let bucket_root = TempDir::new().unwrap();
    let dir = TempDir::new().unwrap();
    let shipper = Arc::new(RecordingShipper::default());
    let transport = LogTransport::Custom(Arc::clone(&shipper) as Arc<dyn LogShipper>);
    let db = Db::open(
        &options(cloud(bucket_root.path()).log_transport(transport)),
        dir.path(),
    )
    .unwrap();
    db.flush(&upload_flush()).unwrap();

    // A directory where the manifest object goes makes every upload fail
    let manifest = bucket_root.path().join("cirrus.test").join("node-1").join("MANIFEST");
    fs::remove_file(&manifest).unwrap();
    fs::create_dir_all(manifest.join("blocked")).unwrap();

    for i in 0..3 {
        put(&db, &format!("k{}", i), "v");
    }
    db.flush(&FlushOptions {
        wait: true,
        wait_for_upload: false,
    })
    .unwrap();
    assert!(db.flush(&upload_flush()).is_err());
    assert!(shipper.trims.lock().unwrap().iter().all(|upto| *upto == 0));

    fs::remove_dir_all(&manifest).unwrap();
    db.flush(&upload_flush()).unwrap();
    db.close().unwrap();

    assert!(shipper.trims.lock().unwrap().iter().any(|upto| *upto >= 3));
}

#[test]
fn test_empty_bucket_without_create_leaves_no_local_files() {
    let bucket_root = TempDir::new().unwrap();
    let dir = TempDir::new().unwrap();
    let cache_dir = dir.path().join("cache");
    let options = Options::builder()
        .create_if_missing(false)
        .cloud(cloud(bucket_root.path()))
        .build();

    let result = Db::open_cf_with_cache(&options, dir.path(), Vec::new(), Some(&cache_dir), 0);

    assert!(matches!(result, Err(cirruskv::CirrusError::InvalidArgument(_))));
    assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);
}
