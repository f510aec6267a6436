//! Database Module
//!
//! The engine that coordinates WAL, memtables, tables, manifest and the
//! cloud mirror.
//!
//! ## Responsibilities
//! - Atomic batched writes across column families
//! - Point lookups and ordered iteration over a sequence snapshot
//! - Memtable swaps, background flush and compaction
//! - Column family lifecycle, recorded in the manifest
//! - Crash recovery and cloud bootstrap at open
//!
//! ## Concurrency Model
//!
//! ```text
//!  writers ──► write_state (WAL + sequence) ──► cf.mem ──► publish visible_seq
//!  readers ──► visible_seq ──► cf.mem / cf.tables (Arc snapshots, no WAL lock)
//!  flush worker ──► versions (manifest) ──► cf.mem + cf.tables ──► segments
//! ```
//!
//! - **Writes**: serialized by `write_state`; a batch becomes visible when
//!   its last sequence is published, so readers never see half a batch
//! - **Reads**: take `Arc` snapshots of the memtables and table list and
//!   never block on writers or on the flush worker
//! - **Background**: one flush/compaction worker; it never takes
//!   `write_state`, so a stalled writer can always be released by it
//!
//! ## State Machine
//! `Closed → Opening → Open → Closing → Closed`; every call other than open
//! fails with `Closed` outside the `Open` state.

mod column_family;
mod compaction;
mod flush;
mod iterator;
mod read;
mod recovery;
mod write;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam::channel::Sender;
use parking_lot::{Condvar, Mutex, RwLock};
use tracing::{info, warn};

use crate::batch::{WriteBatch, DEFAULT_COLUMN_FAMILY_ID};
use crate::cloud::{CloudMirror, LogShippingWorker};
use crate::config::{
    ColumnFamilyDescriptor, ColumnFamilyOptions, FlushOptions, Options, ReadOptions, WriteOptions,
};
use crate::error::{CirrusError, Result};
use crate::manifest::{VersionSet, MANIFEST_FILE_NAME};
use crate::storage::{table_file_name, StorageManager};

pub use column_family::ColumnFamilyHandle;
pub use iterator::DbIterator;

pub(crate) use column_family::ColumnFamilyData;
use flush::FlushMessage;
use write::WriteState;

/// Lifecycle state of a database handle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum DbState {
    Closed = 0,
    Opening = 1,
    Open = 2,
    Closing = 3,
}

impl DbState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => DbState::Opening,
            2 => DbState::Open,
            3 => DbState::Closing,
            _ => DbState::Closed,
        }
    }
}

/// Subdirectory of the database holding WAL segments
pub const WAL_DIR_NAME: &str = "wal";

/// Subdirectory of the database holding table files
pub const TABLE_DIR_NAME: &str = "tables";

/// Source of `Db` instance ids, used to reject foreign handles
static NEXT_INSTANCE_ID: AtomicU64 = AtomicU64::new(1);

/// A sealed WAL segment awaiting retirement
#[derive(Debug, Clone)]
pub(crate) struct SealedSegment {
    pub number: u64,
    pub path: PathBuf,
    /// Highest sequence the segment can contain
    pub max_seq: u64,
}

/// Shared engine state, owned by `Db` and the flush worker
pub(crate) struct DbInner {
    pub path: PathBuf,
    pub wal_dir: PathBuf,
    pub options: Options,
    pub instance_id: u64,
    state: AtomicU8,

    /// WAL writer and sequence allocation (single writer)
    pub write_state: Mutex<WriteState>,

    /// Last sequence whose batch is fully applied
    pub visible_seq: AtomicU64,

    /// Manifest (single writer)
    pub versions: Mutex<VersionSet>,

    /// Open column families by id
    pub families: RwLock<BTreeMap<u32, Arc<ColumnFamilyData>>>,

    pub storage: Arc<StorageManager>,

    /// Sealed WAL segments, oldest first
    pub segments: Mutex<Vec<SealedSegment>>,

    /// Sticky background failure
    pub bg_error: Mutex<Option<String>>,

    /// Writers waiting for a flush park here
    pub stall: Mutex<()>,
    pub stall_cv: Condvar,

    pub flush_tx: Sender<FlushMessage>,
    pub mirror: Option<CloudMirror>,
    /// Version stamped on the last mirror job (bumped under `versions`)
    pub mirror_version: AtomicU64,
    pub shipper: Option<LogShippingWorker>,
}

impl DbInner {
    pub fn state(&self) -> DbState {
        DbState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn set_state(&self, state: DbState) {
        self.state.store(state as u8, Ordering::Release);
    }

    pub fn check_open(&self) -> Result<()> {
        match self.state() {
            DbState::Open => Ok(()),
            _ => Err(CirrusError::Closed),
        }
    }

    /// Record a background failure (first one wins)
    pub fn set_background_error(&self, error: &CirrusError) {
        let mut slot = self.bg_error.lock();
        if slot.is_none() {
            *slot = Some(error.to_string());
        }
    }

    pub fn background_error(&self) -> Option<String> {
        if let Some(e) = self.bg_error.lock().clone() {
            return Some(e);
        }
        if let Some(e) = self.mirror.as_ref().and_then(|m| m.last_error()) {
            return Some(e);
        }
        self.shipper.as_ref().and_then(|s| s.last_error())
    }

    /// Family for a caller's handle
    pub fn family(&self, handle: &ColumnFamilyHandle) -> Result<Arc<ColumnFamilyData>> {
        self.check_open()?;
        if handle.instance_id() != self.instance_id {
            return Err(CirrusError::InvalidColumnFamily(format!(
                "handle for '{}' belongs to another database instance",
                handle.name()
            )));
        }
        let cf = handle.data();
        if cf.is_dropped() {
            return Err(CirrusError::InvalidColumnFamily(format!(
                "column family '{}' has been dropped",
                cf.name
            )));
        }
        Ok(Arc::clone(cf))
    }

    /// Family by id, for the default family and internal callers
    pub fn family_by_id(&self, id: u32) -> Result<Arc<ColumnFamilyData>> {
        self.families
            .read()
            .get(&id)
            .cloned()
            .ok_or_else(|| CirrusError::InvalidColumnFamily(format!("id {}", id)))
    }

    pub fn default_family(&self) -> Result<Arc<ColumnFamilyData>> {
        self.check_open()?;
        self.family_by_id(DEFAULT_COLUMN_FAMILY_ID)
    }
}

// =============================================================================
// Db
// =============================================================================

/// An open database
///
/// Safe to share across threads (`&Db` is enough for every operation).
/// Call `close` for an orderly shutdown; dropping without `close` stops the
/// background workers without flushing, which recovery treats like a crash.
pub struct Db {
    inner: Arc<DbInner>,
    flush_worker: Mutex<Option<JoinHandle<()>>>,
}

impl Db {
    // =========================================================================
    // Open
    // =========================================================================

    /// Open a database with just the default column family
    pub fn open(options: &Options, path: impl AsRef<Path>) -> Result<Db> {
        let (db, _) = Self::open_cf(options, path, Vec::new())?;
        Ok(db)
    }

    /// Open a database and its column families
    ///
    /// Every family recorded in the manifest is opened; one handle is
    /// returned per descriptor, in order. Descriptors naming unknown
    /// families fail with `InvalidArgument` unless
    /// `create_missing_column_families` is set.
    pub fn open_cf(
        options: &Options,
        path: impl AsRef<Path>,
        descriptors: Vec<ColumnFamilyDescriptor>,
    ) -> Result<(Db, Vec<ColumnFamilyHandle>)> {
        Self::open_cf_with_cache(options, path, descriptors, None, 0)
    }

    /// Open with a persistent cache for tables fetched from the cloud
    ///
    /// `cache_size` bounds the cache in bytes; 0 means unbounded.
    pub fn open_cf_with_cache(
        options: &Options,
        path: impl AsRef<Path>,
        descriptors: Vec<ColumnFamilyDescriptor>,
        persistent_cache_path: Option<&Path>,
        cache_size: u64,
    ) -> Result<(Db, Vec<ColumnFamilyHandle>)> {
        let opened = recovery::open(
            options.clone(),
            path.as_ref(),
            descriptors,
            persistent_cache_path,
            cache_size,
        )?;
        let db = Db {
            inner: opened.inner,
            flush_worker: Mutex::new(Some(opened.flush_worker)),
        };
        Ok((db, opened.handles))
    }

    /// Names of the column families recorded in the manifest at `path`
    pub fn list_column_families(path: impl AsRef<Path>) -> Result<Vec<String>> {
        let state = VersionSet::load(path.as_ref())?;
        Ok(state
            .column_families
            .values()
            .map(|cf| cf.name.clone())
            .collect())
    }

    // =========================================================================
    // Write Path
    // =========================================================================

    /// Put into the default column family
    pub fn put(&self, opts: &WriteOptions, key: impl AsRef<[u8]>, value: impl AsRef<[u8]>) -> Result<()> {
        let mut batch = WriteBatch::new();
        batch.put(key, value);
        self.write(opts, batch)
    }

    pub fn put_cf(
        &self,
        opts: &WriteOptions,
        cf: &ColumnFamilyHandle,
        key: impl AsRef<[u8]>,
        value: impl AsRef<[u8]>,
    ) -> Result<()> {
        let mut batch = WriteBatch::new();
        batch.put_cf(cf, key, value);
        self.write(opts, batch)
    }

    /// Delete from the default column family
    pub fn delete(&self, opts: &WriteOptions, key: impl AsRef<[u8]>) -> Result<()> {
        let mut batch = WriteBatch::new();
        batch.delete(key);
        self.write(opts, batch)
    }

    pub fn delete_cf(&self, opts: &WriteOptions, cf: &ColumnFamilyHandle, key: impl AsRef<[u8]>) -> Result<()> {
        let mut batch = WriteBatch::new();
        batch.delete_cf(cf, key);
        self.write(opts, batch)
    }

    /// Apply a batch atomically
    pub fn write(&self, opts: &WriteOptions, batch: WriteBatch) -> Result<()> {
        self.inner.write(opts, batch)
    }

    // =========================================================================
    // Read Path
    // =========================================================================

    /// Get from the default column family; `Ok(None)` if absent or deleted
    pub fn get(&self, opts: &ReadOptions, key: impl AsRef<[u8]>) -> Result<Option<Vec<u8>>> {
        let cf = self.inner.default_family()?;
        self.inner.get(opts, &cf, key.as_ref())
    }

    pub fn get_cf(
        &self,
        opts: &ReadOptions,
        cf: &ColumnFamilyHandle,
        key: impl AsRef<[u8]>,
    ) -> Result<Option<Vec<u8>>> {
        let cf = self.inner.family(cf)?;
        self.inner.get(opts, &cf, key.as_ref())
    }

    /// Ordered cursor over the default column family
    pub fn iterator(&self, opts: &ReadOptions) -> Result<DbIterator> {
        let cf = self.inner.default_family()?;
        self.inner.iterator(opts, &cf)
    }

    pub fn iterator_cf(&self, opts: &ReadOptions, cf: &ColumnFamilyHandle) -> Result<DbIterator> {
        let cf = self.inner.family(cf)?;
        self.inner.iterator(opts, &cf)
    }

    // =========================================================================
    // Maintenance
    // =========================================================================

    /// Flush the default column family
    pub fn flush(&self, opts: &FlushOptions) -> Result<()> {
        let cf = self.inner.default_family()?;
        self.inner.flush_family(opts, &cf)
    }

    pub fn flush_cf(&self, opts: &FlushOptions, cf: &ColumnFamilyHandle) -> Result<()> {
        let cf = self.inner.family(cf)?;
        self.inner.flush_family(opts, &cf)
    }

    /// Merge all of a family's tables into one, dropping deleted keys
    pub fn compact_cf(&self, cf: &ColumnFamilyHandle) -> Result<()> {
        let cf = self.inner.family(cf)?;
        self.inner.request_compaction(&cf)
    }

    pub fn create_column_family(
        &self,
        name: &str,
        options: &ColumnFamilyOptions,
    ) -> Result<ColumnFamilyHandle> {
        self.inner.create_column_family(name, options)
    }

    /// Drop a family; its handles become invalid
    pub fn drop_column_family(&self, cf: &ColumnFamilyHandle) -> Result<()> {
        self.inner.drop_column_family(cf)
    }

    /// Release a handle (the family itself is unaffected)
    pub fn destroy_column_family_handle(&self, cf: ColumnFamilyHandle) -> Result<()> {
        self.inner.destroy_column_family_handle(cf)
    }

    /// A fresh handle for an open family
    pub fn cf_handle(&self, name: &str) -> Option<ColumnFamilyHandle> {
        self.inner.cf_handle(name)
    }

    // =========================================================================
    // Introspection
    // =========================================================================

    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    pub fn state(&self) -> DbState {
        self.inner.state()
    }

    /// Last sequence visible to readers
    pub fn latest_sequence_number(&self) -> u64 {
        self.inner.visible_seq.load(Ordering::Acquire)
    }

    /// Manifest plus every live table file name
    pub fn live_files(&self) -> Result<Vec<String>> {
        self.inner.check_open()?;
        let versions = self.inner.versions.lock();
        let mut files: Vec<String> = versions
            .state()
            .live_file_numbers()
            .into_iter()
            .map(table_file_name)
            .collect();
        files.push(MANIFEST_FILE_NAME.to_string());
        Ok(files)
    }

    /// Number of live tables in a family
    pub fn sstable_count_cf(&self, cf: &ColumnFamilyHandle) -> Result<usize> {
        let cf = self.inner.family(cf)?;
        let count = cf.tables.read().len();
        Ok(count)
    }

    /// Bytes held in a family's memtables (active and immutable)
    pub fn memtable_size_cf(&self, cf: &ColumnFamilyHandle) -> Result<usize> {
        let cf = self.inner.family(cf)?;
        Ok(cf.memtable_size())
    }

    /// Sticky background flush, upload or shipping failure, if any
    pub fn background_error(&self) -> Option<String> {
        self.inner.background_error()
    }

    // =========================================================================
    // Close
    // =========================================================================

    /// Flush everything, wait for the cloud mirror, stop the workers
    pub fn close(self) -> Result<()> {
        self.inner.check_open()?;
        info!(path = %self.inner.path.display(), "Closing database");

        let result = self.inner.flush_all_for_close();
        self.inner.set_state(DbState::Closing);
        self.stop_workers();
        if let Err(e) = self.inner.sync_wal() {
            warn!(error = %e, "Failed to sync WAL at close");
        }
        self.inner.set_state(DbState::Closed);

        info!(path = %self.inner.path.display(), "Database closed");
        result
    }

    fn stop_workers(&self) {
        let _ = self.inner.flush_tx.send(FlushMessage::Shutdown);
        if let Some(handle) = self.flush_worker.lock().take() {
            let _ = handle.join();
        }
        self.inner.stall_cv.notify_all();
        if let Some(shipper) = &self.inner.shipper {
            shipper.shutdown();
        }
        if let Some(mirror) = &self.inner.mirror {
            mirror.shutdown();
        }
    }
}

impl Drop for Db {
    fn drop(&mut self) {
        if self.inner.state() == DbState::Closed {
            return;
        }
        self.inner.set_state(DbState::Closing);
        self.stop_workers();
        self.inner.set_state(DbState::Closed);
    }
}
