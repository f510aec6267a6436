//! Storage Manager
//!
//! Resolves manifest-referenced tables to readable files and creates new
//! tables from flushes and compactions.
//!
//! ## Responsibilities
//! - Build tables from sorted entry streams
//! - Find a table's bytes: local directory → persistent cache → cloud
//! - Search a family's tables newest → oldest for point reads
//! - Remove files the manifest no longer references
//!
//! ## Cold Reads
//! ```text
//! TableHandle::reader ──► local dir? ──► cache? ──► download (dest, then src)
//!         │                                               │
//!         └──────────── opened once, shared via Arc ◄─────┘
//! ```

use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::cloud::{Bucket, CloudEnv, PersistentCache};
use crate::error::{CirrusError, Result};
use crate::manifest::FileMeta;
use crate::memtable::SeqEntry;

use super::SSTableBuilder;
use super::SSTableReader;

/// File name of table `number`
pub fn table_file_name(number: u64) -> String {
    format!("{:06}.sst", number)
}

/// Extract the table number from a file name like `000042.sst`
pub fn parse_table_number(name: &str) -> Option<u64> {
    name.strip_suffix(".sst")?.parse().ok()
}

// =============================================================================
// Table Handle
// =============================================================================

/// A live table: manifest metadata plus a lazily opened reader
pub struct TableHandle {
    meta: FileMeta,
    reader: Mutex<Option<Arc<SSTableReader>>>,
    /// Local file to delete once the last user lets go
    retired: Mutex<Option<PathBuf>>,
}

impl TableHandle {
    /// Handle whose reader is opened on first use
    pub fn new(meta: FileMeta) -> Self {
        Self {
            meta,
            reader: Mutex::new(None),
            retired: Mutex::new(None),
        }
    }

    /// Handle for a table that was just built and opened
    pub fn with_reader(meta: FileMeta, reader: Arc<SSTableReader>) -> Self {
        Self {
            meta,
            reader: Mutex::new(Some(reader)),
            retired: Mutex::new(None),
        }
    }

    pub fn meta(&self) -> &FileMeta {
        &self.meta
    }

    pub fn number(&self) -> u64 {
        self.meta.number
    }

    pub fn file_name(&self) -> String {
        table_file_name(self.meta.number)
    }

    /// Range check on the manifest key bounds, without touching the file
    pub fn might_contain(&self, key: &[u8]) -> bool {
        self.meta.might_contain(key)
    }

    /// True once a reader has been opened
    pub fn is_open(&self) -> bool {
        self.reader.lock().is_some()
    }

    /// The shared reader, materializing and opening the file if needed
    pub fn reader(&self, storage: &StorageManager) -> Result<Arc<SSTableReader>> {
        let mut slot = self.reader.lock();
        if let Some(reader) = slot.as_ref() {
            return Ok(Arc::clone(reader));
        }

        let path = storage.materialize(&self.file_name())?;
        let reader = Arc::new(SSTableReader::open(&path)?);
        if reader.entry_count() != self.meta.entry_count || reader.max_seq() != self.meta.max_seq {
            return Err(CirrusError::TableCorruption(format!(
                "{} does not match its manifest entry",
                path.display()
            )));
        }
        *slot = Some(Arc::clone(&reader));
        Ok(reader)
    }

    /// Delete the local file at `path` when this handle is dropped
    ///
    /// Iterators and in-flight reads keep their `Arc` until they finish, so
    /// an obsolete table stays readable for them.
    pub fn retire(&self, path: PathBuf) {
        *self.retired.lock() = Some(path);
    }
}

impl Drop for TableHandle {
    fn drop(&mut self) {
        if let Some(path) = self.retired.get_mut().take() {
            match fs::remove_file(&path) {
                Ok(()) => debug!(path = %path.display(), "Deleted retired table"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => warn!(path = %path.display(), error = %e, "Failed to delete retired table"),
            }
        }
    }
}

// =============================================================================
// Storage Manager
// =============================================================================

/// Manages table files for all column families
///
/// ## Concurrency:
/// - Stateless apart from the cache, which has its own lock
/// - All methods use `&self` (no exclusive access needed)
pub struct StorageManager {
    /// Directory where tables are stored
    data_dir: PathBuf,

    /// Cold-read cache for tables fetched from the cloud
    cache: Option<Arc<PersistentCache>>,

    /// Remote mirror to fetch missing tables from
    cloud: Option<Arc<CloudEnv>>,
}

impl StorageManager {
    /// Open the table directory, creating it if needed
    pub fn open(
        data_dir: &Path,
        cache: Option<Arc<PersistentCache>>,
        cloud: Option<Arc<CloudEnv>>,
    ) -> Result<Self> {
        fs::create_dir_all(data_dir)?;
        Ok(Self {
            data_dir: data_dir.to_path_buf(),
            cache,
            cloud,
        })
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    /// Local path of table `number`
    pub fn table_path(&self, number: u64) -> PathBuf {
        self.data_dir.join(table_file_name(number))
    }

    pub fn cache(&self) -> Option<&Arc<PersistentCache>> {
        self.cache.as_ref()
    }

    /// Build table `number` from sorted entries
    ///
    /// Returns `None` (and leaves no file behind) when the stream is empty.
    pub fn build_table<I>(&self, number: u64, entries: I) -> Result<Option<(FileMeta, Arc<SSTableReader>)>>
    where
        I: IntoIterator<Item = Result<(Vec<u8>, SeqEntry)>>,
    {
        let path = self.table_path(number);
        let mut builder = SSTableBuilder::new(&path)?;

        for item in entries {
            let added = item.and_then(|(key, entry)| builder.add(&key, &entry));
            if let Err(e) = added {
                builder.abandon();
                return Err(e);
            }
        }

        if builder.entry_count() == 0 {
            builder.abandon();
            return Ok(None);
        }

        let table = builder.finish()?;
        let reader = Arc::new(SSTableReader::open(&path)?);
        let meta = FileMeta {
            number,
            file_size: table.file_size,
            entry_count: table.entry_count,
            smallest_key: table.min_key,
            largest_key: table.max_key,
            max_seq: table.max_seq,
        };

        debug!(
            number,
            entries = meta.entry_count,
            bytes = meta.file_size,
            "Built table"
        );
        Ok(Some((meta, reader)))
    }

    /// Local path holding the bytes of table file `name`
    ///
    /// Looks in the table directory, then the persistent cache, then fetches
    /// from the cloud (destination bucket first, then source).
    pub fn materialize(&self, name: &str) -> Result<PathBuf> {
        let local = self.data_dir.join(name);
        if local.is_file() {
            return Ok(local);
        }

        if let Some(path) = self.cache.as_ref().and_then(|cache| cache.lookup(name)) {
            return Ok(path);
        }

        let Some(env) = self.cloud.as_ref() else {
            return Err(CirrusError::Storage(format!(
                "table {} is missing and no cloud mirror is configured",
                name
            )));
        };

        let fetch = |path: &Path| Self::download(env, name, path);
        let path = match &self.cache {
            Some(cache) => cache.insert_with(name, fetch)?,
            None => {
                fetch(&local)?;
                local
            }
        };

        info!(table = name, path = %path.display(), "Fetched table from cloud");
        Ok(path)
    }

    /// Download table `number` into the table directory unless present
    pub fn fetch_table(&self, number: u64) -> Result<()> {
        let path = self.table_path(number);
        if path.is_file() {
            return Ok(());
        }
        let Some(env) = self.cloud.as_ref() else {
            return Err(CirrusError::Storage(format!(
                "table {} is missing and no cloud mirror is configured",
                number
            )));
        };
        Self::download(env, &table_file_name(number), &path)
    }

    fn download(env: &CloudEnv, name: &str, dest: &Path) -> Result<()> {
        let mut buckets = Vec::new();
        if env.has_dest() {
            buckets.push(Bucket::Dest);
        }
        if env.has_src() {
            buckets.push(Bucket::Src);
        }

        for bucket in buckets {
            match env.download_file(bucket, name, dest) {
                Ok(()) => return Ok(()),
                Err(CirrusError::ObjectNotFound(_)) => continue,
                Err(e) => return Err(e),
            }
        }
        Err(CirrusError::Storage(format!(
            "table {} not found locally or in the cloud",
            name
        )))
    }

    /// Get the newest version of `key` from `tables` (ordered newest first)
    ///
    /// Returns:
    /// - `Ok(Some(entry))`: found (value or tombstone)
    /// - `Ok(None)`: key not in any table
    pub fn get(&self, tables: &[Arc<TableHandle>], key: &[u8]) -> Result<Option<SeqEntry>> {
        for table in tables {
            // Skip table if key is outside its range (O(1) check)
            if !table.might_contain(key) {
                continue;
            }

            match table.reader(self)?.get(key) {
                Ok(entry) => return Ok(Some(entry)),
                Err(CirrusError::KeyNotFound) => continue,
                Err(e) => return Err(e),
            }
        }

        Ok(None)
    }

    /// Delete the local copy (and cached copy) of table `number`
    pub fn delete_table(&self, number: u64) {
        let name = table_file_name(number);
        if let Some(cache) = &self.cache {
            cache.remove(&name);
        }
        match fs::remove_file(self.data_dir.join(&name)) {
            Ok(()) => debug!(table = %name, "Deleted table file"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(table = %name, error = %e, "Failed to delete table file"),
        }
    }

    /// Remove partial writes and tables the manifest does not reference
    pub fn remove_orphans(&self, live: &BTreeSet<u64>) -> Result<usize> {
        let mut removed = 0;

        for entry in fs::read_dir(&self.data_dir)? {
            let path = entry?.path();
            if !path.is_file() {
                continue;
            }
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };

            let orphan = if name.ends_with(".tmp") || name.ends_with(".download") {
                true
            } else {
                parse_table_number(name).map_or(false, |number| !live.contains(&number))
            };

            if orphan {
                fs::remove_file(&path)?;
                removed += 1;
            }
        }

        if removed > 0 {
            info!(removed, "Removed orphan table files");
        }
        Ok(removed)
    }
}
