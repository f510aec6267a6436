//! Configuration for CirrusKV
//!
//! Centralized configuration with sensible defaults. Everything the engine
//! needs is passed explicitly at `Db::open` time; there is no process-wide
//! mutable state.

use crate::cloud::CloudOptions;

/// Name of the column family every database has
pub const DEFAULT_COLUMN_FAMILY_NAME: &str = "default";

/// Database-wide options, consumed by `Db::open`
#[derive(Debug, Clone)]
pub struct Options {
    // -------------------------------------------------------------------------
    // Open Behaviour
    // -------------------------------------------------------------------------
    /// Create the database directory and manifest when absent
    pub create_if_missing: bool,

    /// Create requested column families that the manifest does not know
    pub create_missing_column_families: bool,

    /// Fail if a database already exists at the path
    pub error_if_exists: bool,

    // -------------------------------------------------------------------------
    // WAL Configuration
    // -------------------------------------------------------------------------
    /// Sync strategy: how often to fsync WAL
    pub wal_sync_strategy: WalSyncStrategy,

    // -------------------------------------------------------------------------
    // MemTable Configuration
    // -------------------------------------------------------------------------
    /// Max size of a column family's memtable before it is swapped out (bytes)
    pub memtable_size_limit: usize,

    /// Writers stall once a family has this many memtables waiting to flush
    pub max_immutable_memtables: usize,

    // -------------------------------------------------------------------------
    // Table / Manifest Configuration
    // -------------------------------------------------------------------------
    /// Number of tables in a family that triggers a full compaction
    pub level0_compaction_trigger: usize,

    /// Number of logged edit groups before the manifest is rewritten
    pub manifest_rewrite_threshold: usize,

    // -------------------------------------------------------------------------
    // Cloud Configuration
    // -------------------------------------------------------------------------
    /// Remote mirror; `None` keeps the database purely local
    pub cloud: Option<CloudOptions>,
}

/// WAL sync strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WalSyncStrategy {
    /// fsync after every write (safest, slowest)
    EveryWrite,

    /// fsync after N unsynced records (balanced durability/performance)
    EveryNEntries { count: usize },
}

impl Default for Options {
    fn default() -> Self {
        Self {
            create_if_missing: true,
            create_missing_column_families: false,
            error_if_exists: false,
            wal_sync_strategy: WalSyncStrategy::EveryNEntries { count: 100 },
            memtable_size_limit: 64 * 1024 * 1024, // 64 MB
            max_immutable_memtables: 4,
            level0_compaction_trigger: 4,
            manifest_rewrite_threshold: 1000,
            cloud: None,
        }
    }
}

impl Options {
    /// Create a new options builder
    pub fn builder() -> OptionsBuilder {
        OptionsBuilder::default()
    }
}

/// Builder for Options
#[derive(Default)]
pub struct OptionsBuilder {
    options: Options,
}

impl OptionsBuilder {
    pub fn create_if_missing(mut self, create: bool) -> Self {
        self.options.create_if_missing = create;
        self
    }

    pub fn create_missing_column_families(mut self, create: bool) -> Self {
        self.options.create_missing_column_families = create;
        self
    }

    pub fn error_if_exists(mut self, error: bool) -> Self {
        self.options.error_if_exists = error;
        self
    }

    /// Set the WAL sync strategy
    pub fn wal_sync_strategy(mut self, strategy: WalSyncStrategy) -> Self {
        self.options.wal_sync_strategy = strategy;
        self
    }

    /// Set the memtable size limit (in bytes)
    pub fn memtable_size_limit(mut self, size: usize) -> Self {
        self.options.memtable_size_limit = size;
        self
    }

    pub fn max_immutable_memtables(mut self, count: usize) -> Self {
        self.options.max_immutable_memtables = count.max(1);
        self
    }

    pub fn level0_compaction_trigger(mut self, count: usize) -> Self {
        self.options.level0_compaction_trigger = count;
        self
    }

    pub fn manifest_rewrite_threshold(mut self, edits: usize) -> Self {
        self.options.manifest_rewrite_threshold = edits;
        self
    }

    /// Mirror the database to an object store
    pub fn cloud(mut self, cloud: CloudOptions) -> Self {
        self.options.cloud = Some(cloud);
        self
    }

    pub fn build(self) -> Options {
        self.options
    }
}

// =============================================================================
// Column Family Options
// =============================================================================

/// Per-family overrides of the database-wide options
#[derive(Debug, Clone, Default)]
pub struct ColumnFamilyOptions {
    pub memtable_size_limit: Option<usize>,
    pub level0_compaction_trigger: Option<usize>,
}

impl ColumnFamilyOptions {
    pub fn memtable_size_limit(mut self, size: usize) -> Self {
        self.memtable_size_limit = Some(size);
        self
    }

    pub fn level0_compaction_trigger(mut self, count: usize) -> Self {
        self.level0_compaction_trigger = Some(count);
        self
    }
}

/// A column family to open (and possibly create) at `Db::open_cf` time
#[derive(Debug, Clone)]
pub struct ColumnFamilyDescriptor {
    pub name: String,
    pub options: ColumnFamilyOptions,
}

impl ColumnFamilyDescriptor {
    pub fn new(name: impl Into<String>, options: ColumnFamilyOptions) -> Self {
        Self {
            name: name.into(),
            options,
        }
    }
}

// =============================================================================
// Per-Call Options
// =============================================================================

/// Options for a single write
#[derive(Debug, Clone, Copy, Default)]
pub struct WriteOptions {
    /// fsync the WAL before acknowledging, regardless of the sync strategy
    pub sync: bool,

    /// Skip the WAL: the write lives only in memory until the next flush
    pub disable_wal: bool,
}

/// Options for a single read or iterator
#[derive(Debug, Clone, Default)]
pub struct ReadOptions {
    /// Exclusive upper bound for iterators
    pub iterate_upper_bound: Option<Vec<u8>>,
}

impl ReadOptions {
    pub fn iterate_upper_bound(mut self, bound: impl Into<Vec<u8>>) -> Self {
        self.iterate_upper_bound = Some(bound.into());
        self
    }
}

/// Options for `Db::flush`
#[derive(Debug, Clone, Copy)]
pub struct FlushOptions {
    /// Block until the memtable has been written to a table
    pub wait: bool,

    /// Also block until the cloud mirror has acknowledged the new state
    pub wait_for_upload: bool,
}

impl Default for FlushOptions {
    fn default() -> Self {
        Self {
            wait: true,
            wait_for_upload: false,
        }
    }
}
