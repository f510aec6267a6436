//! # CirrusKV
//!
//! An embedded, cloud-durable key-value storage engine with:
//! - Column families sharing one write-ahead log and one manifest
//! - Atomic write batches across families
//! - Crash recovery with partial write handling
//! - Background flush and compaction into sorted tables
//! - Mirroring of tables and manifest to an object store, and cold start
//!   from that mirror
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                         Db API                               │
//! │        (put / get / write / iterator / column families)      │
//! └─────────────────────┬───────────────────────────────────────┘
//!                       │
//!          ┌────────────┴────────────┐
//!          │                         │
//!          ▼                         ▼
//!   ┌─────────────┐          ┌─────────────┐
//!   │     WAL     │          │  MemTables  │  (one set per family)
//!   │ (segments)  │          │  (RwLock)   │
//!   └─────────────┘          └──────┬──────┘
//!                                   │ flush worker
//!                                   ▼
//!   ┌─────────────┐          ┌─────────────┐         ┌─────────────┐
//!   │  MANIFEST   │ ◄─────── │   Storage   │ ──────► │ CloudMirror │
//!   │ (edit log)  │          │  (SSTable)  │         │ (object     │
//!   └─────────────┘          └─────────────┘         │  store)     │
//!                                                    └─────────────┘
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod error;
pub mod config;
pub mod batch;

pub mod wal;
pub mod memtable;
pub mod storage;
pub mod manifest;
pub mod cloud;
pub mod db;

// =============================================================================
// Public API Re-exports
// =============================================================================

pub use batch::{Operation, WriteBatch, DEFAULT_COLUMN_FAMILY_ID};
pub use cloud::{
    BucketOptions, CloudBackend, CloudOptions, Credentials, LogShipper, LogTransport, RetryPolicy,
};
pub use config::{
    ColumnFamilyDescriptor, ColumnFamilyOptions, FlushOptions, Options, ReadOptions,
    WalSyncStrategy, WriteOptions, DEFAULT_COLUMN_FAMILY_NAME,
};
pub use db::{ColumnFamilyHandle, Db, DbIterator, DbState};
pub use error::{CirrusError, Result};

// =============================================================================
// Version Info
// =============================================================================

/// Current version of CirrusKV
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
