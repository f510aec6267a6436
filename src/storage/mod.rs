//! Storage Module
//!
//! Persistent storage layer: immutable sorted tables and the machinery to
//! read, merge and locate them.
//!
//! ## Responsibilities
//! - Persist flushed memtables as checksummed sorted tables
//! - Point lookups and ordered scans over a family's tables
//! - Merge sorted sources (reads and compaction)
//! - Resolve tables that live only in the cloud mirror
//!
//! See `sstable` for the file format.

mod manager;
mod merge;
mod sstable;

pub use manager::{parse_table_number, table_file_name, StorageManager, TableHandle};
pub use merge::{EntrySource, MergingIterator};
pub use sstable::{SSTable, SSTableBuilder, SSTableIterator, SSTableReader};
