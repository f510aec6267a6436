//! MemTable Module
//!
//! In-memory data structure for recent writes.
//!
//! ## Responsibilities
//! - Fast reads and writes in memory
//! - Single-writer/multi-reader access pattern
//! - Keep every version of a key so readers can use a sequence snapshot
//! - Track size and sequence range for flush decisions and WAL retirement
//! - Ordered iteration for SSTable creation
//!
//! ## Data Structure Choice
//! BTreeMap keyed by `(user key ascending, sequence descending)` wrapped in
//! a RwLock. The newest version of a key is the first entry for that key.

mod table;

pub use table::MemTable;

/// Entry stored in the MemTable
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MemTableEntry {
    /// A live value
    Value(Vec<u8>),

    /// A tombstone (deleted key)
    Tombstone,
}

impl MemTableEntry {
    pub fn is_tombstone(&self) -> bool {
        matches!(self, MemTableEntry::Tombstone)
    }

    /// The live value, if any
    pub fn value(&self) -> Option<&[u8]> {
        match self {
            MemTableEntry::Value(v) => Some(v),
            MemTableEntry::Tombstone => None,
        }
    }
}

/// A versioned entry: what a key held as of `seq`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SeqEntry {
    pub seq: u64,
    pub entry: MemTableEntry,
}

impl SeqEntry {
    pub fn new(seq: u64, entry: MemTableEntry) -> Self {
        Self { seq, entry }
    }
}
