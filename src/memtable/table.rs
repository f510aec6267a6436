//! MemTable implementation
//!
//! Multi-version BTreeMap memtable with RwLock for concurrency.

use std::cmp::Reverse;
use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use parking_lot::RwLock;

use super::{MemTableEntry, SeqEntry};

/// Per-entry bookkeeping overhead counted toward the size limit
const ENTRY_OVERHEAD: usize = 16;

type InternalKey = (Vec<u8>, Reverse<u64>);

/// In-memory table for recent writes
pub struct MemTable {
    /// All versions, newest first within a key
    data: RwLock<BTreeMap<InternalKey, MemTableEntry>>,

    /// Approximate size in bytes
    size: AtomicUsize,

    /// Number of versions stored
    entry_count: AtomicUsize,

    /// Lowest sequence stored (u64::MAX when empty)
    min_seq: AtomicU64,

    /// Highest sequence stored (0 when empty)
    max_seq: AtomicU64,
}

impl MemTable {
    /// Create a new empty MemTable
    pub fn new() -> Self {
        Self {
            data: RwLock::new(BTreeMap::new()),
            size: AtomicUsize::new(0),
            entry_count: AtomicUsize::new(0),
            min_seq: AtomicU64::new(u64::MAX),
            max_seq: AtomicU64::new(0),
        }
    }

    /// Put a key-value pair at `seq`; returns the new approximate size
    pub fn put(&self, key: Vec<u8>, seq: u64, value: Vec<u8>) -> usize {
        self.insert(key, seq, MemTableEntry::Value(value))
    }

    /// Insert a tombstone at `seq`; returns the new approximate size
    pub fn delete(&self, key: Vec<u8>, seq: u64) -> usize {
        self.insert(key, seq, MemTableEntry::Tombstone)
    }

    fn insert(&self, key: Vec<u8>, seq: u64, entry: MemTableEntry) -> usize {
        let added = key.len() + entry.value().map_or(0, |v| v.len()) + ENTRY_OVERHEAD;

        let replaced = self.data.write().insert((key, Reverse(seq)), entry);
        if replaced.is_none() {
            self.entry_count.fetch_add(1, Ordering::Relaxed);
        }
        self.min_seq.fetch_min(seq, Ordering::AcqRel);
        self.max_seq.fetch_max(seq, Ordering::AcqRel);

        self.size.fetch_add(added, Ordering::Relaxed) + added
    }

    /// Newest version of `key` with a sequence at or below `snapshot`
    pub fn get(&self, key: &[u8], snapshot: u64) -> Option<SeqEntry> {
        let data = self.data.read();
        let start = (key.to_vec(), Reverse(snapshot));
        let ((found, Reverse(seq)), entry) = data.range(start..).next()?;
        if found.as_slice() != key {
            return None;
        }
        Some(SeqEntry::new(*seq, entry.clone()))
    }

    /// Newest version of every key at or below `snapshot`, in key order,
    /// starting at `from` (inclusive) when given
    pub fn snapshot(&self, snapshot: u64, from: Option<&[u8]>) -> Vec<(Vec<u8>, SeqEntry)> {
        let data = self.data.read();
        let lower = match from {
            Some(key) => Bound::Included((key.to_vec(), Reverse(u64::MAX))),
            None => Bound::Unbounded,
        };

        let mut out: Vec<(Vec<u8>, SeqEntry)> = Vec::new();
        for ((key, Reverse(seq)), entry) in data.range((lower, Bound::Unbounded)) {
            if *seq > snapshot {
                continue;
            }
            if out.last().map_or(false, |(last, _)| last == key) {
                continue;
            }
            out.push((key.clone(), SeqEntry::new(*seq, entry.clone())));
        }
        out
    }

    /// Newest version of every key, in key order (for flush)
    pub fn iter(&self) -> impl Iterator<Item = (Vec<u8>, SeqEntry)> {
        self.snapshot(u64::MAX, None).into_iter()
    }

    /// Get approximate size in bytes
    pub fn size(&self) -> usize {
        self.size.load(Ordering::Relaxed)
    }

    /// Get the number of stored versions
    pub fn entry_count(&self) -> usize {
        self.entry_count.load(Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.entry_count() == 0
    }

    /// Check if should flush (size >= limit)
    pub fn should_flush(&self, size_limit: usize) -> bool {
        self.size() >= size_limit
    }

    /// Lowest sequence held, if any
    pub fn min_seq(&self) -> Option<u64> {
        match self.min_seq.load(Ordering::Acquire) {
            u64::MAX => None,
            seq => Some(seq),
        }
    }

    /// Highest sequence held (0 when empty)
    pub fn max_seq(&self) -> u64 {
        self.max_seq.load(Ordering::Acquire)
    }
}

impl Default for MemTable {
    fn default() -> Self {
        Self::new()
    }
}
