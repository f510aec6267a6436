//! Merging iterator over sorted entry sources.
//!
//! Produces `(key, SeqEntry)` pairs in ascending key order. When the same
//! key appears in several sources, only the version with the highest
//! sequence number is emitted (newest wins). Tombstones are passed through;
//! callers decide whether to hide or drop them.
//!
//! Used by the read path (memtables + tables) and by compaction (tables only).

use std::cmp::Ordering;
use std::collections::BinaryHeap;

use crate::error::Result;
use crate::memtable::SeqEntry;

/// A sorted stream of versioned entries, one version per key
pub type EntrySource = Box<dyn Iterator<Item = Result<(Vec<u8>, SeqEntry)>> + Send>;

/// A pending entry from one source, used for heap-based merge ordering.
struct HeapEntry {
    key: Vec<u8>,
    entry: SeqEntry,
    /// Index into `sources`; lower means newer
    source: usize,
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for HeapEntry {}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap is a max-heap: smallest key first, then highest seq,
        // then the newest source.
        other
            .key
            .cmp(&self.key)
            .then_with(|| self.entry.seq.cmp(&other.entry.seq))
            .then_with(|| other.source.cmp(&self.source))
    }
}

/// Merges N sorted sources into one sorted, de-duplicated stream
pub struct MergingIterator {
    sources: Vec<EntrySource>,
    heap: BinaryHeap<HeapEntry>,
    /// Last key emitted, to skip older versions
    last_key: Option<Vec<u8>>,
    /// Set once a source fails; the error is yielded once and iteration ends
    failed: bool,
}

impl MergingIterator {
    /// Create a merging iterator; `sources` are ordered newest first
    pub fn new(sources: Vec<EntrySource>) -> Result<Self> {
        let mut merger = Self {
            sources,
            heap: BinaryHeap::new(),
            last_key: None,
            failed: false,
        };
        for source in 0..merger.sources.len() {
            merger.advance(source)?;
        }
        Ok(merger)
    }

    /// Pull the next entry of `source` onto the heap
    fn advance(&mut self, source: usize) -> Result<()> {
        if let Some(item) = self.sources[source].next() {
            let (key, entry) = item?;
            self.heap.push(HeapEntry { key, entry, source });
        }
        Ok(())
    }
}

impl Iterator for MergingIterator {
    type Item = Result<(Vec<u8>, SeqEntry)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }

        loop {
            let top = self.heap.pop()?;

            if let Err(e) = self.advance(top.source) {
                self.failed = true;
                return Some(Err(e));
            }

            // Older version of a key already emitted
            if self.last_key.as_deref() == Some(top.key.as_slice()) {
                continue;
            }

            self.last_key = Some(top.key.clone());
            return Some(Ok((top.key, top.entry)));
        }
    }
}
