//! SSTable Iterator
//!
//! Sequential iteration over the entries of a shared SSTable reader.

use std::sync::Arc;

use crate::error::Result;
use crate::memtable::SeqEntry;

use super::SSTableReader;

/// Iterator over SSTable entries in sorted key order
///
/// Owns an `Arc` of the reader, so it can outlive the table list it was
/// taken from; the file stays readable while any iterator holds it.
pub struct SSTableIterator {
    reader: Arc<SSTableReader>,
    /// Next (key, offset) to read
    next: Option<(Vec<u8>, u64)>,
}

impl SSTableIterator {
    /// Iterate from the first key
    pub fn new(reader: Arc<SSTableReader>) -> Self {
        let next = reader
            .next_index_entry(None)
            .map(|(k, off)| (k.to_vec(), off));
        Self { reader, next }
    }

    /// Iterate from the first key at or after `start`
    pub fn seek(reader: Arc<SSTableReader>, start: &[u8]) -> Self {
        let next = reader.seek_index(start).map(|(k, off)| (k.to_vec(), off));
        Self { reader, next }
    }
}

impl Iterator for SSTableIterator {
    /// (key, versioned entry), tombstones included
    type Item = Result<(Vec<u8>, SeqEntry)>;

    fn next(&mut self) -> Option<Self::Item> {
        let (key, offset) = self.next.take()?;

        self.next = self
            .reader
            .next_index_entry(Some(&key))
            .map(|(k, off)| (k.to_vec(), off));

        Some(self.reader.read_entry_at(offset))
    }
}
