//! Read path: point lookups

use std::sync::atomic::Ordering;

use crate::config::ReadOptions;
use crate::error::Result;
use crate::memtable::MemTableEntry;

use super::{ColumnFamilyData, DbInner};

impl DbInner {
    /// Get a value by key
    ///
    /// Search order:
    /// 1. Memtables, newest first, as of the published sequence
    /// 2. Tables, newest to oldest
    ///
    /// A tombstone anywhere along the way ends the search with `None`.
    pub(crate) fn get(
        &self,
        _opts: &ReadOptions,
        cf: &ColumnFamilyData,
        key: &[u8],
    ) -> Result<Option<Vec<u8>>> {
        let snapshot = self.visible_seq.load(Ordering::Acquire);
        let view = cf.read_view();

        for memtable in &view.memtables {
            if let Some(found) = memtable.get(key, snapshot) {
                return Ok(into_value(found.entry));
            }
        }

        match self.storage.get(&view.tables, key)? {
            Some(found) => Ok(into_value(found.entry)),
            None => Ok(None),
        }
    }
}

fn into_value(entry: MemTableEntry) -> Option<Vec<u8>> {
    match entry {
        MemTableEntry::Value(value) => Some(value),
        MemTableEntry::Tombstone => None,
    }
}
