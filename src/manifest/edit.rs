//! Manifest edits and table metadata

use serde::{Deserialize, Serialize};

/// Metadata of one immutable table, as recorded in the manifest
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileMeta {
    /// Table number; the file is named `{number:06}.sst`
    pub number: u64,
    pub file_size: u64,
    pub entry_count: u64,
    pub smallest_key: Vec<u8>,
    pub largest_key: Vec<u8>,
    /// Highest sequence stored in the table
    pub max_seq: u64,
}

impl FileMeta {
    /// Quick check if a key might be in this table (range check)
    pub fn might_contain(&self, key: &[u8]) -> bool {
        key >= self.smallest_key.as_slice() && key <= self.largest_key.as_slice()
    }

    /// True if the table holds any key in `[start, end)`
    pub fn overlaps(&self, start: Option<&[u8]>, end: Option<&[u8]>) -> bool {
        let after_start = start.map_or(true, |s| self.largest_key.as_slice() >= s);
        let before_end = end.map_or(true, |e| self.smallest_key.as_slice() < e);
        after_start && before_end
    }
}

/// One change to the manifest state
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum VersionEdit {
    CreateColumnFamily { id: u32, name: String },
    DropColumnFamily { id: u32 },
    AddFile { cf_id: u32, file: FileMeta },
    DeleteFile { cf_id: u32, number: u64 },
    /// Everything at or below `sequence` in this family is in tables
    SetFlushedSequence { cf_id: u32, sequence: u64 },
    SetLastSequence(u64),
    SetNextFileNumber(u64),
    SetNextColumnFamilyId(u32),
}
