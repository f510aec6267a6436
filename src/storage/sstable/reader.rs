//! SSTable Reader
//!
//! Opens SSTable files and provides O(log n) key lookups via in-memory index.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufReader, Read, Seek, SeekFrom};
use std::ops::Bound;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;

use crate::error::{CirrusError, Result};
use crate::memtable::{MemTableEntry, SeqEntry};

use super::{
    read_u32, read_u64, ENTRY_HEADER_SIZE, FOOTER_SIZE, HEADER_SIZE, MAGIC, TOMBSTONE_MARKER,
    VERSION,
};

/// Chunk size used when verifying the data block checksum
const VERIFY_CHUNK: usize = 64 * 1024;

/// Reader for SSTable files with in-memory index for O(log n) lookups
///
/// The file handle sits behind a mutex so one reader can be shared by
/// concurrent `get` calls and iterators; the table itself never changes.
pub struct SSTableReader {
    /// Path the reader was opened from
    path: PathBuf,
    /// File handle for reading entries
    file: Mutex<BufReader<File>>,
    /// In-memory index: key → file offset
    index: BTreeMap<Vec<u8>, u64>,
    /// Metadata
    entry_count: u64,
    max_seq: u64,
    file_size: u64,
}

impl SSTableReader {
    /// Open an SSTable for reading
    ///
    /// Validates header, footer and both checksums, then loads the entire
    /// index into memory.
    pub fn open(path: &Path) -> Result<Self> {
        let mut file = File::open(path)?;
        let file_size = file.metadata()?.len();

        if file_size < HEADER_SIZE + FOOTER_SIZE {
            return Err(corrupt(path, format!("file too small ({} bytes)", file_size)));
        }

        // Read and validate header
        let mut header = [0u8; HEADER_SIZE as usize];
        file.read_exact(&mut header)?;

        if &header[0..4] != MAGIC {
            return Err(corrupt(
                path,
                format!("invalid magic: expected CRKV, got {:?}", &header[0..4]),
            ));
        }

        let version = u16::from_le_bytes([header[4], header[5]]);
        if version != VERSION {
            return Err(corrupt(path, format!("unsupported version: {}", version)));
        }

        let entry_count = read_u64(&header, 6);

        // Read footer
        file.seek(SeekFrom::End(-(FOOTER_SIZE as i64)))?;
        let mut footer = [0u8; FOOTER_SIZE as usize];
        file.read_exact(&mut footer)?;

        let index_offset = read_u64(&footer, 0);
        let max_seq = read_u64(&footer, 8);
        let data_crc = read_u32(&footer, 16);
        let index_crc = read_u32(&footer, 20);

        if index_offset < HEADER_SIZE || index_offset > file_size - FOOTER_SIZE {
            return Err(corrupt(path, format!("index offset {} out of range", index_offset)));
        }

        // Verify the data block
        file.seek(SeekFrom::Start(HEADER_SIZE))?;
        let mut hasher = crc32fast::Hasher::new();
        let mut remaining = index_offset - HEADER_SIZE;
        let mut chunk = vec![0u8; VERIFY_CHUNK];
        while remaining > 0 {
            let n = remaining.min(VERIFY_CHUNK as u64) as usize;
            file.read_exact(&mut chunk[..n])?;
            hasher.update(&chunk[..n]);
            remaining -= n as u64;
        }
        if hasher.finalize() != data_crc {
            return Err(corrupt(path, "data block checksum mismatch".to_string()));
        }

        // Load and verify the index block
        let index_block_size = file_size - FOOTER_SIZE - index_offset;
        let mut index_data = vec![0u8; index_block_size as usize];
        file.read_exact(&mut index_data)?;
        if crc32fast::hash(&index_data) != index_crc {
            return Err(corrupt(path, "index block checksum mismatch".to_string()));
        }

        // Parse index entries: [key_len(4)][offset(8)][key]
        let mut index = BTreeMap::new();
        let mut pos = 0;
        while pos < index_data.len() {
            if pos + 12 > index_data.len() {
                return Err(corrupt(path, "truncated index entry".to_string()));
            }
            let key_len = read_u32(&index_data, pos) as usize;
            let offset = read_u64(&index_data, pos + 4);
            pos += 12;

            if pos + key_len > index_data.len() {
                return Err(corrupt(path, "truncated index key".to_string()));
            }
            index.insert(index_data[pos..pos + key_len].to_vec(), offset);
            pos += key_len;
        }

        if index.len() as u64 != entry_count {
            return Err(corrupt(
                path,
                format!("index holds {} keys, header says {}", index.len(), entry_count),
            ));
        }

        Ok(Self {
            path: path.to_path_buf(),
            file: Mutex::new(BufReader::new(file)),
            index,
            entry_count,
            max_seq,
            file_size,
        })
    }

    /// Get a versioned entry by key with an O(log n) lookup via the in-memory index
    ///
    /// Returns:
    /// - `Ok(entry)`: key found (value or tombstone)
    /// - `Err(KeyNotFound)`: key not in this SSTable
    pub fn get(&self, key: &[u8]) -> Result<SeqEntry> {
        let offset = match self.index.get(key) {
            Some(&off) => off,
            None => return Err(CirrusError::KeyNotFound),
        };

        let (_, entry) = self.read_entry_at(offset)?;
        Ok(entry)
    }

    /// Read the entry stored at `offset`
    pub fn read_entry_at(&self, offset: u64) -> Result<(Vec<u8>, SeqEntry)> {
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(offset))?;

        let mut header = [0u8; ENTRY_HEADER_SIZE];
        file.read_exact(&mut header)?;

        let key_len = read_u32(&header, 0) as usize;
        let val_len = read_u32(&header, 4);
        let seq = read_u64(&header, 8);

        let mut key = vec![0u8; key_len];
        file.read_exact(&mut key)?;

        let entry = if val_len == TOMBSTONE_MARKER {
            MemTableEntry::Tombstone
        } else {
            let mut value = vec![0u8; val_len as usize];
            file.read_exact(&mut value)?;
            MemTableEntry::Value(value)
        };

        Ok((key, SeqEntry::new(seq, entry)))
    }

    /// First index entry strictly after `after` (or the first overall)
    pub(crate) fn next_index_entry(&self, after: Option<&[u8]>) -> Option<(&[u8], u64)> {
        let lower = match after {
            Some(key) => Bound::Excluded(key),
            None => Bound::Unbounded,
        };
        self.index
            .range::<[u8], _>((lower, Bound::Unbounded))
            .next()
            .map(|(k, off)| (k.as_slice(), *off))
    }

    /// First index entry at or after `key`
    pub(crate) fn seek_index(&self, key: &[u8]) -> Option<(&[u8], u64)> {
        self.index
            .range::<[u8], _>((Bound::Included(key), Bound::Unbounded))
            .next()
            .map(|(k, off)| (k.as_slice(), *off))
    }

    /// Get entry count
    pub fn entry_count(&self) -> u64 {
        self.entry_count
    }

    /// Highest sequence number in this table
    pub fn max_seq(&self) -> u64 {
        self.max_seq
    }

    pub fn file_size(&self) -> u64 {
        self.file_size
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Get the minimum key in this SSTable (for range filtering)
    pub fn min_key(&self) -> Option<&[u8]> {
        self.index.keys().next().map(|k| k.as_slice())
    }

    /// Get the maximum key in this SSTable (for range filtering)
    pub fn max_key(&self) -> Option<&[u8]> {
        self.index.keys().next_back().map(|k| k.as_slice())
    }

    /// Quick check if a key might be in this SSTable (range check)
    /// Returns false only if the key is definitely outside [min_key, max_key]
    pub fn might_contain(&self, key: &[u8]) -> bool {
        match (self.min_key(), self.max_key()) {
            (Some(min), Some(max)) => key >= min && key <= max,
            _ => false, // Empty SSTable
        }
    }
}

fn corrupt(path: &Path, msg: String) -> CirrusError {
    CirrusError::TableCorruption(format!("{}: {}", path.display(), msg))
}
