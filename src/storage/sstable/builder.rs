//! SSTable Builder
//!
//! Writes sorted key-value entries to a new SSTable file.

use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crate::error::{CirrusError, Result};
use crate::memtable::{MemTableEntry, SeqEntry};

use super::{SSTable, HEADER_SIZE, MAGIC, TOMBSTONE_MARKER, VERSION};

/// Builder for creating new SSTables from sorted entries
///
/// Entries go to `<path>.tmp`; `finish()` renames the file into place, so a
/// crash mid-build never leaves a half-written table under its final name.
pub struct SSTableBuilder {
    /// Final file path
    path: PathBuf,
    /// Temporary path being written
    tmp_path: PathBuf,
    /// Buffered writer for performance
    writer: BufWriter<File>,
    /// Number of entries written
    entry_count: u64,
    /// Current write position (for index)
    current_offset: u64,
    /// Index: key → file offset of entry
    index: Vec<(Vec<u8>, u64)>,
    /// Track min/max keys for metadata
    min_key: Option<Vec<u8>>,
    max_key: Option<Vec<u8>>,
    /// Highest sequence written
    max_seq: u64,
    /// Running CRC hasher for data section
    data_hasher: crc32fast::Hasher,
}

impl SSTableBuilder {
    /// Create a new SSTable builder
    ///
    /// Writes header immediately; call `add()` in strictly increasing key
    /// order, then `finish()` to write index and footer.
    pub fn new(path: &Path) -> Result<Self> {
        let tmp_path = tmp_path_for(path);
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&tmp_path)?;

        let mut writer = BufWriter::new(file);

        // Write header (entry_count placeholder, will be updated in finish)
        writer.write_all(MAGIC)?;
        writer.write_all(&VERSION.to_le_bytes())?;
        writer.write_all(&0u64.to_le_bytes())?;

        Ok(Self {
            path: path.to_path_buf(),
            tmp_path,
            writer,
            entry_count: 0,
            current_offset: HEADER_SIZE,
            index: Vec::new(),
            min_key: None,
            max_key: None,
            max_seq: 0,
            data_hasher: crc32fast::Hasher::new(),
        })
    }

    /// Add a versioned entry (must be called in strictly increasing key order)
    pub fn add(&mut self, key: &[u8], entry: &SeqEntry) -> Result<()> {
        if let Some(last) = &self.max_key {
            if key <= last.as_slice() {
                return Err(CirrusError::Storage(format!(
                    "SSTable keys out of order: {:?} after {:?}",
                    key, last
                )));
            }
        }

        // Record offset for index
        self.index.push((key.to_vec(), self.current_offset));

        if self.min_key.is_none() {
            self.min_key = Some(key.to_vec());
        }
        self.max_key = Some(key.to_vec());
        self.max_seq = self.max_seq.max(entry.seq);

        let value = match &entry.entry {
            MemTableEntry::Value(v) => Some(v.as_slice()),
            MemTableEntry::Tombstone => None,
        };

        // [key_len(4)][val_len(4)][seq(8)][key][value]
        let key_len_bytes = (key.len() as u32).to_le_bytes();
        let val_len_bytes = match value {
            Some(v) => (v.len() as u32).to_le_bytes(),
            None => TOMBSTONE_MARKER.to_le_bytes(),
        };
        let seq_bytes = entry.seq.to_le_bytes();

        for part in [&key_len_bytes[..], &val_len_bytes[..], &seq_bytes[..], key] {
            self.writer.write_all(part)?;
            self.data_hasher.update(part);
        }

        let mut entry_size = 16 + key.len() as u64;
        if let Some(v) = value {
            self.writer.write_all(v)?;
            self.data_hasher.update(v);
            entry_size += v.len() as u64;
        }

        self.current_offset += entry_size;
        self.entry_count += 1;

        Ok(())
    }

    /// Number of entries added so far
    pub fn entry_count(&self) -> u64 {
        self.entry_count
    }

    /// Finish building: write index block, footer, and return metadata
    pub fn finish(mut self) -> Result<SSTable> {
        let index_offset = self.current_offset;

        // Write index block: [key_len(4)][offset(8)][key] for each entry
        let mut index_hasher = crc32fast::Hasher::new();
        for (key, offset) in &self.index {
            let key_len = (key.len() as u32).to_le_bytes();
            let offset = offset.to_le_bytes();
            for part in [&key_len[..], &offset[..], key.as_slice()] {
                self.writer.write_all(part)?;
                index_hasher.update(part);
            }
        }

        let data_crc = self.data_hasher.finalize();
        let index_crc = index_hasher.finalize();

        // Footer: index_offset (8) + max_seq (8) + data_crc (4) + index_crc (4)
        self.writer.write_all(&index_offset.to_le_bytes())?;
        self.writer.write_all(&self.max_seq.to_le_bytes())?;
        self.writer.write_all(&data_crc.to_le_bytes())?;
        self.writer.write_all(&index_crc.to_le_bytes())?;

        self.writer.flush()?;

        // Seek back and update entry count in header
        let mut file = self.writer.into_inner().map_err(|e| {
            CirrusError::Storage(format!("Failed to flush SSTable: {}", e))
        })?;
        file.seek(SeekFrom::Start(6))?; // After magic + version
        file.write_all(&self.entry_count.to_le_bytes())?;
        file.sync_all()?;

        let file_size = file.metadata()?.len();
        drop(file);

        fs::rename(&self.tmp_path, &self.path)?;

        Ok(SSTable {
            path: self.path,
            entry_count: self.entry_count,
            min_key: self.min_key.unwrap_or_default(),
            max_key: self.max_key.unwrap_or_default(),
            max_seq: self.max_seq,
            file_size,
        })
    }

    /// Discard the partially written table
    pub fn abandon(self) {
        let tmp_path = self.tmp_path.clone();
        drop(self.writer);
        let _ = fs::remove_file(tmp_path);
    }
}

/// `000012.sst` → `000012.sst.tmp`
pub(crate) fn tmp_path_for(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".tmp");
    PathBuf::from(name)
}
