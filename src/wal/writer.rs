//! WAL Writer
//!
//! Handles appending entries to a WAL segment.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::config::WalSyncStrategy;
use crate::error::{CirrusError, Result};

use super::WalEntry;

/// Writes entries to one WAL segment file
pub struct WalWriter {
    /// Segment path (for diagnostics and rollback)
    path: PathBuf,

    /// Segment file, opened in append mode
    file: File,

    /// When to fsync
    sync_strategy: WalSyncStrategy,

    /// Entries appended since the last fsync
    unsynced: usize,

    /// Length of the segment up to the end of the last complete frame
    offset: u64,

    /// Highest LSN appended so far (0 if none)
    last_lsn: u64,

    /// Set when a failed append could not be cut back off the segment
    failed: bool,
}

impl WalWriter {
    /// Open or create a WAL segment
    pub fn open(path: &Path, sync_strategy: WalSyncStrategy) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)?;
        let offset = file.metadata()?.len();

        Ok(Self {
            path: path.to_path_buf(),
            file,
            sync_strategy,
            unsynced: 0,
            offset,
            last_lsn: 0,
            failed: false,
        })
    }

    /// Append an entry to the WAL
    ///
    /// The frame is written with a single `write_all`. If the write or the
    /// fsync that follows it fails, the segment is cut back to the previous
    /// frame boundary, so a failed entry is never replayed and its LSN can be
    /// reused. If the cut itself fails the writer refuses further appends.
    ///
    /// Returns the segment length after the append.
    pub fn append(&mut self, entry: &WalEntry, force_sync: bool) -> Result<u64> {
        if self.failed {
            return Err(CirrusError::Storage(format!(
                "WAL segment {} holds a failed append and must be rolled",
                self.path.display()
            )));
        }
        let frame = entry.encode()?;

        if let Err(e) = self.file.write_all(&frame) {
            self.rollback();
            return Err(e.into());
        }

        let due = match self.sync_strategy {
            WalSyncStrategy::EveryWrite => true,
            WalSyncStrategy::EveryNEntries { count } => self.unsynced + 1 >= count.max(1),
        };
        if force_sync || due {
            if let Err(e) = self.sync() {
                self.rollback();
                return Err(e);
            }
        } else {
            self.unsynced += 1;
        }

        self.offset += frame.len() as u64;
        self.last_lsn = self.last_lsn.max(entry.last_lsn());
        Ok(self.offset)
    }

    /// Force sync to disk
    pub fn sync(&mut self) -> Result<()> {
        self.file.flush()?;
        self.file.sync_data()?;
        self.unsynced = 0;
        Ok(())
    }

    /// Get the highest LSN written through this writer
    pub fn current_lsn(&self) -> u64 {
        self.last_lsn
    }

    /// Segment length in bytes
    pub fn size(&self) -> u64 {
        self.offset
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Cut the segment back to the end of the last complete frame
    pub fn rollback(&mut self) {
        let result = self
            .file
            .set_len(self.offset)
            .and_then(|_| self.file.sync_data());
        if let Err(e) = result {
            tracing::error!(
                "Failed to roll back WAL segment {} to {} bytes: {}",
                self.path.display(),
                self.offset,
                e
            );
            self.failed = true;
        }
    }
}
