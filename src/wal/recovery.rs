//! WAL Recovery
//!
//! Handles crash recovery by replaying every segment in order.

use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};

use crate::error::{CirrusError, Result};

use super::{parse_segment_number, WalEntry, WalReader, WalTail};

/// Handles WAL recovery after crash
pub struct WalRecovery;

/// Result of a recovery operation
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryResult {
    /// Number of segments read
    pub segments_replayed: u64,

    /// Number of entries successfully recovered
    pub entries_recovered: u64,

    /// Last valid LSN (0 if the log is empty)
    pub last_lsn: u64,

    /// Whether the final segment ended in a torn frame
    pub torn_tail: bool,

    /// Whether the torn frame was cut off the segment
    pub was_truncated: bool,

    /// Bytes removed (or that would be removed) from the final segment
    pub bytes_truncated: u64,
}

impl WalRecovery {
    /// Recover entries from every segment in `dir`
    ///
    /// This will:
    /// 1. Read all valid entries, oldest segment first
    /// 2. Truncate a partial write at the end of the last segment
    /// 3. Fail with `WalCorruption` on any damage before that point
    /// 4. Return all valid entries in order
    pub fn recover(dir: &Path) -> Result<(Vec<WalEntry>, RecoveryResult)> {
        Self::scan(dir, true)
    }

    /// Verify integrity of a WAL directory without modifying it
    pub fn verify(dir: &Path) -> Result<RecoveryResult> {
        Self::scan(dir, false).map(|(_, result)| result)
    }

    /// List segments in `dir`, oldest first
    pub fn list_segments(dir: &Path) -> Result<Vec<(u64, PathBuf)>> {
        let mut segments = Vec::new();
        if !dir.exists() {
            return Ok(segments);
        }

        for entry in fs::read_dir(dir)? {
            let path = entry?.path();
            if !path.is_file() {
                continue;
            }
            if let Some(number) = parse_segment_number(&path) {
                segments.push((number, path));
            }
        }

        segments.sort_by_key(|(number, _)| *number);
        Ok(segments)
    }

    fn scan(dir: &Path, repair: bool) -> Result<(Vec<WalEntry>, RecoveryResult)> {
        let segments = Self::list_segments(dir)?;
        let mut entries = Vec::new();
        let mut result = RecoveryResult::default();

        for (i, (number, path)) in segments.iter().enumerate() {
            let is_last = i + 1 == segments.len();
            let mut reader = WalReader::open(path)?;

            while let Some(entry) = reader.next_entry()? {
                if entry.lsn <= result.last_lsn && result.last_lsn != 0 {
                    return Err(CirrusError::WalCorruption(format!(
                        "segment {} goes backwards: lsn {} after {}",
                        number, entry.lsn, result.last_lsn
                    )));
                }
                result.last_lsn = entry.last_lsn();
                result.entries_recovered += 1;
                entries.push(entry);
            }
            result.segments_replayed += 1;

            if let WalTail::Torn { offset } = reader.tail() {
                if !is_last {
                    return Err(CirrusError::WalCorruption(format!(
                        "segment {} is damaged at offset {} but is not the last segment",
                        number, offset
                    )));
                }

                result.torn_tail = true;
                result.bytes_truncated = reader.file_len() - offset;

                if repair {
                    tracing::warn!(
                        "Truncating torn WAL tail: segment {} cut from {} to {} bytes",
                        number,
                        reader.file_len(),
                        offset
                    );
                    drop(reader);
                    let file = OpenOptions::new().write(true).open(path)?;
                    file.set_len(offset)?;
                    file.sync_all()?;
                    result.was_truncated = true;
                }
            }
        }

        Ok((entries, result))
    }
}
