//! WAL Reader
//!
//! Handles reading entries from a WAL segment.

use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

use crate::error::{CirrusError, Result};

use super::entry::FrameHeader;
use super::{WalEntry, HEADER_SIZE};

/// State of the segment after the last valid entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WalTail {
    /// Every byte belongs to a complete, valid frame
    Clean,

    /// The bytes from `offset` on are an incomplete or damaged final frame
    Torn { offset: u64 },
}

/// Reads entries from a WAL segment
pub struct WalReader {
    reader: BufReader<File>,
    /// Offset just past the last valid frame
    position: u64,
    /// Segment length when opened
    file_len: u64,
    /// Last LSN returned (0 if none)
    last_lsn: u64,
    tail: WalTail,
}

impl WalReader {
    /// Open a WAL segment for reading
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path)?;
        let file_len = file.metadata()?.len();
        Ok(Self {
            reader: BufReader::new(file),
            position: 0,
            file_len,
            last_lsn: 0,
            tail: WalTail::Clean,
        })
    }

    /// Read the next entry from the WAL
    ///
    /// Returns `Ok(None)` at the end of the valid log. The damage is a torn
    /// tail (see [`WalReader::tail`]) only when nothing written follows it:
    /// a zero-filled header must be zeros up to EOF, a frame running past EOF
    /// must not hide a complete frame after its header, and a checksum
    /// failure must be on the very last frame. Anything else is corruption.
    pub fn next_entry(&mut self) -> Result<Option<WalEntry>> {
        if self.tail != WalTail::Clean {
            return Ok(None);
        }

        let remaining = self.file_len - self.position;
        if remaining == 0 {
            return Ok(None);
        }
        if remaining < HEADER_SIZE as u64 {
            return Ok(self.mark_torn());
        }

        let mut header_bytes = [0u8; HEADER_SIZE];
        self.reader.read_exact(&mut header_bytes)?;
        let header = FrameHeader::parse(&header_bytes);

        if header.is_zeroed() {
            let mut rest = Vec::new();
            self.reader.read_to_end(&mut rest)?;
            if let Some(at) = rest.iter().position(|b| *b != 0) {
                return Err(CirrusError::WalCorruption(format!(
                    "zeroed frame header at offset {} followed by data at offset {}",
                    self.position,
                    self.position + (HEADER_SIZE + at) as u64
                )));
            }
            return Ok(self.mark_torn());
        }

        let frame_end = self.position + HEADER_SIZE as u64 + header.len as u64;
        if frame_end > self.file_len {
            let mut rest = header_bytes.to_vec();
            self.reader.read_to_end(&mut rest)?;
            if let Some(at) = find_frame(&rest, self.last_lsn) {
                return Err(CirrusError::WalCorruption(format!(
                    "frame at offset {} claims {} bytes past EOF but a valid frame follows at offset {}",
                    self.position,
                    header.len,
                    self.position + at as u64
                )));
            }
            return Ok(self.mark_torn());
        }

        let mut data = vec![0u8; header.len as usize];
        self.reader.read_exact(&mut data)?;

        match WalEntry::decode(&header, &data) {
            Ok(entry) => {
                self.position = frame_end;
                self.last_lsn = entry.last_lsn();
                Ok(Some(entry))
            }
            Err(_) if frame_end == self.file_len => Ok(self.mark_torn()),
            Err(e) => Err(match e {
                CirrusError::WalCorruption(msg) => CirrusError::WalCorruption(format!(
                    "{} at offset {} (followed by {} more bytes)",
                    msg,
                    self.position,
                    self.file_len - frame_end
                )),
                other => other,
            }),
        }
    }

    /// Iterate over all valid entries
    pub fn entries(self) -> WalIterator {
        WalIterator {
            reader: self,
            done: false,
        }
    }

    /// Offset just past the last valid frame read so far
    pub fn position(&self) -> u64 {
        self.position
    }

    /// Segment length when opened
    pub fn file_len(&self) -> u64 {
        self.file_len
    }

    pub fn tail(&self) -> WalTail {
        self.tail
    }

    fn mark_torn(&mut self) -> Option<WalEntry> {
        self.tail = WalTail::Torn {
            offset: self.position,
        };
        None
    }
}

/// Offset of the first complete, valid frame in `buf` past its start whose
/// LSN is above `after_lsn`
fn find_frame(buf: &[u8], after_lsn: u64) -> Option<usize> {
    (1..buf.len().saturating_sub(HEADER_SIZE - 1)).find(|&off| {
        let mut header_bytes = [0u8; HEADER_SIZE];
        header_bytes.copy_from_slice(&buf[off..off + HEADER_SIZE]);
        let header = FrameHeader::parse(&header_bytes);
        if header.is_zeroed() || header.lsn <= after_lsn {
            return false;
        }
        let end = off + HEADER_SIZE + header.len as usize;
        end <= buf.len() && WalEntry::decode(&header, &buf[off + HEADER_SIZE..end]).is_ok()
    })
}

/// Iterator over WAL entries
pub struct WalIterator {
    reader: WalReader,
    done: bool,
}

impl WalIterator {
    /// Tail state once iteration has finished
    pub fn tail(&self) -> WalTail {
        self.reader.tail()
    }
}

impl Iterator for WalIterator {
    type Item = Result<WalEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.reader.next_entry() {
            Ok(Some(entry)) => Some(Ok(entry)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}
