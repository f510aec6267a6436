//! WAL Entry definitions
//!
//! Defines the structure of individual WAL log entries and their framing.

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::batch::Operation;
use crate::error::{CirrusError, Result};

/// Frame header size: LSN (8) + CRC (4) + Len (4) = 16 bytes
pub const HEADER_SIZE: usize = 16;

/// A single entry in the WAL: one atomically committed write batch
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WalEntry {
    /// Sequence number of the first operation; operation `i` has `lsn + i`
    pub lsn: u64,

    /// The operations to apply, in batch order
    pub operations: Vec<Operation>,

    /// Timestamp (unix millis) when entry was created
    pub timestamp: u64,
}

impl WalEntry {
    pub fn new(lsn: u64, operations: Vec<Operation>) -> Self {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        Self {
            lsn,
            operations,
            timestamp,
        }
    }

    /// Sequence number of the last operation in this entry
    pub fn last_lsn(&self) -> u64 {
        self.lsn + (self.operations.len() as u64).saturating_sub(1)
    }

    /// Encode the entry into a complete frame
    pub fn encode(&self) -> Result<Vec<u8>> {
        let data = bincode::serialize(self)?;
        let len = u32::try_from(data.len()).map_err(|_| {
            CirrusError::InvalidArgument(format!("WAL entry too large: {} bytes", data.len()))
        })?;

        let mut frame = Vec::with_capacity(HEADER_SIZE + data.len());
        frame.extend_from_slice(&self.lsn.to_le_bytes());
        frame.extend_from_slice(&checksum(self.lsn, len, &data).to_le_bytes());
        frame.extend_from_slice(&len.to_le_bytes());
        frame.extend_from_slice(&data);
        Ok(frame)
    }

    /// Decode one complete frame held in memory
    pub fn decode_frame(frame: &[u8]) -> Result<Self> {
        if frame.len() < HEADER_SIZE {
            return Err(CirrusError::WalCorruption(format!(
                "frame too short: {} bytes",
                frame.len()
            )));
        }
        let mut header_bytes = [0u8; HEADER_SIZE];
        header_bytes.copy_from_slice(&frame[..HEADER_SIZE]);
        let header = FrameHeader::parse(&header_bytes);

        let data = &frame[HEADER_SIZE..];
        if data.len() != header.len as usize {
            return Err(CirrusError::WalCorruption(format!(
                "frame claims {} bytes, holds {}",
                header.len,
                data.len()
            )));
        }
        Self::decode(&header, data)
    }

    /// Decode a frame body whose header has already been parsed
    pub(crate) fn decode(header: &FrameHeader, data: &[u8]) -> Result<Self> {
        if checksum(header.lsn, header.len, data) != header.crc {
            return Err(CirrusError::WalCorruption(format!(
                "checksum mismatch for entry lsn={}",
                header.lsn
            )));
        }

        let entry: WalEntry = bincode::deserialize(data)
            .map_err(|e| CirrusError::WalCorruption(format!("undecodable entry: {}", e)))?;

        if entry.lsn != header.lsn {
            return Err(CirrusError::WalCorruption(format!(
                "frame lsn {} does not match entry lsn {}",
                header.lsn, entry.lsn
            )));
        }

        Ok(entry)
    }
}

/// Parsed frame header
#[derive(Debug, Clone, Copy)]
pub(crate) struct FrameHeader {
    pub lsn: u64,
    pub crc: u32,
    pub len: u32,
}

impl FrameHeader {
    pub fn parse(bytes: &[u8; HEADER_SIZE]) -> Self {
        let mut lsn = [0u8; 8];
        let mut crc = [0u8; 4];
        let mut len = [0u8; 4];
        lsn.copy_from_slice(&bytes[0..8]);
        crc.copy_from_slice(&bytes[8..12]);
        len.copy_from_slice(&bytes[12..16]);
        Self {
            lsn: u64::from_le_bytes(lsn),
            crc: u32::from_le_bytes(crc),
            len: u32::from_le_bytes(len),
        }
    }

    /// A zero-filled header marks preallocated space after the last write
    pub fn is_zeroed(&self) -> bool {
        self.lsn == 0 && self.crc == 0 && self.len == 0
    }
}

fn checksum(lsn: u64, len: u32, data: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&lsn.to_le_bytes());
    hasher.update(&len.to_le_bytes());
    hasher.update(data);
    hasher.finalize()
}
