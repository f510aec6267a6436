//! Write-Ahead Log (WAL) Module
//!
//! Provides durability guarantees through append-only logging.
//!
//! ## Responsibilities
//! - Append one entry per committed write batch before it becomes visible
//! - CRC32 checksums for corruption detection
//! - Log Sequence Numbers (LSN) for ordering
//! - Crash recovery and replay across numbered segments
//!
//! ## Layout
//! ```text
//! {db}/wal/
//!   ├── 000003.log        (sealed segment)
//!   ├── 000004.log        (active segment)
//!   └── archive/          (retired segments, when kept)
//! ```
//!
//! ## Frame Format
//! ```text
//! ┌─────────────────────────────────────────┐
//! │ Entry 1                                 │
//! │ ┌─────────┬─────────┬────────┬────────┐ │
//! │ │ LSN (8) │ CRC (4) │Len (4) │ Data   │ │
//! │ └─────────┴─────────┴────────┴────────┘ │
//! ├─────────────────────────────────────────┤
//! │ Entry 2                                 │
//! │ ┌─────────┬─────────┬────────┬────────┐ │
//! │ │ LSN (8) │ CRC (4) │Len (4) │ Data   │ │
//! │ └─────────┴─────────┴────────┴────────┘ │
//! └─────────────────────────────────────────┘
//! ```
//! `Data` is the bincode encoding of a [`WalEntry`]; the CRC covers the LSN,
//! the length and the data.

mod entry;
mod writer;
mod reader;
mod recovery;

use std::path::{Path, PathBuf};

pub use entry::{WalEntry, HEADER_SIZE};
pub use writer::WalWriter;
pub use reader::{WalIterator, WalReader, WalTail};
pub use recovery::{RecoveryResult, WalRecovery};

/// Subdirectory of a WAL directory holding retired segments
pub const ARCHIVE_DIR: &str = "archive";

/// File name of the segment with the given number
pub fn segment_file_name(number: u64) -> String {
    format!("{:06}.log", number)
}

/// Path of the segment with the given number inside `dir`
pub fn segment_path(dir: &Path, number: u64) -> PathBuf {
    dir.join(segment_file_name(number))
}

/// Parse a segment number from its path
/// "000042.log" → Some(42)
pub fn parse_segment_number(path: &Path) -> Option<u64> {
    if path.extension()? != "log" {
        return None;
    }
    path.file_stem()?.to_str()?.parse().ok()
}
