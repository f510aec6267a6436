//! Manifest Module
//!
//! The authoritative record of what exists: column families, the live
//! tables of each family and the sequence markers needed for recovery.
//!
//! ## Responsibilities
//! - Log every change to the file set as an atomic group of edits
//! - Replay the log on open to rebuild the current state
//! - Periodically compact the log into a single snapshot group
//! - Provide the snapshot encoding mirrored to the cloud as `MANIFEST`
//!
//! ## File Format
//! ```text
//! ┌──────────────┬──────────────┬─────────────────────────────┐
//! │ Length (4)   │ CRC32 (4)    │ bincode(Vec<VersionEdit>)   │
//! └──────────────┴──────────────┴─────────────────────────────┘
//! ... one frame per edit group ...
//! ```
//!
//! ## Apply Order
//! ```text
//! edits ──► validate on cloned state ──► append frame + fsync ──► swap state
//! ```
//! A rejected or failed group leaves both the file and the in-memory state
//! untouched.

mod edit;
mod log;
mod version;

pub use edit::{FileMeta, VersionEdit};
pub use log::{ManifestReader, ManifestWriter};
pub use version::{ColumnFamilyMeta, ManifestState, VersionSet};

/// File name of the manifest, locally and in the cloud
pub const MANIFEST_FILE_NAME: &str = "MANIFEST";

/// Temporary file used while rewriting the manifest
pub(crate) const MANIFEST_TMP_FILE_NAME: &str = "MANIFEST.tmp";
