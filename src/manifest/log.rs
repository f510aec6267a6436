//! Manifest log reader and writer
//!
//! Frame: `[len u32][crc32 u32][bincode(Vec<VersionEdit>)]`, CRC over data.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use tracing::warn;

use crate::error::{CirrusError, Result};

use super::VersionEdit;

/// Frame header: Length (4) + CRC32 (4)
const FRAME_HEADER_SIZE: usize = 8;

/// Upper bound on a single edit group; anything larger is garbage
const MAX_FRAME_SIZE: usize = 64 * 1024 * 1024;

/// Encode one edit group as a frame
pub(crate) fn encode_frame(edits: &[VersionEdit]) -> Result<Vec<u8>> {
    let data = bincode::serialize(edits)?;
    let mut frame = Vec::with_capacity(FRAME_HEADER_SIZE + data.len());
    frame.extend_from_slice(&(data.len() as u32).to_le_bytes());
    frame.extend_from_slice(&crc32fast::hash(&data).to_le_bytes());
    frame.extend_from_slice(&data);
    Ok(frame)
}

// =============================================================================
// Reader
// =============================================================================

/// Decodes manifest frames from a file or an in-memory object
pub struct ManifestReader;

impl ManifestReader {
    /// Read every complete edit group of the manifest at `path`
    ///
    /// Returns the groups plus the length of the valid prefix. An incomplete
    /// trailing frame (crash mid-append) is ignored; a complete frame with a
    /// bad checksum is corruption.
    pub fn read_file(path: &Path) -> Result<(Vec<Vec<VersionEdit>>, u64)> {
        let bytes = fs::read(path)?;
        let (groups, valid_len) = Self::decode(&bytes)?;
        if valid_len < bytes.len() {
            warn!(
                path = %path.display(),
                valid_len,
                file_len = bytes.len(),
                "Ignoring incomplete trailing manifest frame"
            );
        }
        Ok((groups, valid_len as u64))
    }

    /// Decode every complete frame in `bytes`
    pub fn decode(bytes: &[u8]) -> Result<(Vec<Vec<VersionEdit>>, usize)> {
        let mut groups = Vec::new();
        let mut pos = 0;

        while pos + FRAME_HEADER_SIZE <= bytes.len() {
            let len = u32::from_le_bytes([bytes[pos], bytes[pos + 1], bytes[pos + 2], bytes[pos + 3]])
                as usize;
            let crc = u32::from_le_bytes([
                bytes[pos + 4],
                bytes[pos + 5],
                bytes[pos + 6],
                bytes[pos + 7],
            ]);

            if len > MAX_FRAME_SIZE {
                return Err(CirrusError::ManifestCorruption(format!(
                    "frame at offset {} claims {} bytes",
                    pos, len
                )));
            }

            let start = pos + FRAME_HEADER_SIZE;
            if start + len > bytes.len() {
                // Torn tail
                break;
            }

            let data = &bytes[start..start + len];
            if crc32fast::hash(data) != crc {
                return Err(CirrusError::ManifestCorruption(format!(
                    "checksum mismatch in frame at offset {}",
                    pos
                )));
            }

            let edits: Vec<VersionEdit> = bincode::deserialize(data).map_err(|e| {
                CirrusError::ManifestCorruption(format!("undecodable frame at offset {}: {}", pos, e))
            })?;
            groups.push(edits);
            pos = start + len;
        }

        Ok((groups, pos))
    }
}

// =============================================================================
// Writer
// =============================================================================

/// Appends edit groups to the manifest file
pub struct ManifestWriter {
    path: PathBuf,
    file: File,
    size: u64,
}

impl ManifestWriter {
    /// Write a fresh manifest holding a single snapshot group (tmp + rename)
    pub fn create(path: &Path, snapshot: &[VersionEdit]) -> Result<Self> {
        let tmp_path = path.with_file_name(super::MANIFEST_TMP_FILE_NAME);
        let frame = encode_frame(snapshot)?;

        {
            let mut tmp = OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(&tmp_path)?;
            tmp.write_all(&frame)?;
            tmp.sync_all()?;
        }
        fs::rename(&tmp_path, path)?;
        sync_parent(path);

        Self::open(path, frame.len() as u64)
    }

    /// Open an existing manifest for appending, cutting it to `valid_len`
    pub fn open(path: &Path, valid_len: u64) -> Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let size = file.metadata()?.len();
        if size > valid_len {
            file.set_len(valid_len)?;
            file.sync_all()?;
        }

        Ok(Self {
            path: path.to_path_buf(),
            file,
            size: valid_len,
        })
    }

    /// Append one edit group and fsync
    ///
    /// On failure the file is cut back to its previous length.
    pub fn append(&mut self, edits: &[VersionEdit]) -> Result<()> {
        use std::io::{Seek, SeekFrom};

        let frame = encode_frame(edits)?;
        let result = (|| -> Result<()> {
            self.file.seek(SeekFrom::Start(self.size))?;
            self.file.write_all(&frame)?;
            self.file.sync_data()?;
            Ok(())
        })();

        match result {
            Ok(()) => {
                self.size += frame.len() as u64;
                Ok(())
            }
            Err(e) => {
                let _ = self.file.set_len(self.size);
                Err(e)
            }
        }
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Best-effort fsync of the directory holding `path`
pub(crate) fn sync_parent(path: &Path) {
    if let Some(parent) = path.parent() {
        if let Ok(dir) = File::open(parent) {
            let _ = dir.sync_all();
        }
    }
}
