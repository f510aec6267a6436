//! Manifest state and the version set that logs changes to it

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use crate::batch::DEFAULT_COLUMN_FAMILY_ID;
use crate::config::DEFAULT_COLUMN_FAMILY_NAME;
use crate::error::{CirrusError, Result};

use super::log::encode_frame;
use super::{FileMeta, ManifestReader, ManifestWriter, VersionEdit, MANIFEST_FILE_NAME};

/// Manifest view of one column family
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnFamilyMeta {
    pub id: u32,
    pub name: String,
    /// Live tables, newest first
    pub files: Vec<FileMeta>,
    /// Everything at or below this sequence is in `files`
    pub flushed_seq: u64,
}

/// The current file set and sequence markers
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestState {
    pub column_families: BTreeMap<u32, ColumnFamilyMeta>,
    pub last_sequence: u64,
    pub next_file_number: u64,
    pub next_column_family_id: u32,
}

impl ManifestState {
    /// State with nothing in it, the starting point for replay
    pub fn empty() -> Self {
        Self {
            column_families: BTreeMap::new(),
            last_sequence: 0,
            next_file_number: 1,
            next_column_family_id: 0,
        }
    }

    /// State of a brand new database: just the default family
    pub fn initial() -> Self {
        let mut state = Self::empty();
        state.column_families.insert(
            DEFAULT_COLUMN_FAMILY_ID,
            ColumnFamilyMeta {
                id: DEFAULT_COLUMN_FAMILY_ID,
                name: DEFAULT_COLUMN_FAMILY_NAME.to_string(),
                files: Vec::new(),
                flushed_seq: 0,
            },
        );
        state.next_column_family_id = DEFAULT_COLUMN_FAMILY_ID + 1;
        state
    }

    /// Apply one edit, rejecting edits that do not fit the current state
    pub fn apply(&mut self, edit: &VersionEdit) -> Result<()> {
        match edit {
            VersionEdit::CreateColumnFamily { id, name } => {
                if self.column_families.contains_key(id) {
                    return Err(CirrusError::InvalidArgument(format!(
                        "column family id {} already exists",
                        id
                    )));
                }
                if self.cf_by_name(name).is_some() {
                    return Err(CirrusError::InvalidArgument(format!(
                        "column family '{}' already exists",
                        name
                    )));
                }
                self.column_families.insert(
                    *id,
                    ColumnFamilyMeta {
                        id: *id,
                        name: name.clone(),
                        files: Vec::new(),
                        flushed_seq: 0,
                    },
                );
                self.next_column_family_id = self.next_column_family_id.max(id + 1);
            }

            VersionEdit::DropColumnFamily { id } => {
                if *id == DEFAULT_COLUMN_FAMILY_ID {
                    return Err(CirrusError::InvalidArgument(
                        "the default column family cannot be dropped".to_string(),
                    ));
                }
                if self.column_families.remove(id).is_none() {
                    return Err(CirrusError::InvalidColumnFamily(format!("id {}", id)));
                }
            }

            VersionEdit::AddFile { cf_id, file } => {
                if self.contains_file(file.number) {
                    return Err(CirrusError::InvalidArgument(format!(
                        "table {} is already live",
                        file.number
                    )));
                }
                let cf = self.cf_mut(*cf_id)?;
                // Newest first: higher max_seq, then higher number
                let pos = cf
                    .files
                    .iter()
                    .position(|f| (f.max_seq, f.number) < (file.max_seq, file.number))
                    .unwrap_or(cf.files.len());
                cf.files.insert(pos, file.clone());
                self.next_file_number = self.next_file_number.max(file.number + 1);
            }

            VersionEdit::DeleteFile { cf_id, number } => {
                let cf = self.cf_mut(*cf_id)?;
                let before = cf.files.len();
                cf.files.retain(|f| f.number != *number);
                if cf.files.len() == before {
                    return Err(CirrusError::InvalidArgument(format!(
                        "table {} is not live in column family {}",
                        number, cf_id
                    )));
                }
            }

            VersionEdit::SetFlushedSequence { cf_id, sequence } => {
                let cf = self.cf_mut(*cf_id)?;
                cf.flushed_seq = cf.flushed_seq.max(*sequence);
            }

            VersionEdit::SetLastSequence(seq) => {
                self.last_sequence = self.last_sequence.max(*seq);
            }

            VersionEdit::SetNextFileNumber(n) => {
                self.next_file_number = self.next_file_number.max(*n);
            }

            VersionEdit::SetNextColumnFamilyId(id) => {
                self.next_column_family_id = self.next_column_family_id.max(*id);
            }
        }
        Ok(())
    }

    /// Edits that rebuild this state from `empty()`
    pub fn snapshot_edits(&self) -> Vec<VersionEdit> {
        let mut edits = vec![
            VersionEdit::SetNextColumnFamilyId(self.next_column_family_id),
            VersionEdit::SetNextFileNumber(self.next_file_number),
            VersionEdit::SetLastSequence(self.last_sequence),
        ];
        for cf in self.column_families.values() {
            edits.push(VersionEdit::CreateColumnFamily {
                id: cf.id,
                name: cf.name.clone(),
            });
            edits.push(VersionEdit::SetFlushedSequence {
                cf_id: cf.id,
                sequence: cf.flushed_seq,
            });
            for file in cf.files.iter().rev() {
                edits.push(VersionEdit::AddFile {
                    cf_id: cf.id,
                    file: file.clone(),
                });
            }
        }
        edits
    }

    /// Single-frame encoding of the whole state (the cloud `MANIFEST` object)
    pub fn encode_snapshot(&self) -> Result<Vec<u8>> {
        encode_frame(&self.snapshot_edits())
    }

    /// Rebuild a state from manifest bytes (snapshot or full log)
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let (groups, _) = ManifestReader::decode(bytes)?;
        Self::replay(groups)
    }

    /// Replay edit groups on top of `empty()`
    pub(crate) fn replay(groups: Vec<Vec<VersionEdit>>) -> Result<Self> {
        if groups.is_empty() {
            return Err(CirrusError::ManifestCorruption(
                "manifest holds no edit groups".to_string(),
            ));
        }

        let mut state = Self::empty();
        for edit in groups.iter().flatten() {
            state.apply(edit).map_err(|e| {
                CirrusError::ManifestCorruption(format!("cannot replay {:?}: {}", edit, e))
            })?;
        }

        if !state.column_families.contains_key(&DEFAULT_COLUMN_FAMILY_ID) {
            return Err(CirrusError::ManifestCorruption(
                "default column family missing".to_string(),
            ));
        }
        Ok(state)
    }

    pub fn cf(&self, id: u32) -> Option<&ColumnFamilyMeta> {
        self.column_families.get(&id)
    }

    pub fn cf_by_name(&self, name: &str) -> Option<&ColumnFamilyMeta> {
        self.column_families.values().find(|cf| cf.name == name)
    }

    fn cf_mut(&mut self, id: u32) -> Result<&mut ColumnFamilyMeta> {
        self.column_families
            .get_mut(&id)
            .ok_or_else(|| CirrusError::InvalidColumnFamily(format!("id {}", id)))
    }

    fn contains_file(&self, number: u64) -> bool {
        self.column_families
            .values()
            .any(|cf| cf.files.iter().any(|f| f.number == number))
    }

    /// Numbers of every live table across families
    pub fn live_file_numbers(&self) -> BTreeSet<u64> {
        self.column_families
            .values()
            .flat_map(|cf| cf.files.iter().map(|f| f.number))
            .collect()
    }

    /// Lowest flushed sequence across families
    pub fn min_flushed_seq(&self) -> u64 {
        self.column_families
            .values()
            .map(|cf| cf.flushed_seq)
            .min()
            .unwrap_or(0)
    }
}

// =============================================================================
// Version Set
// =============================================================================

/// Owns the manifest file and the state it describes
///
/// Single writer: callers serialize access behind one lock.
pub struct VersionSet {
    writer: ManifestWriter,
    state: ManifestState,
    /// Groups appended since the last rewrite
    edits_since_rewrite: usize,
    rewrite_threshold: usize,
}

impl VersionSet {
    pub fn manifest_path(dir: &Path) -> PathBuf {
        dir.join(MANIFEST_FILE_NAME)
    }

    /// True if a manifest exists in `dir`
    pub fn exists(dir: &Path) -> bool {
        Self::manifest_path(dir).is_file()
    }

    /// Create a manifest for a brand new database
    pub fn create(dir: &Path, rewrite_threshold: usize) -> Result<Self> {
        Self::create_from(dir, ManifestState::initial(), rewrite_threshold)
    }

    /// Create a manifest holding `state` (used by cloud bootstrap)
    pub fn create_from(dir: &Path, state: ManifestState, rewrite_threshold: usize) -> Result<Self> {
        let writer = ManifestWriter::create(&Self::manifest_path(dir), &state.snapshot_edits())?;
        info!(dir = %dir.display(), "Created manifest");
        Ok(Self {
            writer,
            state,
            edits_since_rewrite: 0,
            rewrite_threshold,
        })
    }

    /// Open and replay an existing manifest
    pub fn open(dir: &Path, rewrite_threshold: usize) -> Result<Self> {
        let path = Self::manifest_path(dir);
        let (groups, valid_len) = ManifestReader::read_file(&path)?;
        let group_count = groups.len();
        let state = ManifestState::replay(groups)?;
        let writer = ManifestWriter::open(&path, valid_len)?;

        info!(
            groups = group_count,
            families = state.column_families.len(),
            last_sequence = state.last_sequence,
            "Replayed manifest"
        );

        Ok(Self {
            writer,
            state,
            edits_since_rewrite: group_count.saturating_sub(1),
            rewrite_threshold,
        })
    }

    /// Read the manifest state in `dir` without opening it for writing
    pub fn load(dir: &Path) -> Result<ManifestState> {
        let (groups, _) = ManifestReader::read_file(&Self::manifest_path(dir))?;
        ManifestState::replay(groups)
    }

    pub fn state(&self) -> &ManifestState {
        &self.state
    }

    /// Reserve a table number
    ///
    /// Persisted by the `AddFile` that eventually references it; numbers
    /// lost to a crash only leave orphan files, which open removes.
    pub fn new_file_number(&mut self) -> u64 {
        let number = self.state.next_file_number;
        self.state.next_file_number += 1;
        number
    }

    /// Validate, log, then install a group of edits atomically
    pub fn log_and_apply(&mut self, edits: Vec<VersionEdit>) -> Result<()> {
        if edits.is_empty() {
            return Ok(());
        }

        let mut next = self.state.clone();
        for edit in &edits {
            next.apply(edit)?;
        }

        self.writer.append(&edits)?;
        self.state = next;
        self.edits_since_rewrite += 1;
        debug!(edits = edits.len(), "Applied manifest edit group");

        if self.rewrite_threshold > 0 && self.edits_since_rewrite >= self.rewrite_threshold {
            if let Err(e) = self.rewrite() {
                warn!(error = %e, "Manifest rewrite failed; keeping the full log");
            }
        }
        Ok(())
    }

    /// Compact the log into one snapshot group
    pub fn rewrite(&mut self) -> Result<()> {
        let path = self.writer.path().to_path_buf();
        let before = self.writer.size();
        self.writer = ManifestWriter::create(&path, &self.state.snapshot_edits())?;
        self.edits_since_rewrite = 0;
        debug!(before, after = self.writer.size(), "Rewrote manifest");
        Ok(())
    }
}
