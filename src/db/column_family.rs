//! Column families: per-family state, handles, create/drop

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::info;

use crate::batch::DEFAULT_COLUMN_FAMILY_ID;
use crate::config::{ColumnFamilyOptions, Options};
use crate::error::{CirrusError, Result};
use crate::manifest::VersionEdit;
use crate::memtable::MemTable;
use crate::storage::TableHandle;

use super::DbInner;

/// Options of a family after applying its overrides
#[derive(Debug, Clone, Copy)]
pub(crate) struct ResolvedOptions {
    pub memtable_size_limit: usize,
    pub level0_compaction_trigger: usize,
}

impl ResolvedOptions {
    pub fn new(db: &Options, cf: &ColumnFamilyOptions) -> Self {
        Self {
            memtable_size_limit: cf.memtable_size_limit.unwrap_or(db.memtable_size_limit),
            level0_compaction_trigger: cf
                .level0_compaction_trigger
                .unwrap_or(db.level0_compaction_trigger),
        }
    }
}

/// Active memtable plus the ones waiting to be flushed
pub(crate) struct MemTables {
    pub active: Arc<MemTable>,
    /// Oldest first
    pub imm: Vec<Arc<MemTable>>,
}

/// Everything a reader needs, captured at one instant
pub(crate) struct ReadView {
    /// Newest first
    pub memtables: Vec<Arc<MemTable>>,
    /// Newest first
    pub tables: Vec<Arc<TableHandle>>,
}

/// In-memory state of one open column family
pub(crate) struct ColumnFamilyData {
    pub(crate) id: u32,
    pub(crate) name: String,
    pub(crate) options: ResolvedOptions,
    pub(crate) mem: RwLock<MemTables>,
    pub(crate) tables: RwLock<Vec<Arc<TableHandle>>>,
    dropped: AtomicBool,
}

impl ColumnFamilyData {
    pub(crate) fn new(
        id: u32,
        name: String,
        options: ResolvedOptions,
        tables: Vec<Arc<TableHandle>>,
    ) -> Self {
        Self {
            id,
            name,
            options,
            mem: RwLock::new(MemTables {
                active: Arc::new(MemTable::new()),
                imm: Vec::new(),
            }),
            tables: RwLock::new(tables),
            dropped: AtomicBool::new(false),
        }
    }

    pub(crate) fn is_dropped(&self) -> bool {
        self.dropped.load(Ordering::Acquire)
    }

    pub(crate) fn mark_dropped(&self) {
        self.dropped.store(true, Ordering::Release);
    }

    /// Snapshot of memtables and tables (lock order: mem, then tables)
    pub(crate) fn read_view(&self) -> ReadView {
        let mem = self.mem.read();
        let tables = self.tables.read();

        let mut memtables = Vec::with_capacity(mem.imm.len() + 1);
        memtables.push(Arc::clone(&mem.active));
        memtables.extend(mem.imm.iter().rev().cloned());

        ReadView {
            memtables,
            tables: tables.clone(),
        }
    }

    pub(crate) fn memtable_size(&self) -> usize {
        let mem = self.mem.read();
        mem.active.size() + mem.imm.iter().map(|m| m.size()).sum::<usize>()
    }

    pub(crate) fn immutable_count(&self) -> usize {
        self.mem.read().imm.len()
    }

    /// Lowest sequence still only in memory, if any
    pub(crate) fn oldest_unflushed_seq(&self) -> Option<u64> {
        let mem = self.mem.read();
        mem.imm
            .iter()
            .chain(std::iter::once(&mem.active))
            .filter_map(|m| m.min_seq())
            .min()
    }
}

// =============================================================================
// Handle
// =============================================================================

/// Caller's reference to a column family
///
/// Bound to the `Db` instance that issued it. A handle whose family was
/// dropped, or that comes from another instance, is rejected with
/// `InvalidColumnFamily`. Handles are move-only; release one with
/// `Db::destroy_column_family_handle` or by dropping it.
pub struct ColumnFamilyHandle {
    cf: Arc<ColumnFamilyData>,
    instance_id: u64,
}

impl ColumnFamilyHandle {
    pub(crate) fn new(cf: Arc<ColumnFamilyData>, instance_id: u64) -> Self {
        Self { cf, instance_id }
    }

    pub fn id(&self) -> u32 {
        self.cf.id
    }

    pub fn name(&self) -> &str {
        &self.cf.name
    }

    pub(crate) fn instance_id(&self) -> u64 {
        self.instance_id
    }

    pub(crate) fn data(&self) -> &Arc<ColumnFamilyData> {
        &self.cf
    }
}

impl fmt::Debug for ColumnFamilyHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ColumnFamilyHandle")
            .field("id", &self.cf.id)
            .field("name", &self.cf.name)
            .field("dropped", &self.cf.is_dropped())
            .finish()
    }
}

// =============================================================================
// Create / Drop
// =============================================================================

impl DbInner {
    pub(crate) fn create_column_family(
        &self,
        name: &str,
        options: &ColumnFamilyOptions,
    ) -> Result<ColumnFamilyHandle> {
        self.check_open()?;
        if name.is_empty() {
            return Err(CirrusError::InvalidArgument(
                "column family name must not be empty".to_string(),
            ));
        }

        let mut versions = self.versions.lock();
        if versions.state().cf_by_name(name).is_some() {
            return Err(CirrusError::InvalidArgument(format!(
                "column family '{}' already exists",
                name
            )));
        }

        let id = versions.state().next_column_family_id;
        versions.log_and_apply(vec![
            VersionEdit::CreateColumnFamily {
                id,
                name: name.to_string(),
            },
            VersionEdit::SetNextColumnFamilyId(id + 1),
        ])?;

        let cf = Arc::new(ColumnFamilyData::new(
            id,
            name.to_string(),
            ResolvedOptions::new(&self.options, options),
            Vec::new(),
        ));
        self.families.write().insert(id, Arc::clone(&cf));
        let job = self.mirror_job(versions.state())?;
        drop(versions);

        self.schedule_mirror(job);
        info!(name, id, "Created column family");
        Ok(ColumnFamilyHandle::new(cf, self.instance_id))
    }

    pub(crate) fn drop_column_family(&self, handle: &ColumnFamilyHandle) -> Result<()> {
        let cf = self.family(handle)?;
        if cf.id == DEFAULT_COLUMN_FAMILY_ID {
            return Err(CirrusError::InvalidArgument(
                "the default column family cannot be dropped".to_string(),
            ));
        }

        let mut versions = self.versions.lock();
        versions.log_and_apply(vec![VersionEdit::DropColumnFamily { id: cf.id }])?;
        cf.mark_dropped();
        self.families.write().remove(&cf.id);

        let obsolete = cf.tables.read().clone();
        let job = self.mirror_job(versions.state())?;
        drop(versions);

        self.retire_tables(&obsolete, job);
        self.stall_cv.notify_all();
        self.purge_wal_segments();

        info!(name = %cf.name, id = cf.id, tables = obsolete.len(), "Dropped column family");
        Ok(())
    }

    pub(crate) fn destroy_column_family_handle(&self, handle: ColumnFamilyHandle) -> Result<()> {
        if handle.instance_id() != self.instance_id {
            return Err(CirrusError::InvalidColumnFamily(format!(
                "handle for '{}' belongs to another database instance",
                handle.name()
            )));
        }
        drop(handle);
        Ok(())
    }

    pub(crate) fn cf_handle(&self, name: &str) -> Option<ColumnFamilyHandle> {
        if self.check_open().is_err() {
            return None;
        }
        self.families
            .read()
            .values()
            .find(|cf| cf.name == name)
            .map(|cf| ColumnFamilyHandle::new(Arc::clone(cf), self.instance_id))
    }
}
