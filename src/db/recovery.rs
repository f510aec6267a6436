//! Open: manifest load or cloud bootstrap, WAL replay, worker start-up
//!
//! ## Recovery Process
//! ```text
//! 1. Load MANIFEST (or bootstrap it from the cloud, or create it)
//! 2. Create requested column families that are missing
//! 3. Remove orphan table files
//! 4. Replay WAL segments (and shipped log records after a bootstrap)
//! 5. Flush recovered memtables, record them in one edit group
//! 6. Retire the replayed segments, start a fresh one
//! 7. Start flush worker, cloud mirror and log shipper
//! ```

use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam::channel;
use parking_lot::{Condvar, Mutex, RwLock};
use tracing::{info, warn};

use crate::batch::Operation;
use crate::cloud::{
    fetch_manifest, install_tables, Bucket, CloudEnv, CloudMirror, LogShipper, LogShippingWorker,
    LogTransport, ObjectLogShipper, PersistentCache,
};
use crate::config::{ColumnFamilyDescriptor, ColumnFamilyOptions, Options};
use crate::error::{CirrusError, Result};
use crate::manifest::{ManifestState, VersionEdit, VersionSet};
use crate::memtable::MemTable;
use crate::storage::{table_file_name, StorageManager, TableHandle};
use crate::wal::{segment_path, WalEntry, WalRecovery, WalWriter, ARCHIVE_DIR};

use super::column_family::ResolvedOptions;
use super::flush::{retire_segment_file, spawn_worker};
use super::write::WriteState;
use super::{
    ColumnFamilyData, ColumnFamilyHandle, DbInner, DbState, NEXT_INSTANCE_ID, TABLE_DIR_NAME,
    WAL_DIR_NAME,
};

/// A freshly opened engine
pub(crate) struct Opened {
    pub inner: Arc<DbInner>,
    pub flush_worker: JoinHandle<()>,
    pub handles: Vec<ColumnFamilyHandle>,
}

pub(crate) fn open(
    options: Options,
    path: &Path,
    descriptors: Vec<ColumnFamilyDescriptor>,
    persistent_cache_path: Option<&Path>,
    cache_size: u64,
) -> Result<Opened> {
    info!(path = %path.display(), "Opening database");

    // =========================================================================
    // Step 1: Validate
    // =========================================================================
    check_descriptors(&descriptors)?;
    check_cloud_options(&options)?;

    let exists = VersionSet::exists(path);
    if exists && options.error_if_exists {
        return Err(CirrusError::InvalidArgument(format!(
            "database already exists at {}",
            path.display()
        )));
    }

    let cloud = match &options.cloud {
        Some(cloud_options) => Some(Arc::new(CloudEnv::new(cloud_options)?)),
        None => None,
    };

    // =========================================================================
    // Step 2: Manifest (nothing local is created until it is decided)
    // =========================================================================
    let remote = match (&cloud, exists) {
        (Some(env), false) => fetch_manifest(env)?,
        _ => None,
    };
    if !exists && remote.is_none() && !options.create_if_missing {
        return Err(CirrusError::InvalidArgument(match &cloud {
            Some(_) => format!(
                "no database at {} or in the cloud, and create_if_missing is false",
                path.display()
            ),
            None => format!(
                "no database at {} and create_if_missing is false",
                path.display()
            ),
        }));
    }

    let wal_dir = path.join(WAL_DIR_NAME);
    fs::create_dir_all(&wal_dir)?;
    let cache = match persistent_cache_path {
        Some(dir) => Some(Arc::new(PersistentCache::open(dir, cache_size)?)),
        None => None,
    };
    let storage = Arc::new(StorageManager::open(
        &path.join(TABLE_DIR_NAME),
        cache,
        cloud.clone(),
    )?);

    let threshold = options.manifest_rewrite_threshold;
    let mut bootstrapped: Option<Bucket> = None;
    let mut versions = match remote {
        _ if exists => VersionSet::open(path, threshold)?,
        Some(found) => {
            let eager = options
                .cloud
                .as_ref()
                .map_or(true, |c| c.keep_local_sst_files);
            install_tables(&storage, &found, eager)?;
            bootstrapped = Some(found.bucket);
            VersionSet::create_from(path, found.state, threshold)?
        }
        None => VersionSet::create(path, threshold)?,
    };

    create_missing_families(&options, &mut versions, &descriptors)?;

    // =========================================================================
    // Step 3: Tables
    // =========================================================================
    let live = versions.state().live_file_numbers();
    for number in &live {
        let name = table_file_name(*number);
        let local = storage.table_path(*number).is_file();
        let cached = storage.cache().map_or(false, |c| c.contains(&name));
        if !local && !cached && cloud.is_none() {
            return Err(CirrusError::ManifestCorruption(format!(
                "table {} referenced by the manifest is missing",
                name
            )));
        }
    }
    storage.remove_orphans(&live)?;

    // =========================================================================
    // Step 4: Replay
    // =========================================================================
    let (entries, wal_result) = WalRecovery::recover(&wal_dir)?;
    let mut recovered = Replay::new(versions.state());
    for entry in &entries {
        recovered.apply(entry);
    }

    if let (Some(bucket), Some(env)) = (bootstrapped, &cloud) {
        let after = versions.state().min_flushed_seq();
        let shipped = match options.cloud.as_ref().map(|c| &c.log_transport) {
            Some(LogTransport::ObjectStore) => {
                ObjectLogShipper::new(Arc::clone(env)).replay_from(bucket, after)?
            }
            Some(LogTransport::Custom(shipper)) => shipper.replay_after(after)?,
            _ => Vec::new(),
        };
        if !shipped.is_empty() {
            info!(records = shipped.len(), after, "Replaying shipped log records");
        }
        for entry in &shipped {
            recovered.apply(entry);
        }
    }

    info!(
        segments = wal_result.segments_replayed,
        entries = wal_result.entries_recovered,
        applied = recovered.applied,
        torn_tail = wal_result.torn_tail,
        last_lsn = wal_result.last_lsn,
        "WAL recovery complete"
    );

    // =========================================================================
    // Step 5: Flush recovered memtables
    // =========================================================================
    let last_sequence = versions.state().last_sequence.max(recovered.last_seq);
    let mut edits = Vec::new();
    for (cf_id, mem) in &recovered.memtables {
        if mem.is_empty() {
            continue;
        }
        let number = versions.new_file_number();
        if let Some((meta, _)) = storage.build_table(number, mem.iter().map(Ok))? {
            edits.push(VersionEdit::AddFile {
                cf_id: *cf_id,
                file: meta,
            });
        }
        edits.push(VersionEdit::SetFlushedSequence {
            cf_id: *cf_id,
            sequence: mem.max_seq(),
        });
    }
    if !edits.is_empty() || last_sequence > versions.state().last_sequence {
        edits.push(VersionEdit::SetLastSequence(last_sequence));
        edits.push(VersionEdit::SetNextFileNumber(versions.state().next_file_number));
        versions.log_and_apply(edits)?;
    }

    // =========================================================================
    // Step 6: Fresh WAL segment
    // =========================================================================
    let keep_logs = options
        .cloud
        .as_ref()
        .map_or(false, |c| c.keep_local_log_files);
    let mut highest_segment = 0;
    for (number, segment) in WalRecovery::list_segments(&wal_dir)? {
        highest_segment = highest_segment.max(number);
        retire_segment_file(&wal_dir, &segment, keep_logs)?;
    }
    for (number, _) in WalRecovery::list_segments(&wal_dir.join(ARCHIVE_DIR))? {
        highest_segment = highest_segment.max(number);
    }
    let wal_number = highest_segment + 1;
    let wal = WalWriter::open(&segment_path(&wal_dir, wal_number), options.wal_sync_strategy)?;

    // =========================================================================
    // Step 7: Engine state and workers
    // =========================================================================
    let cf_options: BTreeMap<&str, &ColumnFamilyOptions> = descriptors
        .iter()
        .map(|d| (d.name.as_str(), &d.options))
        .collect();
    let default_cf_options = ColumnFamilyOptions::default();
    let families: BTreeMap<u32, Arc<ColumnFamilyData>> = versions
        .state()
        .column_families
        .values()
        .map(|meta| {
            let overrides = cf_options
                .get(meta.name.as_str())
                .copied()
                .unwrap_or(&default_cf_options);
            let tables = meta
                .files
                .iter()
                .map(|file| Arc::new(TableHandle::new(file.clone())))
                .collect();
            let cf = ColumnFamilyData::new(
                meta.id,
                meta.name.clone(),
                ResolvedOptions::new(&options, overrides),
                tables,
            );
            (meta.id, Arc::new(cf))
        })
        .collect();

    let mirror = match &cloud {
        Some(env) if env.has_dest() => Some(CloudMirror::start(Arc::clone(env), Arc::clone(&storage))?),
        _ => None,
    };
    let shipper: Option<Arc<dyn LogShipper>> = match (options.cloud.as_ref(), &cloud) {
        (Some(c), Some(env)) => match &c.log_transport {
            LogTransport::LocalWal => None,
            LogTransport::ObjectStore => {
                Some(Arc::new(ObjectLogShipper::new(Arc::clone(env))) as Arc<dyn LogShipper>)
            }
            LogTransport::Custom(shipper) => Some(Arc::clone(shipper)),
        },
        _ => None,
    };
    let shipper = shipper.map(LogShippingWorker::start).transpose()?;

    let instance_id = NEXT_INSTANCE_ID.fetch_add(1, Ordering::Relaxed);
    let (flush_tx, flush_rx) = channel::unbounded();
    let inner = Arc::new(DbInner {
        path: path.to_path_buf(),
        wal_dir,
        options,
        instance_id,
        state: AtomicU8::new(DbState::Opening as u8),
        write_state: Mutex::new(WriteState {
            wal,
            wal_number,
            last_sequence,
        }),
        visible_seq: AtomicU64::new(last_sequence),
        versions: Mutex::new(versions),
        families: RwLock::new(families),
        storage,
        segments: Mutex::new(Vec::new()),
        bg_error: Mutex::new(None),
        stall: Mutex::new(()),
        stall_cv: Condvar::new(),
        flush_tx,
        mirror,
        mirror_version: AtomicU64::new(0),
        shipper,
    });
    let flush_worker = spawn_worker(Arc::clone(&inner), flush_rx)?;

    // Publish whatever the open itself changed
    let job = {
        let versions = inner.versions.lock();
        inner.mirror_job(versions.state())
    };
    match job {
        Ok(job) => inner.schedule_mirror(job),
        Err(e) => warn!(error = %e, "Could not schedule initial cloud sync"),
    }

    let handles = {
        let families = inner.families.read();
        descriptors
            .iter()
            .filter_map(|d| families.values().find(|cf| cf.name == d.name))
            .map(|cf| ColumnFamilyHandle::new(Arc::clone(cf), instance_id))
            .collect()
    };

    inner.set_state(DbState::Open);
    info!(
        path = %inner.path.display(),
        families = inner.families.read().len(),
        last_sequence,
        wal_segment = wal_number,
        bootstrapped = bootstrapped.is_some(),
        "Database opened"
    );

    Ok(Opened {
        inner,
        flush_worker,
        handles,
    })
}

// =============================================================================
// Helpers
// =============================================================================

fn check_descriptors(descriptors: &[ColumnFamilyDescriptor]) -> Result<()> {
    let mut seen = HashSet::new();
    for descriptor in descriptors {
        if descriptor.name.is_empty() {
            return Err(CirrusError::InvalidArgument(
                "column family name must not be empty".to_string(),
            ));
        }
        if !seen.insert(descriptor.name.as_str()) {
            return Err(CirrusError::InvalidArgument(format!(
                "column family '{}' requested twice",
                descriptor.name
            )));
        }
    }
    Ok(())
}

fn check_cloud_options(options: &Options) -> Result<()> {
    let Some(cloud) = &options.cloud else {
        return Ok(());
    };
    if matches!(cloud.log_transport, LogTransport::ObjectStore) && cloud.dest_bucket.is_none() {
        return Err(CirrusError::Config(
            "object store log shipping needs a destination bucket".to_string(),
        ));
    }
    Ok(())
}

/// Record requested families the manifest does not know yet
fn create_missing_families(
    options: &Options,
    versions: &mut VersionSet,
    descriptors: &[ColumnFamilyDescriptor],
) -> Result<()> {
    let missing: Vec<&str> = descriptors
        .iter()
        .map(|d| d.name.as_str())
        .filter(|name| versions.state().cf_by_name(name).is_none())
        .collect();
    if missing.is_empty() {
        return Ok(());
    }
    if !options.create_missing_column_families {
        return Err(CirrusError::InvalidArgument(format!(
            "column family '{}' does not exist and create_missing_column_families is false",
            missing[0]
        )));
    }

    let mut next_id = versions.state().next_column_family_id;
    let mut edits = Vec::with_capacity(missing.len() + 1);
    for name in &missing {
        edits.push(VersionEdit::CreateColumnFamily {
            id: next_id,
            name: (*name).to_string(),
        });
        next_id += 1;
    }
    edits.push(VersionEdit::SetNextColumnFamilyId(next_id));
    versions.log_and_apply(edits)?;

    info!(created = ?missing, "Created missing column families");
    Ok(())
}

/// Memtables rebuilt from logged batches
struct Replay {
    /// Flushed sequence of each live family
    flushed: BTreeMap<u32, u64>,
    memtables: BTreeMap<u32, MemTable>,
    last_seq: u64,
    applied: u64,
}

impl Replay {
    fn new(state: &ManifestState) -> Self {
        Self {
            flushed: state
                .column_families
                .values()
                .map(|cf| (cf.id, cf.flushed_seq))
                .collect(),
            memtables: BTreeMap::new(),
            last_seq: 0,
            applied: 0,
        }
    }

    /// Apply the operations of `entry` not yet covered by a flush
    fn apply(&mut self, entry: &WalEntry) {
        for (i, op) in entry.operations.iter().enumerate() {
            let seq = entry.lsn + i as u64;
            self.last_seq = self.last_seq.max(seq);

            // Dropped families and flushed data are skipped
            let Some(&flushed) = self.flushed.get(&op.cf_id()) else {
                continue;
            };
            if seq <= flushed {
                continue;
            }

            let mem = self.memtables.entry(op.cf_id()).or_default();
            match op {
                Operation::Put { key, value, .. } => {
                    mem.put(key.clone(), seq, value.clone());
                }
                Operation::Delete { key, .. } => {
                    mem.delete(key.clone(), seq);
                }
            }
            self.applied += 1;
        }
    }
}
