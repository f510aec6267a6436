//! Background flush worker, WAL retirement and mirror scheduling
//!
//! ## Flush Sequence (per immutable memtable, oldest first)
//! ```text
//! build table ──► log AddFile + SetFlushedSequence ──► install table,
//! drop memtable ──► maybe compact ──► retire WAL segments ──► mirror sync
//! ```

use std::fs;
use std::path::Path;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use bytes::Bytes;
use crossbeam::channel::{self, Receiver, Sender};
use tracing::{debug, error, warn};

use crate::cloud::MirrorJob;
use crate::config::FlushOptions;
use crate::error::{CirrusError, Result};
use crate::manifest::{ManifestState, VersionEdit};
use crate::storage::TableHandle;
use crate::wal::ARCHIVE_DIR;

use super::{ColumnFamilyData, DbInner};

/// Completion signal for a queued flush or compaction
pub(crate) type Done = Sender<std::result::Result<(), String>>;

pub(crate) enum FlushMessage {
    /// Flush every immutable memtable of a family
    Flush { cf_id: u32, done: Option<Done> },
    /// Merge all tables of a family
    Compact { cf_id: u32, done: Option<Done> },
    Shutdown,
}

/// Spawn the flush/compaction worker
pub(crate) fn spawn_worker(inner: Arc<DbInner>, rx: Receiver<FlushMessage>) -> Result<JoinHandle<()>> {
    let handle = thread::Builder::new()
        .name("cirrus-flush".to_string())
        .spawn(move || run(inner, rx))?;
    Ok(handle)
}

fn run(inner: Arc<DbInner>, rx: Receiver<FlushMessage>) {
    debug!("Flush worker started");
    for message in rx {
        match message {
            FlushMessage::Flush { cf_id, done } => {
                let result = inner.background_flush(cf_id);
                reply(done, result);
            }
            FlushMessage::Compact { cf_id, done } => {
                let result = inner.background_compact(cf_id);
                reply(done, result);
            }
            FlushMessage::Shutdown => break,
        }
    }
    debug!("Flush worker stopped");
}

fn reply(done: Option<Done>, result: Result<()>) {
    if let Some(done) = done {
        let _ = done.send(result.map_err(|e| e.to_string()));
    }
}

/// Move a segment to `wal/archive/`, or delete it
pub(crate) fn retire_segment_file(wal_dir: &Path, path: &Path, keep: bool) -> Result<()> {
    if keep {
        let archive = wal_dir.join(ARCHIVE_DIR);
        fs::create_dir_all(&archive)?;
        if let Some(name) = path.file_name() {
            fs::rename(path, archive.join(name))?;
        }
    } else {
        fs::remove_file(path)?;
    }
    Ok(())
}

/// Wait for a worker reply
pub(crate) fn wait_done(rx: Receiver<std::result::Result<(), String>>) -> Result<()> {
    match rx.recv() {
        Ok(Ok(())) => Ok(()),
        Ok(Err(msg)) => Err(CirrusError::Background(msg)),
        Err(_) => Err(CirrusError::Closed),
    }
}

impl DbInner {
    // =========================================================================
    // Foreground Entry Points
    // =========================================================================

    /// Swap the active memtable and flush everything pending for `cf`
    pub(crate) fn flush_family(&self, opts: &FlushOptions, cf: &ColumnFamilyData) -> Result<()> {
        {
            let mut ws = self.write_state.lock();
            self.switch_memtable(&mut ws, cf)?;
        }

        if cf.immutable_count() > 0 {
            if opts.wait {
                let (done_tx, done_rx) = channel::bounded(1);
                self.flush_tx
                    .send(FlushMessage::Flush {
                        cf_id: cf.id,
                        done: Some(done_tx),
                    })
                    .map_err(|_| CirrusError::Closed)?;
                wait_done(done_rx)?;
            } else {
                let _ = self.flush_tx.send(FlushMessage::Flush {
                    cf_id: cf.id,
                    done: None,
                });
            }
        }

        if opts.wait_for_upload {
            self.wait_for_upload()?;
        }
        Ok(())
    }

    /// Block until the mirror has published the current manifest
    pub(crate) fn wait_for_upload(&self) -> Result<()> {
        if let Some(shipper) = &self.shipper {
            shipper.wait_idle();
        }
        let Some(mirror) = &self.mirror else {
            return Ok(());
        };
        let job = {
            let versions = self.versions.lock();
            self.mirror_job(versions.state())?
        };
        if let Some(job) = job {
            mirror.sync_and_wait(job)?;
        }
        self.trim_shipped_log(self.durable_bound());
        Ok(())
    }

    /// Flush every family and wait for the mirror (orderly close)
    pub(crate) fn flush_all_for_close(&self) -> Result<()> {
        let families: Vec<Arc<ColumnFamilyData>> = self.families.read().values().cloned().collect();
        let opts = FlushOptions {
            wait: true,
            wait_for_upload: false,
        };

        let mut first_error = None;
        for cf in families {
            if let Err(e) = self.flush_family(&opts, &cf) {
                error!(cf = %cf.name, error = %e, "Flush at close failed");
                first_error.get_or_insert(e);
            }
        }
        if let Err(e) = self.wait_for_upload() {
            error!(error = %e, "Cloud sync at close failed");
            first_error.get_or_insert(e);
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Queue a compaction of `cf` and wait for it
    pub(crate) fn request_compaction(&self, cf: &ColumnFamilyData) -> Result<()> {
        let (done_tx, done_rx) = channel::bounded(1);
        self.flush_tx
            .send(FlushMessage::Compact {
                cf_id: cf.id,
                done: Some(done_tx),
            })
            .map_err(|_| CirrusError::Closed)?;
        wait_done(done_rx)
    }

    // =========================================================================
    // Worker Side
    // =========================================================================

    fn background_flush(&self, cf_id: u32) -> Result<()> {
        // Dropped since the request was queued
        let Ok(cf) = self.family_by_id(cf_id) else {
            return Ok(());
        };

        let result = self
            .flush_immutables(&cf)
            .and_then(|()| self.maybe_compact(&cf));
        self.finish_background(result)
    }

    fn background_compact(&self, cf_id: u32) -> Result<()> {
        let Ok(cf) = self.family_by_id(cf_id) else {
            return Err(CirrusError::InvalidColumnFamily(format!("id {}", cf_id)));
        };
        let result = self.compact(&cf);
        self.finish_background(result)
    }

    fn finish_background(&self, result: Result<()>) -> Result<()> {
        {
            let _guard = self.stall.lock();
            self.stall_cv.notify_all();
        }
        if let Err(e) = &result {
            error!(error = %e, "Background work failed");
            self.set_background_error(e);
        }
        self.purge_wal_segments();
        result
    }

    /// Write each immutable memtable of `cf` to a table, oldest first
    fn flush_immutables(&self, cf: &ColumnFamilyData) -> Result<()> {
        loop {
            let Some(imm) = cf.mem.read().imm.first().cloned() else {
                return Ok(());
            };
            if cf.is_dropped() {
                return Ok(());
            }

            let number = self.versions.lock().new_file_number();
            let built = self.storage.build_table(number, imm.iter().map(Ok))?;

            let mut edits = Vec::with_capacity(4);
            if let Some((meta, _)) = &built {
                edits.push(VersionEdit::AddFile {
                    cf_id: cf.id,
                    file: meta.clone(),
                });
            }
            edits.push(VersionEdit::SetFlushedSequence {
                cf_id: cf.id,
                sequence: imm.max_seq(),
            });
            edits.push(VersionEdit::SetLastSequence(
                self.visible_seq.load(Ordering::Acquire),
            ));
            edits.push(VersionEdit::SetNextFileNumber(number + 1));

            let mut versions = self.versions.lock();
            if let Err(e) = versions.log_and_apply(edits) {
                drop(versions);
                if built.is_some() {
                    self.storage.delete_table(number);
                }
                if cf.is_dropped() {
                    return Ok(());
                }
                return Err(e);
            }
            let job = self.mirror_job(versions.state())?;
            drop(versions);

            // Install: table becomes visible as the memtable goes away
            {
                let mut mem = cf.mem.write();
                let mut tables = cf.tables.write();
                if let Some((meta, reader)) = built {
                    tables.insert(0, Arc::new(TableHandle::with_reader(meta, reader)));
                }
                if mem.imm.first().map_or(false, |m| Arc::ptr_eq(m, &imm)) {
                    mem.imm.remove(0);
                }
            }
            {
                let _guard = self.stall.lock();
                self.stall_cv.notify_all();
            }

            debug!(
                cf = %cf.name,
                table = number,
                entries = imm.entry_count(),
                flushed_seq = imm.max_seq(),
                "Flushed memtable"
            );
            self.schedule_mirror(job);
        }
    }

    fn maybe_compact(&self, cf: &ColumnFamilyData) -> Result<()> {
        let trigger = cf.options.level0_compaction_trigger;
        if trigger >= 2 && cf.tables.read().len() >= trigger {
            self.compact(cf)?;
        }
        Ok(())
    }

    // =========================================================================
    // WAL Retirement
    // =========================================================================

    /// Every sequence below the returned bound is in a table
    pub(crate) fn durable_bound(&self) -> u64 {
        let visible = self.visible_seq.load(Ordering::Acquire);
        let mut bound = visible + 1;
        for cf in self.families.read().values() {
            if let Some(min) = cf.oldest_unflushed_seq() {
                bound = bound.min(min);
            }
        }
        bound
    }

    /// Retire sealed segments whose records are all in tables
    pub(crate) fn purge_wal_segments(&self) {
        let bound = self.durable_bound();

        let retired = {
            let mut segments = self.segments.lock();
            let (retired, kept): (Vec<_>, Vec<_>) =
                segments.drain(..).partition(|seg| seg.max_seq < bound);
            *segments = kept;
            retired
        };

        for segment in &retired {
            if let Err(e) = self.retire_segment(&segment.path) {
                warn!(segment = segment.number, error = %e, "Failed to retire WAL segment");
            }
        }
        if !retired.is_empty() {
            debug!(retired = retired.len(), bound, "Retired WAL segments");
        }

        self.trim_shipped_log(bound);
    }

    /// Trim shipped records below `bound` that the bucket's manifest covers
    ///
    /// With a mirror, records stay until an uploaded manifest references the
    /// tables holding them, so a bootstrap can always close the gap.
    fn trim_shipped_log(&self, bound: u64) {
        let Some(shipper) = &self.shipper else {
            return;
        };
        let mut upto = bound.saturating_sub(1);
        if let Some(mirror) = &self.mirror {
            upto = upto.min(mirror.published_upto());
        }
        if upto > 0 {
            shipper.trim(upto);
        }
    }

    /// Archive or delete one WAL segment
    pub(crate) fn retire_segment(&self, path: &Path) -> Result<()> {
        let keep = self
            .options
            .cloud
            .as_ref()
            .map_or(false, |cloud| cloud.keep_local_log_files);
        retire_segment_file(&self.wal_dir, path, keep)
    }

    // =========================================================================
    // Mirror Scheduling
    // =========================================================================

    /// A sync job for `state`, or `None` without a mirror
    ///
    /// Must be called with `versions` held so job versions follow manifest
    /// order.
    pub(crate) fn mirror_job(&self, state: &ManifestState) -> Result<Option<MirrorJob>> {
        if self.mirror.is_none() {
            return Ok(None);
        }
        Ok(Some(MirrorJob {
            version: self.mirror_version.fetch_add(1, Ordering::AcqRel) + 1,
            manifest: Bytes::from(state.encode_snapshot()?),
            live_tables: state.live_file_numbers(),
            obsolete_local: Vec::new(),
            flushed_upto: self.durable_bound().saturating_sub(1),
            done: None,
        }))
    }

    pub(crate) fn schedule_mirror(&self, job: Option<MirrorJob>) {
        if let (Some(mirror), Some(job)) = (&self.mirror, job) {
            mirror.schedule(job);
        }
    }

    /// Hand obsolete tables to the mirror, or delete them once unused
    pub(crate) fn retire_tables(&self, tables: &[Arc<TableHandle>], job: Option<MirrorJob>) {
        match (&self.mirror, job) {
            (Some(mirror), Some(mut job)) => {
                job.obsolete_local = tables.iter().map(|t| t.number()).collect();
                mirror.schedule(job);
            }
            _ => {
                for table in tables {
                    table.retire(self.storage.table_path(table.number()));
                }
            }
        }
    }
}
