//! Cloud mirror worker
//!
//! Makes local state remotely durable. Every manifest change schedules a
//! sync job stamped with a version taken under the manifest lock; the worker
//! coalesces whatever is queued, syncs the highest version and skips jobs
//! older than the last one published:
//!
//! ```text
//! 1. upload referenced tables not yet uploaded   (data first)
//! 2. upload MANIFEST                             (then the pointer to it)
//! 3. delete remote tables no longer referenced
//! 4. delete obsolete local table files
//! ```
//!
//! Failures are retried by `CloudEnv`; once retries are exhausted the error
//! is kept (sticky) and reported to callers waiting on the sync.

use std::collections::{BTreeSet, HashSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use bytes::Bytes;
use crossbeam::channel::{self, Receiver, Sender};
use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use crate::error::{CirrusError, Result};
use crate::manifest::MANIFEST_FILE_NAME;
use crate::storage::{parse_table_number, table_file_name, StorageManager};

use super::{Bucket, CloudEnv};

/// Completion signal for a sync job
pub type SyncDone = Sender<std::result::Result<(), String>>;

/// One request to bring the destination bucket up to date
pub struct MirrorJob {
    /// Increases with every manifest change; a job never replaces a newer one
    pub version: u64,
    /// Snapshot encoding of the manifest to publish
    pub manifest: Bytes,
    /// Tables the manifest references
    pub live_tables: BTreeSet<u64>,
    /// Local table files that became obsolete with this manifest
    pub obsolete_local: Vec<u64>,
    /// Every logged sequence up to here is in a table this manifest references
    pub flushed_upto: u64,
    pub done: Option<SyncDone>,
}

enum MirrorMessage {
    Sync(MirrorJob),
    Shutdown,
}

/// Handle to the background mirror thread
pub struct CloudMirror {
    tx: Sender<MirrorMessage>,
    last_error: Arc<Mutex<Option<String>>>,
    published_upto: Arc<AtomicU64>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl CloudMirror {
    /// Start the worker; the uploaded set is seeded from a bucket listing
    pub fn start(env: Arc<CloudEnv>, storage: Arc<StorageManager>) -> Result<Self> {
        let uploaded: HashSet<String> = match env.list_objects(Bucket::Dest) {
            Ok(names) => names.into_iter().filter(|n| n.ends_with(".sst")).collect(),
            Err(e) => {
                warn!(error = %e, "Could not list destination bucket; will upload everything");
                HashSet::new()
            }
        };

        let (tx, rx) = channel::unbounded();
        let last_error = Arc::new(Mutex::new(None));
        let published_upto = Arc::new(AtomicU64::new(0));

        let mut worker = MirrorWorker {
            env,
            storage,
            uploaded,
            pending_local_deletes: BTreeSet::new(),
            published: 0,
            published_live: BTreeSet::new(),
            published_upto: Arc::clone(&published_upto),
            last_error: Arc::clone(&last_error),
        };
        let handle = thread::Builder::new()
            .name("cirrus-mirror".to_string())
            .spawn(move || worker.run(rx))?;

        Ok(Self {
            tx,
            last_error,
            published_upto,
            handle: Mutex::new(Some(handle)),
        })
    }

    /// Queue a sync job without waiting
    pub fn schedule(&self, job: MirrorJob) {
        if self.tx.send(MirrorMessage::Sync(job)).is_err() {
            warn!("Cloud mirror is stopped; dropping sync job");
        }
    }

    /// Queue a sync job and wait for it to finish
    pub fn sync_and_wait(&self, mut job: MirrorJob) -> Result<()> {
        let (done_tx, done_rx) = channel::bounded(1);
        job.done = Some(done_tx);
        self.tx
            .send(MirrorMessage::Sync(job))
            .map_err(|_| CirrusError::Background("cloud mirror is stopped".to_string()))?;

        match done_rx.recv() {
            Ok(Ok(())) => Ok(()),
            Ok(Err(msg)) => Err(CirrusError::Background(msg)),
            Err(_) => Err(CirrusError::Background(
                "cloud mirror stopped before finishing".to_string(),
            )),
        }
    }

    /// Last sync failure, cleared by the next successful sync
    pub fn last_error(&self) -> Option<String> {
        self.last_error.lock().clone()
    }

    /// `flushed_upto` of the last manifest published to the bucket
    pub fn published_upto(&self) -> u64 {
        self.published_upto.load(Ordering::Acquire)
    }

    /// Stop the worker after it finishes queued jobs
    pub fn shutdown(&self) {
        let _ = self.tx.send(MirrorMessage::Shutdown);
        if let Some(handle) = self.handle.lock().take() {
            let _ = handle.join();
        }
    }
}

impl Drop for CloudMirror {
    fn drop(&mut self) {
        self.shutdown();
    }
}

// =============================================================================
// Worker
// =============================================================================

struct MirrorWorker {
    env: Arc<CloudEnv>,
    storage: Arc<StorageManager>,
    /// Table objects known to exist in the destination bucket
    uploaded: HashSet<String>,
    /// Obsolete local tables still waiting for a successful sync
    pending_local_deletes: BTreeSet<u64>,
    /// Version and tables of the last manifest in the bucket
    published: u64,
    published_live: BTreeSet<u64>,
    published_upto: Arc<AtomicU64>,
    last_error: Arc<Mutex<Option<String>>>,
}

impl MirrorWorker {
    fn run(&mut self, rx: Receiver<MirrorMessage>) {
        info!(uploaded = self.uploaded.len(), "Cloud mirror started");

        while let Ok(message) = rx.recv() {
            let MirrorMessage::Sync(first) = message else {
                break;
            };

            // Coalesce everything already queued behind this job
            let mut jobs = vec![first];
            let mut stop = false;
            while let Ok(message) = rx.try_recv() {
                match message {
                    MirrorMessage::Sync(job) => jobs.push(job),
                    MirrorMessage::Shutdown => {
                        stop = true;
                        break;
                    }
                }
            }

            self.handle(jobs);
            if stop {
                break;
            }
        }

        debug!("Cloud mirror stopped");
    }

    fn handle(&mut self, jobs: Vec<MirrorJob>) {
        let mut waiters = Vec::new();
        let mut latest: Option<MirrorJob> = None;
        for mut job in jobs {
            self.pending_local_deletes.extend(job.obsolete_local.drain(..));
            if let Some(done) = job.done.take() {
                waiters.push(done);
            }
            if latest.as_ref().map_or(true, |l| job.version > l.version) {
                latest = Some(job);
            }
        }
        let Some(job) = latest else {
            return;
        };

        let outcome = if job.version <= self.published {
            debug!(
                version = job.version,
                published = self.published,
                "Skipping superseded sync job"
            );
            self.delete_obsolete_local();
            Ok(())
        } else {
            self.sync(&job)
        };
        match &outcome {
            Ok(()) => {
                *self.last_error.lock() = None;
            }
            Err(e) => {
                error!(error = %e, "Cloud sync failed");
                *self.last_error.lock() = Some(e.to_string());
            }
        }

        let reply = outcome.map_err(|e| e.to_string());
        for done in waiters {
            let _ = done.send(reply.clone());
        }
    }

    fn sync(&mut self, job: &MirrorJob) -> Result<()> {
        // 1. Data files
        let mut uploaded = 0;
        for number in &job.live_tables {
            let name = table_file_name(*number);
            if self.uploaded.contains(&name) {
                continue;
            }
            let path: PathBuf = self.storage.materialize(&name)?;
            self.env.upload_file(&path, &name)?;
            self.uploaded.insert(name);
            uploaded += 1;
        }

        // 2. The manifest referencing them
        self.env.put_object(MANIFEST_FILE_NAME, job.manifest.clone())?;
        self.published = job.version;
        self.published_live = job.live_tables.clone();
        self.published_upto.fetch_max(job.flushed_upto, Ordering::AcqRel);

        // 3. Remote tables nothing references any more
        let stale: Vec<String> = self
            .uploaded
            .iter()
            .filter(|name| {
                parse_table_number(name).map_or(false, |n| !job.live_tables.contains(&n))
            })
            .cloned()
            .collect();
        for name in &stale {
            self.env.delete_object(name)?;
            self.uploaded.remove(name);
        }

        // 4. Local files made obsolete by this manifest
        let deleted_local = self.delete_obsolete_local();

        debug!(
            version = job.version,
            uploaded,
            deleted_remote = stale.len(),
            deleted_local,
            live = job.live_tables.len(),
            "Cloud sync complete"
        );
        Ok(())
    }

    /// Delete pending local tables the published manifest no longer uses
    fn delete_obsolete_local(&mut self) -> usize {
        if self.published == 0 {
            return 0;
        }
        let deletable: Vec<u64> = self
            .pending_local_deletes
            .iter()
            .copied()
            .filter(|n| !self.published_live.contains(n))
            .collect();
        for number in &deletable {
            self.storage.delete_table(*number);
            self.pending_local_deletes.remove(number);
        }
        deletable.len()
    }
}
