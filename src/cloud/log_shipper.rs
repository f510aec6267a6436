//! Replication log shipping
//!
//! A `LogShipper` receives every logged batch in addition to the local WAL.
//! The built-in `ObjectLogShipper` stores each batch as one object in the
//! destination bucket:
//!
//! ```text
//! <object_path>/log/<first lsn:020>-<last lsn:020>.rec   (a WAL frame)
//! ```
//!
//! Shipping runs on a background worker so writers never wait on the network.

use std::sync::Arc;
use std::thread::{self, JoinHandle};

use bytes::Bytes;
use crossbeam::channel::{self, Receiver, Sender};
use parking_lot::Mutex;
use tracing::{debug, error};

use crate::error::{CirrusError, Result};
use crate::wal::WalEntry;

use super::{Bucket, CloudEnv};

/// Directory of shipped records inside the bucket's object path
pub const LOG_OBJECT_DIR: &str = "log";

/// A remote replication channel for logged batches
pub trait LogShipper: Send + Sync {
    /// Ship one committed batch
    fn ship(&self, entry: &WalEntry) -> Result<()>;

    /// Shipped batches whose last sequence is above `after`, in order
    fn replay_after(&self, after: u64) -> Result<Vec<WalEntry>>;

    /// Forget batches whose last sequence is at or below `upto`
    fn trim(&self, upto: u64) -> Result<()>;
}

// =============================================================================
// Object Store Shipper
// =============================================================================

/// Ships batches as objects through a `CloudEnv`
pub struct ObjectLogShipper {
    env: Arc<CloudEnv>,
}

impl ObjectLogShipper {
    pub fn new(env: Arc<CloudEnv>) -> Self {
        Self { env }
    }

    pub fn object_name(first: u64, last: u64) -> String {
        format!("{}/{:020}-{:020}.rec", LOG_OBJECT_DIR, first, last)
    }

    /// Parse `(first, last)` out of a record object name
    pub fn parse_object_name(name: &str) -> Option<(u64, u64)> {
        let stem = name
            .strip_prefix(LOG_OBJECT_DIR)?
            .strip_prefix('/')?
            .strip_suffix(".rec")?;
        let (first, last) = stem.split_once('-')?;
        Some((first.parse().ok()?, last.parse().ok()?))
    }

    /// Shipped records, sorted by first sequence
    fn records(&self, bucket: Bucket) -> Result<Vec<(u64, u64, String)>> {
        let mut records: Vec<(u64, u64, String)> = self
            .env
            .list_objects(bucket)?
            .into_iter()
            .filter_map(|name| {
                let (first, last) = Self::parse_object_name(&name)?;
                Some((first, last, name))
            })
            .collect();
        records.sort();
        Ok(records)
    }

    /// Replay from a specific bucket (used after bootstrapping from source)
    pub fn replay_from(&self, bucket: Bucket, after: u64) -> Result<Vec<WalEntry>> {
        let mut entries = Vec::new();
        for (_, last, name) in self.records(bucket)? {
            if last <= after {
                continue;
            }
            let frame = self
                .env
                .get_object(bucket, &name)?
                .ok_or_else(|| CirrusError::ObjectNotFound(name.clone()))?;
            entries.push(WalEntry::decode_frame(&frame)?);
        }
        Ok(entries)
    }
}

impl LogShipper for ObjectLogShipper {
    fn ship(&self, entry: &WalEntry) -> Result<()> {
        let name = Self::object_name(entry.lsn, entry.last_lsn());
        self.env.put_object(&name, Bytes::from(entry.encode()?))
    }

    fn replay_after(&self, after: u64) -> Result<Vec<WalEntry>> {
        self.replay_from(Bucket::Dest, after)
    }

    fn trim(&self, upto: u64) -> Result<()> {
        let mut trimmed = 0;
        for (_, last, name) in self.records(Bucket::Dest)? {
            if last <= upto {
                self.env.delete_object(&name)?;
                trimmed += 1;
            }
        }
        if trimmed > 0 {
            debug!(trimmed, upto, "Trimmed shipped log records");
        }
        Ok(())
    }
}

// =============================================================================
// Background Worker
// =============================================================================

enum ShipMessage {
    Ship(WalEntry),
    Trim(u64),
    /// Reply once everything queued before it has been handled
    Barrier(Sender<()>),
    Shutdown,
}

/// Ships batches on a dedicated thread
pub struct LogShippingWorker {
    tx: Sender<ShipMessage>,
    last_error: Arc<Mutex<Option<String>>>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl LogShippingWorker {
    pub fn start(shipper: Arc<dyn LogShipper>) -> Result<Self> {
        let (tx, rx) = channel::unbounded();
        let last_error = Arc::new(Mutex::new(None));
        let worker_error = Arc::clone(&last_error);

        let handle = thread::Builder::new()
            .name("cirrus-log-ship".to_string())
            .spawn(move || Self::run(shipper, rx, worker_error))?;

        Ok(Self {
            tx,
            last_error,
            handle: Mutex::new(Some(handle)),
        })
    }

    fn run(
        shipper: Arc<dyn LogShipper>,
        rx: Receiver<ShipMessage>,
        last_error: Arc<Mutex<Option<String>>>,
    ) {
        for message in rx {
            let result = match message {
                ShipMessage::Ship(entry) => shipper.ship(&entry),
                ShipMessage::Trim(upto) => shipper.trim(upto),
                ShipMessage::Barrier(done) => {
                    let _ = done.send(());
                    Ok(())
                }
                ShipMessage::Shutdown => break,
            };
            if let Err(e) = result {
                error!(error = %e, "Log shipping failed");
                *last_error.lock() = Some(e.to_string());
            }
        }
    }

    /// Queue a batch for shipping
    pub fn ship(&self, entry: WalEntry) {
        let _ = self.tx.send(ShipMessage::Ship(entry));
    }

    /// Queue a trim of records covered by flushes
    pub fn trim(&self, upto: u64) {
        let _ = self.tx.send(ShipMessage::Trim(upto));
    }

    /// Block until everything queued so far has been handled
    pub fn wait_idle(&self) {
        let (done_tx, done_rx) = channel::bounded(1);
        if self.tx.send(ShipMessage::Barrier(done_tx)).is_ok() {
            let _ = done_rx.recv();
        }
    }

    pub fn last_error(&self) -> Option<String> {
        self.last_error.lock().clone()
    }

    /// Stop the worker after draining the queue
    pub fn shutdown(&self) {
        let _ = self.tx.send(ShipMessage::Shutdown);
        if let Some(handle) = self.handle.lock().take() {
            let _ = handle.join();
        }
    }
}

impl Drop for LogShippingWorker {
    fn drop(&mut self) {
        self.shutdown();
    }
}
