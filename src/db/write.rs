//! Write path: WAL append, memtable apply, publish, memtable swap

use std::collections::BTreeMap;
use std::mem;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::batch::{Operation, WriteBatch};
use crate::config::WriteOptions;
use crate::error::{CirrusError, Result};
use crate::memtable::MemTable;
use crate::wal::{segment_path, WalEntry, WalWriter};

use super::flush::FlushMessage;
use super::{ColumnFamilyData, DbInner, DbState, SealedSegment};

/// How long a stalled writer sleeps between checks
const STALL_POLL: Duration = Duration::from_millis(100);

/// State guarded by the write lock
pub(crate) struct WriteState {
    /// Active WAL segment
    pub wal: WalWriter,
    pub wal_number: u64,
    /// Last sequence handed out
    pub last_sequence: u64,
}

impl DbInner {
    /// Apply a batch atomically
    ///
    /// Steps:
    /// 1. Resolve target families (stale handles fail here, nothing written)
    /// 2. Acquire write lock, wait out a write stall if needed
    /// 3. Append the batch to the WAL (unless disabled)
    /// 4. Apply every operation to its family's memtable
    /// 5. Publish the batch's last sequence
    /// 6. Swap out full memtables and hand them to the flush worker
    pub(crate) fn write(&self, opts: &WriteOptions, batch: WriteBatch) -> Result<()> {
        self.check_open()?;
        if batch.instances().iter().any(|&id| id != self.instance_id) {
            return Err(CirrusError::InvalidColumnFamily(
                "batch holds a handle from another database instance".to_string(),
            ));
        }
        if batch.is_empty() {
            return Ok(());
        }

        let ops = batch.into_operations();
        let targets = self.resolve_targets(&ops)?;

        let mut ws = self.write_state.lock();
        for cf in targets.values() {
            self.wait_for_room(cf)?;
        }

        // Step 3: WAL first (durability guarantee)
        let base = ws.last_sequence + 1;
        let entry = WalEntry::new(base, ops);
        if !opts.disable_wal {
            ws.wal.append(&entry, opts.sync)?;
        }

        // Step 4: MemTables
        for (i, op) in entry.operations.iter().enumerate() {
            let seq = base + i as u64;
            let Some(cf) = targets.get(&op.cf_id()) else {
                continue;
            };
            let mem = cf.mem.read();
            match op {
                Operation::Put { key, value, .. } => {
                    mem.active.put(key.clone(), seq, value.clone());
                }
                Operation::Delete { key, .. } => {
                    mem.active.delete(key.clone(), seq);
                }
            }
        }

        // Step 5: Publish
        let last = entry.last_lsn();
        ws.last_sequence = last;
        self.visible_seq.store(last, Ordering::Release);

        if !opts.disable_wal {
            if let Some(shipper) = &self.shipper {
                shipper.ship(entry);
            }
        }

        // Step 6: Swap full memtables
        let mut to_flush = Vec::new();
        for cf in targets.values() {
            let full = cf.mem.read().active.should_flush(cf.options.memtable_size_limit);
            if !full {
                continue;
            }
            match self.switch_memtable(&mut ws, cf) {
                Ok(true) => to_flush.push(cf.id),
                Ok(false) => {}
                // The batch is committed; the swap is retried on the next write
                Err(e) => warn!(cf = %cf.name, error = %e, "Memtable swap failed"),
            }
        }
        drop(ws);

        for cf_id in to_flush {
            let _ = self.flush_tx.send(FlushMessage::Flush { cf_id, done: None });
        }
        Ok(())
    }

    /// Families touched by a batch, keyed by id
    fn resolve_targets(&self, ops: &[Operation]) -> Result<BTreeMap<u32, Arc<ColumnFamilyData>>> {
        let families = self.families.read();
        let mut targets = BTreeMap::new();
        for op in ops {
            let id = op.cf_id();
            if targets.contains_key(&id) {
                continue;
            }
            let cf = families.get(&id).ok_or_else(|| {
                CirrusError::InvalidColumnFamily(format!("column family {} is not open", id))
            })?;
            targets.insert(id, Arc::clone(cf));
        }
        Ok(targets)
    }

    /// Block while a family has too many memtables waiting to flush
    fn wait_for_room(&self, cf: &ColumnFamilyData) -> Result<()> {
        let max = self.options.max_immutable_memtables.max(1);
        if cf.immutable_count() < max {
            return Ok(());
        }

        debug!(cf = %cf.name, waiting = cf.immutable_count(), "Write stall");
        let mut guard = self.stall.lock();
        while cf.immutable_count() >= max {
            if cf.is_dropped() {
                return Err(CirrusError::InvalidColumnFamily(format!(
                    "column family '{}' has been dropped",
                    cf.name
                )));
            }
            if let Some(e) = self.bg_error.lock().clone() {
                return Err(CirrusError::Background(e));
            }
            if self.state() != DbState::Open {
                return Err(CirrusError::Closed);
            }
            self.stall_cv.wait_for(&mut guard, STALL_POLL);
        }
        Ok(())
    }

    /// Move the active memtable to the immutable list
    ///
    /// Called with the write lock held. Seals the WAL segment so the new
    /// memtable's records start in a fresh one. Returns false if there was
    /// nothing to swap.
    pub(crate) fn switch_memtable(&self, ws: &mut WriteState, cf: &ColumnFamilyData) -> Result<bool> {
        if cf.mem.read().active.is_empty() {
            return Ok(false);
        }

        self.seal_segment(ws)?;

        let mut mem = cf.mem.write();
        let old = mem::replace(&mut mem.active, Arc::new(MemTable::new()));
        debug!(
            cf = %cf.name,
            bytes = old.size(),
            entries = old.entry_count(),
            max_seq = old.max_seq(),
            "Swapped memtable"
        );
        mem.imm.push(old);
        Ok(true)
    }

    /// Start a new WAL segment if the active one holds anything
    fn seal_segment(&self, ws: &mut WriteState) -> Result<()> {
        if ws.wal.size() == 0 {
            return Ok(());
        }

        ws.wal.sync()?;
        let next = ws.wal_number + 1;
        let writer = WalWriter::open(
            &segment_path(&self.wal_dir, next),
            self.options.wal_sync_strategy,
        )?;
        let sealed = mem::replace(&mut ws.wal, writer);

        self.segments.lock().push(SealedSegment {
            number: ws.wal_number,
            path: sealed.path().to_path_buf(),
            max_seq: ws.last_sequence,
        });
        debug!(sealed = ws.wal_number, active = next, "Rolled WAL segment");
        ws.wal_number = next;
        Ok(())
    }

    pub(crate) fn sync_wal(&self) -> Result<()> {
        self.write_state.lock().wal.sync()
    }
}
