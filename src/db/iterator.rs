//! Ordered cursor over one column family

use std::sync::atomic::Ordering;
use std::sync::Arc;

use crate::config::ReadOptions;
use crate::error::{CirrusError, Result};
use crate::memtable::MemTable;
use crate::storage::{EntrySource, MergingIterator, SSTableIterator, StorageManager, TableHandle};

use super::{ColumnFamilyData, DbInner};

/// Cursor over a consistent snapshot of a column family
///
/// Holds its own references to the memtables and tables it reads, so it
/// stays usable while writes, flushes and compactions go on. Deleted keys
/// are never yielded.
///
/// ```text
/// seek_to_first() / seek(key)
///        │
///        ▼
///  valid() ──► key() / value() ──► next() ──┐
///     ▲                                     │
///     └─────────────────────────────────────┘
/// ```
pub struct DbIterator {
    snapshot: u64,
    upper_bound: Option<Vec<u8>>,
    memtables: Vec<Arc<MemTable>>,
    tables: Vec<Arc<TableHandle>>,
    storage: Arc<StorageManager>,
    merger: Option<MergingIterator>,
    current: Option<(Vec<u8>, Vec<u8>)>,
    status: Option<CirrusError>,
}

impl DbInner {
    pub(crate) fn iterator(&self, opts: &ReadOptions, cf: &ColumnFamilyData) -> Result<DbIterator> {
        let snapshot = self.visible_seq.load(Ordering::Acquire);
        let view = cf.read_view();

        Ok(DbIterator {
            snapshot,
            upper_bound: opts.iterate_upper_bound.clone(),
            memtables: view.memtables,
            tables: view.tables,
            storage: Arc::clone(&self.storage),
            merger: None,
            current: None,
            status: None,
        })
    }
}

impl DbIterator {
    /// Position at the first key
    pub fn seek_to_first(&mut self) {
        self.position(None);
    }

    /// Position at the first key at or after `key`
    pub fn seek(&mut self, key: impl AsRef<[u8]>) {
        self.position(Some(key.as_ref()));
    }

    /// True while positioned on an entry
    pub fn valid(&self) -> bool {
        self.current.is_some()
    }

    pub fn key(&self) -> Option<&[u8]> {
        self.current.as_ref().map(|(k, _)| k.as_slice())
    }

    pub fn value(&self) -> Option<&[u8]> {
        self.current.as_ref().map(|(_, v)| v.as_slice())
    }

    /// Advance to the next key
    #[allow(clippy::should_implement_trait)]
    pub fn next(&mut self) {
        self.advance();
    }

    /// The error that ended iteration early, if any
    pub fn status(&self) -> Result<()> {
        match &self.status {
            None => Ok(()),
            Some(e) => Err(replicate(e)),
        }
    }

    /// Drain the remaining entries from the current position
    pub fn collect_remaining(&mut self) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let mut out = Vec::new();
        while let Some((key, value)) = self.current.take() {
            out.push((key, value));
            self.advance();
        }
        self.status()?;
        Ok(out)
    }

    fn position(&mut self, start: Option<&[u8]>) {
        self.current = None;
        self.status = None;
        self.merger = None;

        match self.build_merger(start) {
            Ok(merger) => {
                self.merger = Some(merger);
                self.advance();
            }
            Err(e) => self.status = Some(e),
        }
    }

    fn build_merger(&self, start: Option<&[u8]>) -> Result<MergingIterator> {
        let mut sources: Vec<EntrySource> = Vec::with_capacity(self.memtables.len() + self.tables.len());

        for memtable in &self.memtables {
            let entries = memtable.snapshot(self.snapshot, start);
            sources.push(Box::new(entries.into_iter().map(Ok::<_, CirrusError>)));
        }

        for table in &self.tables {
            let reader = table.reader(&self.storage)?;
            let iter = match start {
                Some(key) => SSTableIterator::seek(reader, key),
                None => SSTableIterator::new(reader),
            };
            sources.push(Box::new(iter));
        }

        MergingIterator::new(sources)
    }

    fn advance(&mut self) {
        self.current = None;
        let Some(merger) = self.merger.as_mut() else {
            return;
        };

        loop {
            match merger.next() {
                None => break,
                Some(Err(e)) => {
                    self.status = Some(e);
                    break;
                }
                Some(Ok((key, found))) => {
                    if let Some(bound) = &self.upper_bound {
                        if key.as_slice() >= bound.as_slice() {
                            break;
                        }
                    }
                    if let Some(value) = found.entry.value() {
                        self.current = Some((key, value.to_vec()));
                        return;
                    }
                    // Tombstone: keep going
                }
            }
        }
        self.merger = None;
    }
}

/// Copy of an iteration error that keeps its class
fn replicate(e: &CirrusError) -> CirrusError {
    match e {
        CirrusError::TableCorruption(m) => CirrusError::TableCorruption(m.clone()),
        CirrusError::CloudTransport(m) => CirrusError::CloudTransport(m.clone()),
        CirrusError::ObjectNotFound(m) => CirrusError::ObjectNotFound(m.clone()),
        CirrusError::Io(io) => CirrusError::Io(std::io::Error::new(io.kind(), io.to_string())),
        other => CirrusError::Storage(other.to_string()),
    }
}
