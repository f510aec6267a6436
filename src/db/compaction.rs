//! Full compaction of one column family
//!
//! All of the family's tables are merged into a single table. The newest
//! version of each key survives; tombstones are dropped, since every
//! memtable of the family is newer than every table.

use std::collections::BTreeSet;
use std::sync::Arc;

use tracing::debug;

use crate::error::Result;
use crate::manifest::VersionEdit;
use crate::storage::{EntrySource, MergingIterator, SSTableIterator, TableHandle};

use super::{ColumnFamilyData, DbInner};

impl DbInner {
    /// Merge every table of `cf` into one (runs on the flush worker)
    pub(crate) fn compact(&self, cf: &ColumnFamilyData) -> Result<()> {
        if cf.is_dropped() {
            return Ok(());
        }
        let inputs: Vec<Arc<TableHandle>> = cf.tables.read().clone();
        if inputs.is_empty() {
            return Ok(());
        }

        // Newest first, matching the merge's tie-break
        let mut sources: Vec<EntrySource> = Vec::with_capacity(inputs.len());
        for table in &inputs {
            let reader = table.reader(&self.storage)?;
            sources.push(Box::new(SSTableIterator::new(reader)));
        }
        let merged = MergingIterator::new(sources)?.filter(|item| match item {
            Ok((_, entry)) => !entry.entry.is_tombstone(),
            Err(_) => true,
        });

        let number = self.versions.lock().new_file_number();
        let built = self.storage.build_table(number, merged)?;

        let mut edits: Vec<VersionEdit> = inputs
            .iter()
            .map(|t| VersionEdit::DeleteFile {
                cf_id: cf.id,
                number: t.number(),
            })
            .collect();
        if let Some((meta, _)) = &built {
            edits.push(VersionEdit::AddFile {
                cf_id: cf.id,
                file: meta.clone(),
            });
        }
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

        let replaced: BTreeSet<u64> = inputs.iter().map(|t| t.number()).collect();
        let output_entries = built.as_ref().map_or(0, |(meta, _)| meta.entry_count);
        {
            let mut tables = cf.tables.write();
            tables.retain(|t| !replaced.contains(&t.number()));
            if let Some((meta, reader)) = built {
                tables.push(Arc::new(TableHandle::with_reader(meta, reader)));
            }
        }

        self.retire_tables(&inputs, job);
        debug!(
            cf = %cf.name,
            inputs = inputs.len(),
            output = number,
            entries = output_entries,
            "Compacted column family"
        );
        Ok(())
    }
}
