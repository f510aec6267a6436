//! WAL test suite

mod entry_tests;
mod reader_tests;
mod recovery_tests;
mod writer_tests;

use cirruskv::batch::Operation;
use cirruskv::wal::WalEntry;

/// A put into the default family
pub fn put(key: &str, value: &str) -> Operation {
    Operation::Put {
        cf_id: 0,
        key: key.as_bytes().to_vec(),
        value: value.as_bytes().to_vec(),
    }
}

/// An entry holding one put per key, starting at `lsn`
pub fn batch_entry(lsn: u64, keys: &[&str]) -> WalEntry {
    WalEntry::new(lsn, keys.iter().map(|k| put(k, "v")).collect())
}
