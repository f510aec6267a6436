//! Storage test suite

mod manager_tests;

use cirruskv::memtable::{MemTableEntry, SeqEntry};

pub fn value(seq: u64, v: &str) -> SeqEntry {
    SeqEntry::new(seq, MemTableEntry::Value(v.as_bytes().to_vec()))
}

pub fn tombstone(seq: u64) -> SeqEntry {
    SeqEntry::new(seq, MemTableEntry::Tombstone)
}
