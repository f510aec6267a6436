//! Tests for manifest state and the version set
//!
//! These tests verify:
//! - Edit validation (duplicates, unknown families, default family)
//! - Table ordering within a family
//! - Persistence across reopen and after rewrite
//! - Snapshot encoding used for the cloud manifest

use std::fs;

use cirruskv::manifest::{ManifestState, VersionEdit, VersionSet};
use cirruskv::CirrusError;
use tempfile::TempDir;

use super::file;

#[test]
fn test_initial_state_has_default_family() {
    let state = ManifestState::initial();

    let default = state.cf(0).unwrap();
    assert_eq!(default.name, "default");
    assert_eq!(state.next_column_family_id, 1);
    assert!(state.live_file_numbers().is_empty());
}

#[test]
fn test_create_and_drop_family() {
    let mut state = ManifestState::initial();
    state
        .apply(&VersionEdit::CreateColumnFamily {
            id: 1,
            name: "users".to_string(),
        })
        .unwrap();

    assert_eq!(state.cf_by_name("users").unwrap().id, 1);
    assert_eq!(state.next_column_family_id, 2);

    state.apply(&VersionEdit::DropColumnFamily { id: 1 }).unwrap();
    assert!(state.cf_by_name("users").is_none());
    // Ids are never reused
    assert_eq!(state.next_column_family_id, 2);
}

#[test]
fn test_invalid_edits_rejected() {
    let mut state = ManifestState::initial();

    let duplicate = VersionEdit::CreateColumnFamily {
        id: 5,
        name: "default".to_string(),
    };
    assert!(matches!(state.apply(&duplicate), Err(CirrusError::InvalidArgument(_))));

    let drop_default = VersionEdit::DropColumnFamily { id: 0 };
    assert!(matches!(state.apply(&drop_default), Err(CirrusError::InvalidArgument(_))));

    let unknown = VersionEdit::AddFile {
        cf_id: 9,
        file: file(1, 1, "a", "b"),
    };
    assert!(matches!(state.apply(&unknown), Err(CirrusError::InvalidColumnFamily(_))));

    let missing = VersionEdit::DeleteFile { cf_id: 0, number: 3 };
    assert!(state.apply(&missing).is_err());
}

#[test]
fn test_files_ordered_newest_first() {
    let mut state = ManifestState::initial();
    for (number, max_seq) in [(1, 10), (3, 30), (2, 20)] {
        state
            .apply(&VersionEdit::AddFile {
                cf_id: 0,
                file: file(number, max_seq, "a", "z"),
            })
            .unwrap();
    }

    let numbers: Vec<u64> = state.cf(0).unwrap().files.iter().map(|f| f.number).collect();
    assert_eq!(numbers, vec![3, 2, 1]);
    assert_eq!(state.next_file_number, 4);
}

#[test]
fn test_snapshot_round_trip() {
    let mut state = ManifestState::initial();
    state
        .apply(&VersionEdit::CreateColumnFamily {
            id: 1,
            name: "logs".to_string(),
        })
        .unwrap();
    state
        .apply(&VersionEdit::AddFile {
            cf_id: 1,
            file: file(4, 12, "k1", "k9"),
        })
        .unwrap();
    state
        .apply(&VersionEdit::SetFlushedSequence { cf_id: 1, sequence: 12 })
        .unwrap();
    state.apply(&VersionEdit::SetLastSequence(15)).unwrap();

    let decoded = ManifestState::decode(&state.encode_snapshot().unwrap()).unwrap();

    assert_eq!(decoded, state);
    assert_eq!(decoded.min_flushed_seq(), 0);
}

#[test]
fn test_version_set_persists_across_reopen() {
    let temp = TempDir::new().unwrap();
    {
        let mut versions = VersionSet::create(temp.path(), 1000).unwrap();
        versions
            .log_and_apply(vec![
                VersionEdit::CreateColumnFamily {
                    id: 1,
                    name: "events".to_string(),
                },
                VersionEdit::SetNextColumnFamilyId(2),
            ])
            .unwrap();
        versions
            .log_and_apply(vec![VersionEdit::AddFile {
                cf_id: 1,
                file: file(1, 5, "a", "b"),
            }])
            .unwrap();
    }

    let versions = VersionSet::open(temp.path(), 1000).unwrap();
    let events = versions.state().cf_by_name("events").unwrap();
    assert_eq!(events.files.len(), 1);
    assert_eq!(versions.state().next_file_number, 2);
}

#[test]
fn test_rejected_group_changes_nothing() {
    let temp = TempDir::new().unwrap();
    let mut versions = VersionSet::create(temp.path(), 1000).unwrap();
    let size_before = fs::metadata(VersionSet::manifest_path(temp.path())).unwrap().len();

    let result = versions.log_and_apply(vec![
        VersionEdit::SetLastSequence(99),
        VersionEdit::DropColumnFamily { id: 7 },
    ]);

    assert!(result.is_err());
    assert_eq!(versions.state().last_sequence, 0);
    assert_eq!(
        fs::metadata(VersionSet::manifest_path(temp.path())).unwrap().len(),
        size_before
    );
}

#[test]
fn test_rewrite_after_threshold() {
    let temp = TempDir::new().unwrap();
    let path = VersionSet::manifest_path(temp.path());
    let mut versions = VersionSet::create(temp.path(), 5).unwrap();

    for seq in 1..=4 {
        versions.log_and_apply(vec![VersionEdit::SetLastSequence(seq)]).unwrap();
    }
    let grown = fs::metadata(&path).unwrap().len();

    versions.log_and_apply(vec![VersionEdit::SetLastSequence(5)]).unwrap();
    let rewritten = fs::metadata(&path).unwrap().len();

    assert!(rewritten < grown);
    let reloaded = VersionSet::load(temp.path()).unwrap();
    assert_eq!(reloaded.last_sequence, 5);
}

#[test]
fn test_new_file_number_is_monotonic() {
    let temp = TempDir::new().unwrap();
    let mut versions = VersionSet::create(temp.path(), 1000).unwrap();

    let a = versions.new_file_number();
    let b = versions.new_file_number();
    assert!(b > a);
}
