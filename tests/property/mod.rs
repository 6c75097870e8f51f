//! Property-based testing for vaultkeeper
//!
//! Uses proptest to check the revision history invariants across
//! randomly generated dates, paths and directory scans.

use ::vaultkeeper::*;
use chrono::{DateTime, Duration, TimeZone, Utc};
use proptest::prelude::*;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

fn base_date() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
}

fn file_revision(date: DateTime<Utc>, seed: u64) -> FileRevision {
    FileRevision {
        date,
        identifier: RevisionIdentifier::with_handler(format!("guid-{seed}"), "store"),
        original_size: seed,
        stored_size: seed,
    }
}

/// Strictly increasing offsets in seconds from the base date
fn increasing_offsets() -> impl Strategy<Value = Vec<i64>> {
    prop::collection::vec(1i64..10_000, 1..20).prop_map(|gaps| {
        gaps.iter()
            .scan(0i64, |total, gap| {
                *total += gap;
                Some(*total)
            })
            .collect()
    })
}

/// Random absolute file paths, one to four levels deep
fn path_strategy() -> impl Strategy<Value = PathBuf> {
    (prop::collection::vec("[a-z]{1,8}", 0..=3), "[a-z]{1,8}\\.(txt|bin)").prop_map(|(dirs, file)| {
        let mut path = PathBuf::from("/");
        for dir in dirs {
            path.push(dir);
        }
        path.push(file);
        path
    })
}

fn snapshot(tree: &RevisionTree, path: &Path) -> (usize, Vec<Revision>, Option<BTreeSet<String>>) {
    let parent = path.parent().unwrap_or(Path::new("/"));
    (
        tree.node_count(),
        tree.history(path).to_vec(),
        tree.children_as_of(parent, None),
    )
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn prop_find_revision_returns_latest_not_after(
        path in path_strategy(),
        offsets in increasing_offsets(),
        query_offset in -10i64..200_000,
    ) {
        let mut tree = RevisionTree::new();
        for (i, offset) in offsets.iter().enumerate() {
            tree.record_file_revision(&path, file_revision(base_date() + Duration::seconds(*offset), i as u64))
                .unwrap();
        }

        let as_of = base_date() + Duration::seconds(query_offset);
        let expected = offsets.iter().rposition(|o| *o <= query_offset);
        let found = tree.find_revision(&path, Some(as_of));
        match expected {
            None => prop_assert!(found.is_none()),
            Some(index) => {
                let found = found.and_then(Revision::as_file).map(|f| f.original_size);
                prop_assert_eq!(found, Some(index as u64));
            }
        }

        let latest = tree.find_revision(&path, None).map(Revision::date);
        prop_assert_eq!(latest, Some(base_date() + Duration::seconds(*offsets.last().unwrap())));
    }

    #[test]
    fn prop_out_of_order_append_is_rejected_without_change(
        path in path_strategy(),
        offsets in increasing_offsets(),
        back in 0i64..20_000,
    ) {
        let mut tree = RevisionTree::new();
        for (i, offset) in offsets.iter().enumerate() {
            tree.record_file_revision(&path, file_revision(base_date() + Duration::seconds(*offset), i as u64))
                .unwrap();
        }
        let before = snapshot(&tree, &path);

        let last = *offsets.last().unwrap();
        let stale = base_date() + Duration::seconds(last - back);
        let err = tree.record_file_revision(&path, file_revision(stale, 999)).unwrap_err();
        prop_assert_eq!(err.kind(), ErrorKind::HistoryOrderingViolation);
        prop_assert_eq!(snapshot(&tree, &path), before);
        prop_assert!(!tree.identifier_in_use("guid-999"));
    }

    #[test]
    fn prop_membership_tracks_scans(
        names in prop::collection::btree_set("[a-z]{1,6}", 1..12),
        keep_mask in prop::collection::vec(any::<bool>(), 12),
    ) {
        let dir = PathBuf::from("/data");
        let first = base_date();
        let second = first + Duration::hours(1);

        let mut tree = RevisionTree::new();
        for (i, name) in names.iter().enumerate() {
            tree.record_file_revision(&dir.join(name), file_revision(first, i as u64)).unwrap();
        }
        prop_assert_eq!(tree.children_as_of(&dir, None), Some(names.clone()));

        let kept: BTreeSet<String> = names
            .iter()
            .zip(&keep_mask)
            .filter(|(_, keep)| **keep)
            .map(|(name, _)| name.clone())
            .collect();
        let present: Vec<&str> = kept.iter().map(String::as_str).collect();
        let removed = tree.update_directory_membership(&dir, second, &present).unwrap();
        prop_assert_eq!(removed.len(), names.len() - kept.len());

        prop_assert_eq!(tree.children_as_of(&dir, None), Some(kept.clone()));
        prop_assert_eq!(tree.children_as_of(&dir, Some(first)), Some(names.clone()));

        // Scanning again with the same listing changes nothing
        let again = tree.update_directory_membership(&dir, second + Duration::hours(1), &present).unwrap();
        prop_assert!(again.is_empty());
        prop_assert_eq!(tree.children_as_of(&dir, None), Some(kept));
    }
}
