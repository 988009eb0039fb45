use std::collections::BTreeSet;

use proptest::prelude::*;
use tempfile::tempdir;

use reporting_engine::{Store, Window};

proptest! {
    #[test]
    fn pt_window_contains_matches_half_open_semantics(
        start in 0_i64..10_000,
        end in 0_i64..10_000,
        ts in 1_i64..10_000,
    ) {
        let window = Window::new(start, end);
        let expected = (start == 0 || ts >= start) && (end == 0 || ts < end);
        prop_assert_eq!(window.contains(ts), expected);
    }

    #[test]
    fn pt_unbounded_window_contains_everything(ts in 1_i64..i64::MAX) {
        prop_assert!(Window::unbounded().contains(ts));
    }

    #[test]
    fn pt_past_end_is_never_true_inside_the_window(
        start in 0_i64..10_000,
        end in 0_i64..10_000,
        ts in 1_i64..10_000,
    ) {
        let window = Window::new(start, end);
        if window.contains(ts) {
            prop_assert!(!window.past_end(ts));
        }
    }
}

proptest! {
    // Store-backed cases are capped: each one opens a fresh sled db.
    #![proptest_config(ProptestConfig::with_cases(16))]

    #[test]
    fn pt_snapshot_window_scan_matches_filter(
        timestamps in proptest::collection::btree_set(1_i64..5_000, 0..40),
        start in 0_i64..5_000,
        end in 0_i64..5_000,
    ) {
        let dir = tempdir().unwrap();
        let store = Store::open(dir.path().join("db").to_str().unwrap()).unwrap();

        for &ts in &timestamps {
            store.get_or_create_snapshot("hnas", ts, None).unwrap();
        }

        let window = Window::new(start, end);
        let scanned: Vec<i64> = store
            .snapshots_in_window("hnas", window)
            .unwrap()
            .iter()
            .map(|record| record.ts)
            .collect();

        let expected: Vec<i64> = timestamps
            .iter()
            .copied()
            .filter(|&ts| window.contains(ts))
            .collect();

        prop_assert_eq!(scanned, expected);

        let distinct: BTreeSet<i64> = store
            .snapshots_in_window("hnas", Window::unbounded())
            .unwrap()
            .iter()
            .map(|record| record.ts)
            .collect();
        prop_assert_eq!(distinct, timestamps);
    }
}
