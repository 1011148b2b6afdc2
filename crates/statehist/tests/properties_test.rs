//! Property tests for the history invariants.
//!
//! Uses proptest to build state systems from arbitrary change streams and
//! checks them against the interval contract: no gaps, no overlaps, and
//! full-state queries agreeing with point queries.

use proptest::prelude::*;
use statehist::query::{counter_at, histogram_query, query_history_range};
use statehist::{
    BackendKind, CancellationToken, HistoryBuilder, HistoryTreeConfig, PassthroughDecoder,
    StateChange, StateSystem, StateValue, Timestamp,
};
use std::sync::Arc;
use tempfile::TempDir;

/// (attribute index, time delta, value) triples with non-decreasing times.
fn change_strategy() -> impl Strategy<Value = Vec<(usize, i64, i32)>> {
    prop::collection::vec((0usize..5, 0i64..20, 0i32..4), 1..300)
}

fn to_changes(raw: &[(usize, i64, i32)]) -> Vec<StateChange> {
    let mut t: Timestamp = 0;
    raw.iter()
        .map(|&(attr, delta, value)| {
            t += delta;
            let name = format!("attr{}", attr);
            let value = if value == 0 {
                StateValue::Null
            } else {
                StateValue::Int(value)
            };
            StateChange::set(&["group", name.as_str()], t, value)
        })
        .collect()
}

fn build(backend: &BackendKind, changes: Vec<StateChange>) -> Arc<StateSystem> {
    let (ss, writer) = StateSystem::new("prop", 0, backend).unwrap();
    HistoryBuilder::new(PassthroughDecoder, writer, CancellationToken::new())
        .run(changes)
        .unwrap();
    ss
}

fn tree_backend(dir: &TempDir) -> BackendKind {
    BackendKind::HistoryTree {
        path: dir.path().join("prop.ht"),
        config: HistoryTreeConfig::default()
            .with_block_size(256)
            .with_max_children(3),
    }
}

fn check_contiguous(ss: &StateSystem) -> Result<(), TestCaseError> {
    let (start, end) = (ss.start_time(), ss.current_end_time());
    for quark in 0..ss.num_attributes() as i32 {
        let intervals = query_history_range(ss, quark, start, end).unwrap();
        prop_assert_eq!(intervals.first().map(|i| i.start()), Some(start));
        prop_assert_eq!(intervals.last().map(|i| i.end()), Some(end));
        for pair in intervals.windows(2) {
            prop_assert_eq!(pair[0].end() + 1, pair[1].start());
        }
    }
    Ok(())
}

fn check_full_matches_single(ss: &StateSystem) -> Result<(), TestCaseError> {
    let end = ss.current_end_time();
    let step = (end / 25).max(1);
    let mut t = ss.start_time();
    while t <= end {
        let full = ss.query_full_state(t).unwrap();
        prop_assert_eq!(full.len(), ss.num_attributes());
        for (quark, interval) in full.iter().enumerate() {
            prop_assert_eq!(interval, &ss.query_single_state(t, quark as i32).unwrap());
        }
        t += step;
    }
    Ok(())
}

proptest! {
    /// Every attribute is covered by exactly one interval at every instant.
    #[test]
    fn test_no_gaps_no_overlaps_in_memory(raw in change_strategy()) {
        let ss = build(&BackendKind::InMemory, to_changes(&raw));
        check_contiguous(&ss)?;
    }

    /// A full-state snapshot equals the point query of every attribute.
    #[test]
    fn test_full_state_matches_single_state(raw in change_strategy()) {
        let ss = build(&BackendKind::InMemory, to_changes(&raw));
        check_full_matches_single(&ss)?;
    }

    /// Bucket deltas add up to the counter growth over the whole range.
    #[test]
    fn test_histogram_sum(
        increments in prop::collection::vec(1i64..50, 1..200),
        (start_offset, span, nb) in (0i64..500, 0i64..5000, 1usize..16),
    ) {
        let mut t = 0;
        let changes: Vec<StateChange> = increments
            .iter()
            .map(|&delta| {
                t += delta;
                StateChange::increment(&["events"], t)
            })
            .collect();
        let ss = build(&BackendKind::InMemory, changes);
        let quark = ss.get_quark_absolute(&["events"]).unwrap();

        let start = ss.start_time() + start_offset;
        let end = start + span;
        let buckets = histogram_query(&ss, quark, start, end, nb, &CancellationToken::new()).unwrap();
        prop_assert_eq!(buckets.len(), nb);
        prop_assert!(buckets.iter().all(|&delta| delta >= 0));
        let expected = counter_at(&ss, quark, end).unwrap() - counter_at(&ss, quark, start).unwrap();
        prop_assert_eq!(buckets.iter().sum::<i64>(), expected);
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    /// The on-disk tree answers exactly like the in-memory store, before and
    /// after being reopened.
    #[test]
    fn test_history_tree_matches_memory(raw in change_strategy()) {
        let dir = TempDir::new().unwrap();
        let changes = to_changes(&raw);
        let memory = build(&BackendKind::InMemory, changes.clone());
        let tree = build(&tree_backend(&dir), changes);
        check_contiguous(&tree)?;
        check_full_matches_single(&tree)?;

        let reopened = StateSystem::open("prop", dir.path().join("prop.ht"), 0).unwrap();
        let end = memory.current_end_time();
        prop_assert_eq!(reopened.current_end_time(), end);
        for t in (0..=end).step_by(((end / 20).max(1)) as usize) {
            let expected = memory.query_full_state(t).unwrap();
            prop_assert_eq!(&tree.query_full_state(t).unwrap(), &expected);
            prop_assert_eq!(&reopened.query_full_state(t).unwrap(), &expected);
        }
    }
}
