//! Integration tests for clocks, conflicts, and authority under
//! multi-writer interleavings.

use proptest::prelude::*;
use serde_json::json;
use stowage_concurrency::{
    detect_conflict, ClockOrdering, ClockState, ConflictWinner, VectorClock,
};

/// Simulate a writer session: observe a base state, then tick `n` times.
fn writer_session(writer_id: &str, base: &ClockState, ticks: u32) -> ClockState {
    let mut clock = VectorClock::from_state(base.clone(), writer_id);
    let mut state = clock.state().clone();
    for _ in 0..ticks {
        state = clock.tick();
    }
    state
}

#[test]
fn test_sequential_handoff_is_totally_ordered() {
    // Writer A works, B observes A's final state and continues, then A
    // observes B. Every state in the chain is ordered, never concurrent.
    let start = ClockState::new();
    let after_a = writer_session("a", &start, 3);
    let after_b = writer_session("b", &after_a, 2);
    let after_a_again = writer_session("a", &after_b, 1);

    assert_eq!(start.compare(&after_a), ClockOrdering::Before);
    assert_eq!(after_a.compare(&after_b), ClockOrdering::Before);
    assert_eq!(after_b.compare(&after_a_again), ClockOrdering::Before);
    assert_eq!(after_a_again.compare(&after_a), ClockOrdering::After);
}

#[test]
fn test_three_way_divergence_all_concurrent() {
    let mut root = VectorClock::new("root");
    let base = root.tick();

    let state_a = writer_session("a", &base, 1);
    let state_b = writer_session("b", &base, 2);
    let state_c = writer_session("c", &base, 3);

    for (left, right) in [
        (&state_a, &state_b),
        (&state_a, &state_c),
        (&state_b, &state_c),
    ] {
        assert_eq!(left.compare(right), ClockOrdering::Concurrent);
    }
}

#[test]
fn test_reconciliation_chain_converges() {
    // Two divergent writers reconcile: the loser observes the winner's
    // epoch, and its next write dominates both branches.
    let mut root = VectorClock::new("a");
    let base = root.tick();

    let state_a = writer_session("a", &base, 1);
    let state_b = writer_session("b", &base, 1);
    assert_eq!(state_a.compare(&state_b), ClockOrdering::Concurrent);

    let mut b = VectorClock::from_state(state_b.clone(), "b");
    b.observe(&state_a);
    let merged = b.tick();
    assert_eq!(state_a.compare(&merged), ClockOrdering::Before);
    assert_eq!(state_b.compare(&merged), ClockOrdering::Before);
}

#[test]
fn test_conflict_resolution_is_symmetric_under_swap() {
    // Whoever is "existing", the same record wins the concurrent tiebreak.
    let record_a = json!({"k": "x", "writeEpoch": {"a": 1}, "writerId": "a"});
    let record_b = json!({"k": "x", "writeEpoch": {"b": 1}, "writerId": "b"});

    let a_holds = detect_conflict(Some(&record_a), &record_b);
    let b_holds = detect_conflict(Some(&record_b), &record_a);

    assert!(a_holds.has_conflict && b_holds.has_conflict);
    // "a" < "b": record_a wins from either side.
    assert_eq!(a_holds.winner, ConflictWinner::Existing);
    assert_eq!(b_holds.winner, ConflictWinner::Incoming);
}

proptest! {
    // Interleave two writers with random tick counts and random
    // observation points; compare() must agree with the actual causal
    // history: states are ordered iff one observed everything in the
    // other.
    #[test]
    fn prop_compare_agrees_with_causal_history(
        a_ticks in 1u32..4,
        b_ticks in 1u32..4,
        b_observes_a in proptest::bool::ANY,
    ) {
        let mut a = VectorClock::new("a");
        let mut state_a = a.state().clone();
        for _ in 0..a_ticks {
            state_a = a.tick();
        }

        let mut b = VectorClock::new("b");
        if b_observes_a {
            b.observe(&state_a);
        }
        let mut state_b = b.state().clone();
        for _ in 0..b_ticks {
            state_b = b.tick();
        }

        if b_observes_a {
            prop_assert_eq!(state_a.compare(&state_b), ClockOrdering::Before);
        } else {
            prop_assert_eq!(state_a.compare(&state_b), ClockOrdering::Concurrent);
        }
    }

    // The concurrent tiebreak never leaves a conflict unresolved and is
    // deterministic across repeated evaluation.
    #[test]
    fn prop_tiebreak_deterministic(
        writer_a in "[a-d]{1,3}",
        writer_b in "[a-d]{1,3}",
    ) {
        prop_assume!(writer_a != writer_b);
        let stamped = |writer: &str| {
            let mut epoch = serde_json::Map::new();
            epoch.insert(writer.to_string(), json!(1));
            json!({"writeEpoch": epoch, "writerId": writer})
        };
        let record_a = stamped(&writer_a);
        let record_b = stamped(&writer_b);

        let first = detect_conflict(Some(&record_a), &record_b);
        let second = detect_conflict(Some(&record_a), &record_b);
        prop_assert_eq!(first.winner, second.winner);
        prop_assert!(first.is_concurrent);
    }
}
