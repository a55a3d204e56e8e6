//! Property tests for the causal clock and the transformation rules.

use chrono::{TimeZone, Utc};
use mapsync::{
    transform, CausalClock, ClockOrdering, Operation, OperationDraft, OperationType,
    ParticipantId, Payload,
};
use proptest::prelude::*;
use serde_json::Value;
use std::collections::BTreeMap;

const PARTICIPANTS: [&str; 4] = ["alice", "bob", "carol", "dave"];
const FIELDS: [&str; 4] = ["text", "x", "y", "color"];

fn arb_clock() -> impl Strategy<Value = CausalClock> {
    prop::collection::btree_map(prop::sample::select(PARTICIPANTS.to_vec()), 1u64..6, 0..4)
        .prop_map(CausalClock::from_entries)
}

fn arb_payload() -> impl Strategy<Value = Payload> {
    prop::collection::btree_map(prop::sample::select(FIELDS.to_vec()), 0i64..100, 0..4).prop_map(
        |fields| {
            fields
                .into_iter()
                .map(|(k, v)| (k.to_string(), Value::from(v)))
                .collect()
        },
    )
}

fn arb_kind() -> impl Strategy<Value = OperationType> {
    prop::sample::select(vec![
        OperationType::Create,
        OperationType::Update,
        OperationType::Delete,
        OperationType::Move,
    ])
}

fn build(
    kind: OperationType,
    target: &str,
    who: &str,
    secs: u32,
    data: Payload,
    clock: CausalClock,
) -> Operation {
    Operation::from_draft(
        OperationDraft::new(kind, "map-1", target, data),
        ParticipantId::new(who),
        clock,
    )
    .with_timestamp(Utc.with_ymd_and_hms(2024, 1, 1, 10, 0, secs).unwrap())
}

/// Apply update payloads in order, later fields overwriting earlier ones.
fn overlay(ops: &[&Operation]) -> BTreeMap<String, Value> {
    let mut state = BTreeMap::new();
    for op in ops {
        if op.operation_type == OperationType::Update {
            for (k, v) in &op.data {
                state.insert(k.clone(), v.clone());
            }
        }
    }
    state
}

// ================== Clock Properties ==================

proptest! {
    #[test]
    fn prop_compare_is_antisymmetric(a in arb_clock(), b in arb_clock()) {
        prop_assert_eq!(a.compare(&b), b.compare(&a).inverse());
    }

    #[test]
    fn prop_compare_with_self_is_equal(a in arb_clock()) {
        prop_assert_eq!(a.compare(&a), ClockOrdering::Equal);
    }

    #[test]
    fn prop_update_with_self_is_idempotent(a in arb_clock()) {
        let mut merged = a.clone();
        merged.update(&a);
        prop_assert_eq!(merged, a);
    }

    #[test]
    fn prop_update_dominates_both(a in arb_clock(), b in arb_clock()) {
        let mut merged = a.clone();
        merged.update(&b);

        prop_assert!(merged.dominates(&a));
        prop_assert!(merged.dominates(&b));
        prop_assert!(matches!(merged.compare(&a), ClockOrdering::After | ClockOrdering::Equal));
        prop_assert!(matches!(merged.compare(&b), ClockOrdering::After | ClockOrdering::Equal));
    }

    #[test]
    fn prop_update_is_commutative(a in arb_clock(), b in arb_clock()) {
        let mut ab = a.clone();
        ab.update(&b);
        let mut ba = b.clone();
        ba.update(&a);
        prop_assert_eq!(ab, ba);
    }

    #[test]
    fn prop_increment_moves_strictly_after(a in arb_clock(), who in prop::sample::select(PARTICIPANTS.to_vec())) {
        let mut next = a.clone();
        next.increment(&ParticipantId::new(who));
        prop_assert_eq!(a.compare(&next), ClockOrdering::Before);
    }
}

// ================== Transform Properties ==================

proptest! {
    #[test]
    fn prop_unrelated_targets_are_untouched(
        kind_a in arb_kind(),
        kind_b in arb_kind(),
        secs_a in 0u32..60,
        secs_b in 0u32..60,
        data_a in arb_payload(),
        data_b in arb_payload(),
    ) {
        let a = build(kind_a, "n1", "alice", secs_a, data_a, CausalClock::from_entries([("alice", 1)]));
        let b = build(kind_b, "n2", "bob", secs_b, data_b, CausalClock::from_entries([("bob", 1)]));

        let (a2, b2) = transform(&a, &b);
        prop_assert_eq!(a2, a);
        prop_assert_eq!(b2, b);
    }

    #[test]
    fn prop_concurrent_updates_converge_in_either_order(
        secs_a in 0u32..60,
        secs_b in 0u32..60,
        data_a in arb_payload(),
        data_b in arb_payload(),
    ) {
        let a = build(OperationType::Update, "n1", "alice", secs_a, data_a, CausalClock::from_entries([("alice", 1)]));
        let b = build(OperationType::Update, "n1", "bob", secs_b, data_b, CausalClock::from_entries([("bob", 1)]));

        let (a2, b2) = transform(&a, &b);
        prop_assert_eq!(overlay(&[&a2, &b2]), overlay(&[&b2, &a2]));

        // Both sides agree regardless of which one runs the transform.
        let (b3, a3) = transform(&b, &a);
        prop_assert_eq!(&a2.data, &a3.data);
        prop_assert_eq!(&b2.data, &b3.data);
    }

    #[test]
    fn prop_delete_beats_update_at_any_time(
        secs_delete in 0u32..60,
        secs_update in 0u32..60,
        data in arb_payload(),
    ) {
        let delete = build(OperationType::Delete, "n1", "alice", secs_delete, Payload::new(), CausalClock::from_entries([("alice", 1)]));
        let update = build(OperationType::Update, "n1", "bob", secs_update, data, CausalClock::from_entries([("bob", 1)]));

        let (update2, delete2) = transform(&update, &delete);
        prop_assert!(update2.is_noop());
        prop_assert_eq!(delete2, delete);
    }

    #[test]
    fn prop_exactly_one_of_two_deletes_survives(secs_a in 0u32..60, secs_b in 0u32..60) {
        let a = build(OperationType::Delete, "n1", "alice", secs_a, Payload::new(), CausalClock::from_entries([("alice", 1)]));
        let b = build(OperationType::Delete, "n1", "bob", secs_b, Payload::new(), CausalClock::from_entries([("bob", 1)]));

        let (a2, b2) = transform(&a, &b);
        prop_assert!(a2.is_noop() != b2.is_noop());
    }
}
