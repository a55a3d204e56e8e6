//! Operational transformation of concurrent operations.
//!
//! [`transform`] takes two concurrent operations and rewrites them so that
//! applying both, in either order, converges to the same state. The policy is
//! last-writer-wins at field granularity:
//!
//! | pair            | rule                                                      |
//! |-----------------|-----------------------------------------------------------|
//! | update / update | later timestamp wins every contested field                |
//! | update / delete | delete wins, update becomes `noop`                        |
//! | delete / delete | earlier timestamp wins, the other becomes `noop`          |
//! | move / move     | later timestamp wins, the other becomes `noop`            |
//! | anything else   | identity                                                  |
//!
//! Timestamp ties go to the lexicographically smaller participant.
//! Operations on different targets are never touched.
//!
//! The functions here are pure: no I/O, no shared state, safe to re-run.

use crate::operation::{Operation, OperationType};
use std::cmp::Ordering;

/// Which side of a pair prevailed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Winner {
    First,
    Second,
}

/// Transform two concurrent operations against each other.
///
/// Returns `(a', b')`. When the operations address different targets both are
/// returned unchanged.
pub fn transform(a: &Operation, b: &Operation) -> (Operation, Operation) {
    let mut a = a.clone();
    let mut b = b.clone();

    if a.target_id != b.target_id || a.id == b.id {
        return (a, b);
    }

    match (a.operation_type, b.operation_type) {
        (OperationType::Update, OperationType::Update) => {
            merge_updates(&mut a, &mut b);
        }
        (OperationType::Update, OperationType::Delete) => {
            a.make_noop();
        }
        (OperationType::Delete, OperationType::Update) => {
            b.make_noop();
        }
        (OperationType::Delete, OperationType::Delete) => match earliest_wins(&a, &b) {
            Winner::First => b.make_noop(),
            Winner::Second => a.make_noop(),
        },
        (OperationType::Move, OperationType::Move) => match latest_wins(&a, &b) {
            Winner::First => b.make_noop(),
            Winner::Second => a.make_noop(),
        },
        // Update and move touch content and position respectively; every
        // other pairing is left alone.
        _ => {}
    }

    (a, b)
}

/// Last-writer-wins: later timestamp, then smaller participant.
pub fn latest_wins(a: &Operation, b: &Operation) -> Winner {
    match a.timestamp.cmp(&b.timestamp) {
        Ordering::Greater => Winner::First,
        Ordering::Less => Winner::Second,
        Ordering::Equal => participant_tie_break(a, b),
    }
}

/// First-writer-wins: earlier timestamp, then smaller participant.
pub fn earliest_wins(a: &Operation, b: &Operation) -> Winner {
    match a.timestamp.cmp(&b.timestamp) {
        Ordering::Less => Winner::First,
        Ordering::Greater => Winner::Second,
        Ordering::Equal => participant_tie_break(a, b),
    }
}

fn participant_tie_break(a: &Operation, b: &Operation) -> Winner {
    if a.participant_id <= b.participant_id {
        Winner::First
    } else {
        Winner::Second
    }
}

/// Overwrite the loser's contested fields with the winner's values.
///
/// Fields present in only one payload are left where they are.
fn merge_updates(a: &mut Operation, b: &mut Operation) {
    let (winner, loser) = match latest_wins(a, b) {
        Winner::First => (&*a, &mut *b),
        Winner::Second => (&*b, &mut *a),
    };

    for (key, value) in &winner.data {
        if let Some(slot) = loser.data.get_mut(key) {
            *slot = value.clone();
        }
    }
}
