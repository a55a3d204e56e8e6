//! Causal clock for ordering operations across participants.
//!
//! A [`CausalClock`] is a vector clock: each entry maps a participant to the
//! number of operations that participant has produced or that this replica
//! has observed from it. Two clocks are compared as a partial order; when
//! neither dominates the other the events they stamp are concurrent.
//!
//! A participant only ever increments its own entry. Clocks received over the
//! wire are folded in with [`CausalClock::update`] (pointwise maximum) and are
//! never assigned destructively.

use crate::ids::ParticipantId;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Result of comparing two causal clocks.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClockOrdering {
    /// Every entry is <= the other's and at least one is strictly less.
    Before,
    /// Every entry is >= the other's and at least one is strictly greater.
    After,
    /// All entries match.
    Equal,
    /// Neither clock dominates the other.
    Concurrent,
}

impl ClockOrdering {
    /// The ordering seen from the other side of the comparison.
    pub fn inverse(self) -> Self {
        match self {
            ClockOrdering::Before => ClockOrdering::After,
            ClockOrdering::After => ClockOrdering::Before,
            other => other,
        }
    }
}

/// Per-document vector clock keyed by participant.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CausalClock {
    entries: BTreeMap<ParticipantId, u64>,
}

impl CausalClock {
    /// Create a new empty clock.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a clock from `(participant, counter)` pairs.
    pub fn from_entries<I, P>(entries: I) -> Self
    where
        I: IntoIterator<Item = (P, u64)>,
        P: Into<ParticipantId>,
    {
        Self {
            entries: entries.into_iter().map(|(p, v)| (p.into(), v)).collect(),
        }
    }

    /// Get the counter for a participant (0 if never seen).
    pub fn get(&self, participant: &ParticipantId) -> u64 {
        self.entries.get(participant).copied().unwrap_or(0)
    }

    /// Advance the participant's own counter by one.
    pub fn increment(&mut self, participant: &ParticipantId) -> &mut Self {
        *self.entries.entry(participant.clone()).or_insert(0) += 1;
        self
    }

    /// Merge another clock into this one, taking the pointwise maximum.
    pub fn update(&mut self, other: &CausalClock) -> &mut Self {
        for (participant, &value) in &other.entries {
            let entry = self.entries.entry(participant.clone()).or_insert(0);
            if value > *entry {
                *entry = value;
            }
        }
        self
    }

    /// Compare this clock with another across the union of their participants.
    pub fn compare(&self, other: &CausalClock) -> ClockOrdering {
        let mut less = false;
        let mut greater = false;

        let participants = self.entries.keys().chain(other.entries.keys());
        for participant in participants {
            let mine = self.get(participant);
            let theirs = other.get(participant);
            if mine < theirs {
                less = true;
            } else if mine > theirs {
                greater = true;
            }
            if less && greater {
                return ClockOrdering::Concurrent;
            }
        }

        match (less, greater) {
            (false, false) => ClockOrdering::Equal,
            (true, false) => ClockOrdering::Before,
            (false, true) => ClockOrdering::After,
            (true, true) => ClockOrdering::Concurrent,
        }
    }

    /// Whether the two clocks stamp concurrent events.
    pub fn is_concurrent_with(&self, other: &CausalClock) -> bool {
        self.compare(other) == ClockOrdering::Concurrent
    }

    /// Whether this clock has seen everything `other` has.
    pub fn dominates(&self, other: &CausalClock) -> bool {
        other
            .entries
            .iter()
            .all(|(participant, &counter)| self.get(participant) >= counter)
    }

    /// Sum of all counters; a Lamport-style scalar derived from the clock.
    pub fn total(&self) -> u64 {
        self.entries.values().sum()
    }

    /// Check if the clock contains any entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Returns the number of participants tracked by this clock.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns an iterator over all (participant, counter) pairs.
    pub fn iter(&self) -> impl Iterator<Item = (&ParticipantId, u64)> + '_ {
        self.entries.iter().map(|(k, &v)| (k, v))
    }
}

impl fmt::Display for CausalClock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("{")?;
        for (i, (participant, value)) in self.entries.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            write!(f, "{}:{}", participant, value)?;
        }
        f.write_str("}")
    }
}
