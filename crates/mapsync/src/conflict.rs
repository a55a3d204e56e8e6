//! Conflict detection and resolution against a bounded operation history.
//!
//! The resolver keeps, per document, the most recent resolved operations. An
//! incoming operation is compared with every recorded operation on the same
//! target; those whose clocks are concurrent with it are folded through
//! [`transform`](crate::transform::transform), oldest first. The final form
//! of the incoming operation is recorded and returned with a decision on
//! whether to apply it.
//!
//! # Resolution rules
//!
//! - Causally ordered operations pass through unchanged.
//! - Concurrent operations on the same target are transformed.
//! - Recorded operations may be rewritten by the fold (e.g. demoted to
//!   `noop`); the rewritten copies are returned in
//!   [`Resolution::local_updates`] so the owner of local state can react.
//! - Under [`ConflictPolicy::Manual`] conflicts are parked instead and settled
//!   through [`ConflictResolver::resolve_manually`].

use crate::clock::{CausalClock, ClockOrdering};
use crate::config::ConflictPolicy;
use crate::error::{SyncError, SyncResult};
use crate::ids::{ConflictId, DocumentId, OperationId};
use crate::operation::{Operation, OperationStatus, Payload};
use crate::transform::transform;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};

/// Default number of operations remembered per document.
pub const DEFAULT_HISTORY_LIMIT: usize = 100;

/// True iff the local clock and the incoming clock are concurrent.
pub fn detect_conflict(incoming: &CausalClock, local: &CausalClock) -> bool {
    local.compare(incoming) == ClockOrdering::Concurrent
}

/// Whether two operations address the same entity of the same document.
///
/// Hierarchical relations (ancestor/descendant nodes) are not considered.
pub fn are_operations_related(a: &Operation, b: &Operation) -> bool {
    a.document_id == b.document_id && a.target_id == b.target_id
}

/// Fixed-capacity history of resolved operations, oldest first.
#[derive(Clone, Debug)]
pub struct OperationHistory {
    limit: usize,
    entries: VecDeque<Operation>,
}

impl OperationHistory {
    /// Create an empty history holding at most `limit` operations.
    pub fn new(limit: usize) -> Self {
        Self {
            limit: limit.max(1),
            entries: VecDeque::with_capacity(limit.max(1)),
        }
    }

    /// Append an operation, evicting the oldest on overflow.
    pub fn push(&mut self, op: Operation) {
        if self.entries.len() == self.limit {
            self.entries.pop_front();
        }
        self.entries.push_back(op);
    }

    /// Find a recorded operation by ID.
    pub fn get(&self, id: OperationId) -> Option<&Operation> {
        self.entries.iter().find(|op| op.id == id)
    }

    fn get_mut(&mut self, id: OperationId) -> Option<&mut Operation> {
        self.entries.iter_mut().find(|op| op.id == id)
    }

    fn iter_mut(&mut self) -> impl Iterator<Item = &mut Operation> {
        self.entries.iter_mut()
    }

    /// Check if an operation has been recorded.
    pub fn contains(&self, id: OperationId) -> bool {
        self.get(id).is_some()
    }

    /// Iterate over recorded operations, oldest first.
    pub fn iter(&self) -> impl Iterator<Item = &Operation> {
        self.entries.iter()
    }

    /// Get number of recorded operations.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check if the history is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Maximum number of operations kept.
    pub fn limit(&self) -> usize {
        self.limit
    }
}

/// One fold step of the incoming operation against a recorded one.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TransformationRecord {
    /// The recorded operation the incoming one was transformed against.
    pub against: OperationId,
    /// Incoming operation before this step.
    pub original: Operation,
    /// Incoming operation after this step.
    pub transformed: Operation,
    /// Whether the recorded operation was rewritten by this step.
    pub local_changed: bool,
    pub at: DateTime<Utc>,
}

/// Diagnostics about a resolved (or parked) conflict.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ConflictInfo {
    /// Number of concurrent related operations found.
    pub conflict_count: usize,
    /// Transformation trace, in fold order.
    pub transformations: Vec<TransformationRecord>,
    /// Set when the conflict was parked for manual resolution.
    pub pending: Option<ConflictId>,
}

/// Outcome of resolving one operation.
#[derive(Clone, Debug, PartialEq)]
pub struct Resolution {
    /// Final form of the incoming operation.
    pub resolved_operation: Operation,
    /// False when the operation was superseded or parked.
    pub should_apply: bool,
    /// `None` when no conflict was found.
    pub conflict_info: Option<ConflictInfo>,
    /// Recorded operations rewritten during the fold.
    pub local_updates: Vec<Operation>,
}

/// A conflict waiting for a user decision.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PendingConflict {
    pub id: ConflictId,
    /// Recorded operation the incoming one collided with.
    pub local: Operation,
    /// The incoming operation, untouched.
    pub remote: Operation,
    pub detected_at: DateTime<Utc>,
}

/// Side chosen when settling a conflict by hand.
#[derive(Clone, Debug, PartialEq)]
pub enum ManualChoice {
    AcceptLocal,
    AcceptRemote,
    /// Apply the remote operation with a user-supplied payload.
    MergeCustom(Payload),
}

/// Conflict resolution engine owning the per-document histories.
pub struct ConflictResolver {
    policy: ConflictPolicy,
    history_limit: usize,
    histories: HashMap<DocumentId, OperationHistory>,
    pending: HashMap<ConflictId, PendingConflict>,
}

impl ConflictResolver {
    /// Create a resolver with automatic policy and the default history bound.
    pub fn new() -> Self {
        Self::with_settings(ConflictPolicy::Automatic, DEFAULT_HISTORY_LIMIT)
    }

    /// Create a resolver with an explicit policy and history bound.
    pub fn with_settings(policy: ConflictPolicy, history_limit: usize) -> Self {
        Self {
            policy,
            history_limit,
            histories: HashMap::new(),
            pending: HashMap::new(),
        }
    }

    /// Current policy.
    pub fn policy(&self) -> ConflictPolicy {
        self.policy
    }

    /// Switch policy; already parked conflicts stay parked.
    pub fn set_policy(&mut self, policy: ConflictPolicy) {
        self.policy = policy;
    }

    /// See [`detect_conflict`].
    pub fn detect_conflict(&self, incoming: &CausalClock, local: &CausalClock) -> bool {
        detect_conflict(incoming, local)
    }

    /// Recorded history of a document, if any operation has been seen.
    pub fn history(&self, document_id: &DocumentId) -> Option<&OperationHistory> {
        self.histories.get(document_id)
    }

    /// Conflicts awaiting a manual decision.
    pub fn pending_conflicts(&self) -> impl Iterator<Item = &PendingConflict> {
        self.pending.values()
    }

    /// Look up a parked conflict.
    pub fn pending_conflict(&self, id: ConflictId) -> Option<&PendingConflict> {
        self.pending.get(&id)
    }

    /// Resolve an operation against the history of its document.
    ///
    /// Fails with [`SyncError::MalformedOperation`] when the operation lacks
    /// identity, target, document or clock; nothing is recorded in that case.
    pub fn resolve_conflict(&mut self, incoming: Operation) -> SyncResult<Resolution> {
        incoming.validate()?;

        let limit = self.history_limit;
        let history = self
            .histories
            .entry(incoming.document_id.clone())
            .or_insert_with(|| OperationHistory::new(limit));

        if let Some(existing) = history.get(incoming.id) {
            tracing::debug!(operation_id = %incoming.id, "operation already resolved, skipping");
            return Ok(Resolution {
                resolved_operation: existing.clone(),
                should_apply: false,
                conflict_info: None,
                local_updates: Vec::new(),
            });
        }

        let conflicting: Vec<Operation> = history
            .iter()
            .filter(|recorded| {
                are_operations_related(recorded, &incoming)
                    && detect_conflict(&incoming.causal_clock, &recorded.causal_clock)
            })
            .cloned()
            .collect();

        let Some(oldest) = conflicting.first() else {
            let should_apply = !incoming.is_noop();
            history.push(incoming.clone());
            return Ok(Resolution {
                resolved_operation: incoming,
                should_apply,
                conflict_info: None,
                local_updates: Vec::new(),
            });
        };

        tracing::info!(
            operation_id = %incoming.id,
            document_id = %incoming.document_id,
            target_id = %incoming.target_id,
            conflicts = conflicting.len(),
            "concurrent operations detected"
        );

        if self.policy == ConflictPolicy::Manual {
            let id = self.register_pending(oldest.clone(), incoming.clone());
            return Ok(Resolution {
                resolved_operation: incoming,
                should_apply: false,
                conflict_info: Some(ConflictInfo {
                    conflict_count: conflicting.len(),
                    transformations: Vec::new(),
                    pending: Some(id),
                }),
                local_updates: Vec::new(),
            });
        }

        let mut current = incoming;
        let mut transformations = Vec::with_capacity(conflicting.len());
        let mut local_updates = Vec::new();

        let folded = history
            .iter_mut()
            .filter(|recorded| conflicting.iter().any(|c| c.id == recorded.id));
        for recorded in folded {
            let (local_after, incoming_after) = transform(recorded, &current);
            let local_changed = local_after != *recorded;
            if local_changed {
                *recorded = local_after.clone();
                local_updates.push(local_after);
            }
            transformations.push(TransformationRecord {
                against: recorded.id,
                original: current,
                transformed: incoming_after.clone(),
                local_changed,
                at: Utc::now(),
            });
            current = incoming_after;
        }

        if current.is_noop() {
            current.status = OperationStatus::Noop;
        }
        let should_apply = !current.is_noop();
        history.push(current.clone());

        tracing::info!(
            operation_id = %current.id,
            should_apply,
            local_updates = local_updates.len(),
            "conflict resolved"
        );

        Ok(Resolution {
            resolved_operation: current,
            should_apply,
            conflict_info: Some(ConflictInfo {
                conflict_count: conflicting.len(),
                transformations,
                pending: None,
            }),
            local_updates,
        })
    }

    /// Overwrite the recorded form of an operation.
    ///
    /// Used when a resolved operation turns out not to apply to the document
    /// and is kept as `noop` instead. Returns false if it is not recorded.
    pub fn replace_recorded(&mut self, op: &Operation) -> bool {
        let recorded = self
            .histories
            .get_mut(&op.document_id)
            .and_then(|history| history.get_mut(op.id));
        match recorded {
            Some(recorded) => {
                *recorded = op.clone();
                true
            }
            None => false,
        }
    }

    /// Park an unresolved pair and return its handle.
    pub fn register_pending(&mut self, local: Operation, remote: Operation) -> ConflictId {
        let id = ConflictId::generate();
        tracing::info!(conflict_id = %id, remote = %remote.id, local = %local.id, "conflict parked");
        self.pending.insert(
            id,
            PendingConflict {
                id,
                local,
                remote,
                detected_at: Utc::now(),
            },
        );
        id
    }

    /// Settle a parked conflict, bypassing the transformer.
    ///
    /// The chosen operation is recorded in history and returned for the
    /// caller to apply; the losing side is recorded as `noop`.
    pub fn resolve_manually(
        &mut self,
        conflict_id: ConflictId,
        choice: ManualChoice,
    ) -> SyncResult<Resolution> {
        let pending = self
            .pending
            .remove(&conflict_id)
            .ok_or(SyncError::UnknownConflict(conflict_id))?;
        let PendingConflict { local, remote, .. } = pending;

        let limit = self.history_limit;
        let history = self
            .histories
            .entry(remote.document_id.clone())
            .or_insert_with(|| OperationHistory::new(limit));

        tracing::info!(conflict_id = %conflict_id, choice = ?choice, "resolving conflict manually");

        let mut local_updates = Vec::new();
        let chosen = match choice {
            ManualChoice::AcceptLocal => {
                let mut superseded = remote;
                superseded.make_noop();
                history.push(superseded);
                local
            }
            ManualChoice::AcceptRemote | ManualChoice::MergeCustom(_) => {
                if let Some(recorded) = history.get_mut(local.id) {
                    recorded.make_noop();
                    local_updates.push(recorded.clone());
                }
                let mut chosen = remote;
                if let ManualChoice::MergeCustom(data) = choice {
                    chosen.data = data;
                }
                history.push(chosen.clone());
                chosen
            }
        };

        Ok(Resolution {
            should_apply: !chosen.is_noop(),
            resolved_operation: chosen,
            conflict_info: None,
            local_updates,
        })
    }
}

impl Default for ConflictResolver {
    fn default() -> Self {
        Self::new()
    }
}
