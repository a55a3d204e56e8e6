//! Operation types and wire representation.
//!
//! An [`Operation`] is the unit of synchronized change. Local edits enter as
//! an [`OperationDraft`] and are stamped by the operation queue; remote
//! operations arrive fully formed and are validated before conflict
//! resolution.

use crate::clock::CausalClock;
use crate::error::{SyncError, SyncResult};
use crate::ids::{DocumentId, OperationId, ParticipantId, TargetId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Structured operation payload, e.g. `{"text": ...}` or `{"x": .., "y": ..}`.
pub type Payload = serde_json::Map<String, Value>;

/// Kind of change an operation makes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationType {
    Create,
    Update,
    Delete,
    Move,
    /// Superseded by conflict resolution; recorded but never applied.
    Noop,
}

/// Kind of entity an operation addresses.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetType {
    #[default]
    Node,
    Attachment,
    MindMap,
}

/// Delivery bookkeeping; not part of the causal model.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationStatus {
    #[default]
    Pending,
    Sent,
    Failed,
    Applied,
    Noop,
}

/// A local edit before it has been stamped with identity and causality.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OperationDraft {
    pub operation_type: OperationType,
    pub target_type: TargetType,
    pub target_id: TargetId,
    pub document_id: DocumentId,
    #[serde(default)]
    pub data: Payload,
}

impl OperationDraft {
    /// Create a draft for a node operation.
    pub fn new(
        operation_type: OperationType,
        document_id: impl Into<DocumentId>,
        target_id: impl Into<TargetId>,
        data: Payload,
    ) -> Self {
        Self {
            operation_type,
            target_type: TargetType::Node,
            target_id: target_id.into(),
            document_id: document_id.into(),
            data,
        }
    }

    /// Set the target type.
    pub fn with_target_type(mut self, target_type: TargetType) -> Self {
        self.target_type = target_type;
        self
    }

    /// Check that the draft names a document and a target.
    pub fn validate(&self) -> SyncResult<()> {
        if self.target_id.is_empty() {
            return Err(SyncError::malformed("target_id"));
        }
        if self.document_id.is_empty() {
            return Err(SyncError::malformed("document_id"));
        }
        Ok(())
    }
}

/// The unit of synchronized change.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    #[serde(default)]
    pub id: OperationId,
    pub operation_type: OperationType,
    #[serde(default)]
    pub target_type: TargetType,
    #[serde(default)]
    pub target_id: TargetId,
    #[serde(default)]
    pub document_id: DocumentId,
    #[serde(default)]
    pub data: Payload,
    /// Snapshot of the producer's clock at submission time.
    #[serde(default)]
    pub causal_clock: CausalClock,
    #[serde(default)]
    pub participant_id: ParticipantId,
    /// Wall-clock submission time, used only as a tie-break.
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default)]
    pub status: OperationStatus,
}

impl Operation {
    /// Stamp a draft with a fresh ID, the producer and its clock snapshot.
    pub fn from_draft(
        draft: OperationDraft,
        participant_id: ParticipantId,
        causal_clock: CausalClock,
    ) -> Self {
        Self {
            id: OperationId::generate(),
            operation_type: draft.operation_type,
            target_type: draft.target_type,
            target_id: draft.target_id,
            document_id: draft.document_id,
            data: draft.data,
            causal_clock,
            participant_id,
            timestamp: Utc::now(),
            retry_count: 0,
            status: OperationStatus::Pending,
        }
    }

    /// Override the submission timestamp.
    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Decode an operation from its JSON wire form and validate it.
    pub fn from_json(json: &str) -> SyncResult<Self> {
        let op: Operation = serde_json::from_str(json)?;
        op.validate()?;
        Ok(op)
    }

    /// Encode the operation to its JSON wire form.
    pub fn to_json(&self) -> SyncResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Reject operations lacking identity, target, document or clock.
    pub fn validate(&self) -> SyncResult<()> {
        if self.id.is_nil() {
            return Err(SyncError::malformed("id"));
        }
        if self.target_id.is_empty() {
            return Err(SyncError::malformed("target_id"));
        }
        if self.document_id.is_empty() {
            return Err(SyncError::malformed("document_id"));
        }
        if self.causal_clock.is_empty() {
            return Err(SyncError::malformed("causal_clock"));
        }
        if self.participant_id.is_empty() {
            return Err(SyncError::malformed("participant_id"));
        }
        Ok(())
    }

    /// Check if the operation has been superseded.
    pub fn is_noop(&self) -> bool {
        self.operation_type == OperationType::Noop
    }

    /// Demote the operation so it no longer mutates document state.
    ///
    /// The payload is kept for history and diagnostics.
    pub fn make_noop(&mut self) {
        self.operation_type = OperationType::Noop;
        self.status = OperationStatus::Noop;
    }

    /// Check if this is a delete operation.
    pub fn is_delete(&self) -> bool {
        self.operation_type == OperationType::Delete
    }
}
