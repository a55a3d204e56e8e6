//! Error types for the sync engine.

use crate::ids::{ConflictId, TargetId};
use thiserror::Error;

/// Result type alias for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors surfaced synchronously to callers of the sync engine.
///
/// Delivery failures are handled inside the operation queue and only reach
/// callers as [`crate::state::SyncEvent`]s; they appear here solely so a
/// transport can report them with the same vocabulary.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SyncError {
    /// The operation is missing an identity, target or clock field.
    #[error("Malformed operation: missing {field}")]
    MalformedOperation { field: &'static str },

    /// No pending conflict is registered under this ID.
    #[error("Unknown conflict: {0}")]
    UnknownConflict(ConflictId),

    /// The addressed node does not exist in the document.
    #[error("Node not found: {0}")]
    NodeNotFound(TargetId),

    /// The operation payload cannot be applied.
    #[error("Invalid payload: {0}")]
    InvalidPayload(String),

    /// Serialization or deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Reading or writing persisted state failed.
    #[error("Storage error: {0}")]
    Storage(String),

    /// Delivery to the remote authority failed.
    #[error("Delivery failed: {0}")]
    Delivery(#[from] DeliveryError),
}

impl SyncError {
    /// Shorthand for a malformed-operation error.
    pub fn malformed(field: &'static str) -> Self {
        SyncError::MalformedOperation { field }
    }
}

impl From<std::io::Error> for SyncError {
    fn from(err: std::io::Error) -> Self {
        SyncError::Storage(err.to_string())
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(err: serde_json::Error) -> Self {
        SyncError::Serialization(err.to_string())
    }
}

/// Failure of a single delivery attempt, as reported by the transport.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DeliveryError {
    /// Network failure or the remote is temporarily unavailable.
    #[error("remote unavailable: {0}")]
    Unavailable(String),

    /// The attempt did not resolve within the delivery timeout.
    #[error("delivery timed out")]
    Timeout,

    /// No session with the remote authority.
    #[error("not connected to remote")]
    NotConnected,

    /// The remote refused the operation.
    #[error("rejected by remote: {0}")]
    Rejected(String),
}

impl DeliveryError {
    /// Returns true if the failure is transient.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, DeliveryError::Rejected(_))
    }
}
