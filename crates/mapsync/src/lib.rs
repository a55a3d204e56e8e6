//! Offline-tolerant synchronization for collaborative mind maps.
//!
//! Each participant stamps local edits with a causal clock and queues them for
//! delivery. Remote edits are checked against a bounded per-document history;
//! concurrent edits to the same target are reconciled by operational
//! transformation with field-level last-writer-wins.
//!
//! # Modules
//!
//! - `clock`: Causal (vector) clock and its partial order
//! - `operation`: Operation types, validation and JSON wire form
//! - `transform`: Pairwise transformation of concurrent operations
//! - `conflict`: Conflict detection, per-document history and resolution
//! - `queue`: Head-of-line outbound queue with retry and dead letters
//! - `state`: Connectivity state machine and sync events
//! - `transport`: Transport abstraction and an in-memory implementation
//! - `ws`: WebSocket transport (feature `ws`)
//! - `document`: Mind-map tree that resolved operations are applied to
//! - `session`: Per-document composition of the above
//! - `config`: Session configuration
//! - `error`: Error types
//!
//! # Example
//!
//! ```
//! use mapsync::clock::{CausalClock, ClockOrdering};
//! use mapsync::ids::ParticipantId;
//!
//! let alice = ParticipantId::new("alice");
//! let bob = ParticipantId::new("bob");
//!
//! let mut a = CausalClock::new();
//! a.increment(&alice);
//! let mut b = CausalClock::new();
//! b.increment(&bob);
//!
//! assert_eq!(a.compare(&b), ClockOrdering::Concurrent);
//!
//! b.update(&a).increment(&bob);
//! assert_eq!(a.compare(&b), ClockOrdering::Before);
//! ```

pub mod clock;
pub mod config;
pub mod conflict;
pub mod document;
pub mod error;
pub mod ids;
pub mod operation;
pub mod queue;
pub mod session;
pub mod state;
pub mod transform;
pub mod transport;

/// WebSocket transport.
///
/// This module is only available when the `ws` feature is enabled.
///
/// # Example
///
/// ```ignore
/// use mapsync::ws::WsTransport;
/// use mapsync::{SyncConfig, SyncSession, Transport};
/// use std::sync::Arc;
///
/// #[tokio::main]
/// async fn main() {
///     let transport = Arc::new(WsTransport::new("ws://localhost:8080/sync").with_token("secret"));
///     let incoming = transport.subscribe_incoming();
///     let (_network, network_rx) = tokio::sync::watch::channel(true);
///     let mut session = SyncSession::new("map-1", "alice", transport, network_rx, SyncConfig::default());
///     session.run(incoming).await;
/// }
/// ```
#[cfg(feature = "ws")]
pub mod ws;

// Re-export commonly used types
pub use clock::{CausalClock, ClockOrdering};
pub use config::{ConflictPolicy, RetryConfig, SyncConfig};
pub use conflict::{
    are_operations_related, detect_conflict, ConflictInfo, ConflictResolver, ManualChoice,
    OperationHistory, PendingConflict, Resolution,
};
pub use document::{MindMap, MindMapNode, NodeIndex};
pub use error::{DeliveryError, SyncError, SyncResult};
pub use ids::{ConflictId, DocumentId, OperationId, ParticipantId, TargetId};
pub use operation::{
    Operation, OperationDraft, OperationStatus, OperationType, Payload, TargetType,
};
pub use queue::{OperationQueue, ProcessOutcome, QueueSnapshot};
pub use session::{ShutdownHandle, SyncSession};
pub use state::{SyncEvent, SyncStateManager, SyncStatus};
pub use transform::transform;
pub use transport::{MemoryTransport, Transport};
