//! Connectivity state machine and event publication.
//!
//! [`SyncStateManager`] tracks three independent axes: network reachability,
//! an established session with the remote authority, and whether the queue is
//! draining. It owns the [`OperationQueue`] and drives it from network
//! transitions, manual retries and periodic ticks.
//!
//! Every observable change is published on a broadcast channel. Subscribers
//! never need to acknowledge, and a lagging subscriber only loses events.

use crate::config::{RetryConfig, SyncConfig};
use crate::error::SyncResult;
use crate::ids::{ConflictId, OperationId, ParticipantId};
use crate::operation::OperationDraft;
use crate::queue::{OperationQueue, ProcessOutcome, QueueSnapshot};
use crate::transport::Transport;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::{broadcast, watch};

const EVENT_CAPACITY: usize = 256;

/// Snapshot of sync state for display.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncStatus {
    /// The network is reachable.
    pub is_online: bool,
    /// A session with the remote authority is established.
    pub is_connected: bool,
    /// The queue is actively draining.
    pub is_syncing: bool,
    /// Operations waiting for delivery.
    pub pending_operations: usize,
    /// Operations that exhausted their delivery attempts.
    pub dead_letters: usize,
    /// When the last operation was acknowledged.
    pub last_synced_at: Option<DateTime<Utc>>,
}

impl SyncStatus {
    /// Drives the "changes not synced" indicator.
    pub fn has_unsynced_changes(&self) -> bool {
        self.dead_letters > 0
    }

    /// Get a short status string
    pub fn short_status(&self) -> &'static str {
        match (self.is_online, self.is_connected, self.is_syncing) {
            (false, _, _) => "Offline",
            (true, false, _) => "Connecting",
            (true, true, true) => "Syncing",
            (true, true, false) => "Online",
        }
    }
}

/// Notifications published by a sync session.
#[derive(Clone, Debug, PartialEq)]
pub enum SyncEvent {
    StatusChanged(SyncStatus),
    OperationQueued {
        id: OperationId,
    },
    OperationDelivered {
        id: OperationId,
    },
    OperationDeadLettered {
        id: OperationId,
        reason: String,
    },
    /// Every reconnect attempt failed; the session stays disconnected until
    /// the network flips again or a manual retry.
    ReconnectFailed {
        attempts: u32,
    },
    ConflictResolved {
        operation_id: OperationId,
        conflict_count: usize,
        applied: bool,
    },
    ConflictPending {
        conflict_id: ConflictId,
        operation_id: OperationId,
    },
    /// Persisted state was unusable and has been repaired or reset.
    StateRecovered {
        reason: String,
    },
}

/// Connectivity state machine owning the outbound queue.
pub struct SyncStateManager<T: Transport> {
    status: SyncStatus,
    queue: OperationQueue<T>,
    transport: Arc<T>,
    reconnect: RetryConfig,
    network: watch::Receiver<bool>,
    events: broadcast::Sender<SyncEvent>,
}

impl<T: Transport> SyncStateManager<T> {
    /// Create a manager for `participant`, reading connectivity from `network`.
    pub fn new(
        participant: ParticipantId,
        transport: Arc<T>,
        config: &SyncConfig,
        network: watch::Receiver<bool>,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let queue = OperationQueue::new(
            participant,
            transport.clone(),
            config,
            network.clone(),
            events.clone(),
        );
        let is_online = *network.borrow();
        let status = SyncStatus {
            is_online,
            is_connected: is_online && transport.is_connected(),
            ..SyncStatus::default()
        };

        Self {
            status,
            queue,
            transport,
            reconnect: config.reconnect.clone(),
            network,
            events,
        }
    }

    /// Current status.
    pub fn status(&self) -> SyncStatus {
        self.status
    }

    /// Subscribe to state changes and sync events.
    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }

    /// Publish an event to subscribers.
    pub fn publish(&self, event: SyncEvent) {
        let _ = self.events.send(event);
    }

    pub fn queue(&self) -> &OperationQueue<T> {
        &self.queue
    }

    pub fn queue_mut(&mut self) -> &mut OperationQueue<T> {
        &mut self.queue
    }

    /// Enqueue a local draft. Delivery is left to the caller.
    pub fn add_operation(&mut self, draft: OperationDraft) -> SyncResult<OperationId> {
        let id = self.queue.add_operation(draft)?;
        self.update_status(|_| {});
        Ok(id)
    }

    /// Connect if the network is already up when the session starts.
    pub async fn start(&mut self) {
        let online = *self.network.borrow_and_update();
        if online && !self.status.is_connected {
            self.update_status(|s| s.is_online = true);
            self.reconnect().await;
        }
    }

    /// Wait for the network flag to change.
    ///
    /// Returns false once the flag's sender is gone.
    pub async fn network_changed(&mut self) -> bool {
        self.network.changed().await.is_ok()
    }

    /// Apply the current network flag to the state machine.
    pub async fn on_network_change(&mut self) {
        let online = *self.network.borrow_and_update();
        match (self.status.is_online, online) {
            (false, true) => {
                tracing::info!("network online");
                self.update_status(|s| s.is_online = true);
                self.reconnect().await;
            }
            (true, false) => self.go_offline(),
            _ => {}
        }
    }

    /// Manual retry: reconnect if needed, then drain the queue.
    ///
    /// Returns true if the session ends up connected.
    pub async fn retry_now(&mut self) -> bool {
        if !self.is_network_online() {
            return false;
        }
        if self.status.is_connected {
            self.process_queue().await;
            return self.status.is_connected;
        }
        self.reconnect().await
    }

    /// Periodic processing: drain the queue if there is anything to send.
    pub async fn tick(&mut self) -> Option<ProcessOutcome> {
        if !self.status.is_connected || self.queue.is_empty() {
            return None;
        }
        Some(self.process_queue().await)
    }

    /// Drain the queue while connected.
    pub async fn process_queue(&mut self) -> ProcessOutcome {
        if !self.status.is_connected {
            return ProcessOutcome {
                interrupted: !self.queue.is_empty(),
                ..ProcessOutcome::default()
            };
        }

        self.update_status(|s| s.is_syncing = true);
        let outcome = self.queue.process_queue().await;

        let connected = self.transport.is_connected();
        self.update_status(|s| {
            s.is_syncing = false;
            s.is_connected = connected;
            if !outcome.delivered.is_empty() {
                s.last_synced_at = Some(Utc::now());
            }
        });
        if !self.is_network_online() {
            self.go_offline();
        }
        outcome
    }

    async fn reconnect(&mut self) -> bool {
        let max_attempts = self.reconnect.max_attempts.max(1);

        for attempt in 0..max_attempts {
            if attempt > 0 {
                let delay = self.reconnect.delay_for_attempt(attempt);
                tracing::debug!(attempt, delay_ms = delay.as_millis() as u64, "reconnect backoff");
                let online = tokio::select! {
                    biased;
                    _ = wait_offline(&mut self.network) => false,
                    _ = tokio::time::sleep(delay) => true,
                };
                if !online {
                    self.go_offline();
                    return false;
                }
            }

            tracing::info!(attempt = attempt + 1, "connecting to remote");
            let result = tokio::select! {
                biased;
                _ = wait_offline(&mut self.network) => None,
                result = self.transport.connect() => Some(result),
            };

            match result {
                None => {
                    self.go_offline();
                    return false;
                }
                Some(Ok(())) => {
                    tracing::info!(attempt = attempt + 1, "connected");
                    self.update_status(|s| s.is_connected = true);
                    self.process_queue().await;
                    return self.status.is_connected;
                }
                Some(Err(err)) => {
                    tracing::warn!(attempt = attempt + 1, error = %err, "connect failed");
                }
            }
        }

        tracing::warn!(attempts = max_attempts, "reconnect attempts exhausted");
        self.publish(SyncEvent::ReconnectFailed {
            attempts: max_attempts,
        });
        false
    }

    fn go_offline(&mut self) {
        tracing::info!(pending = self.queue.len(), "network offline");
        self.transport.disconnect();
        self.update_status(|s| {
            s.is_online = false;
            s.is_connected = false;
            s.is_syncing = false;
        });
    }

    fn is_network_online(&self) -> bool {
        *self.network.borrow()
    }

    fn update_status(&mut self, change: impl FnOnce(&mut SyncStatus)) {
        let before = self.status;
        change(&mut self.status);
        self.status.pending_operations = self.queue.len();
        self.status.dead_letters = self.queue.dead_letters().len();
        if self.status != before {
            self.publish(SyncEvent::StatusChanged(self.status));
        }
    }

    /// Serialize the queue for persistence.
    pub fn snapshot_json(&self) -> SyncResult<String> {
        Ok(serde_json::to_string(&self.queue.snapshot())?)
    }

    /// Restore the queue from persisted JSON.
    ///
    /// Unusable input never propagates: an unreadable snapshot resets the
    /// queue, and a clock that lags its own queued operations is merged
    /// forward. Returns true when a repair was needed.
    pub fn restore_snapshot(&mut self, json: &str) -> bool {
        let reason = match serde_json::from_str::<QueueSnapshot>(json) {
            Err(err) => {
                self.queue.reset();
                Some(format!("unreadable queue snapshot: {err}"))
            }
            Ok(snapshot) if &snapshot.participant_id != self.queue.participant() => {
                self.queue.reset();
                Some(format!(
                    "queue snapshot belongs to {}",
                    snapshot.participant_id
                ))
            }
            Ok(snapshot) => {
                let (snapshot, reason) = repair_snapshot(snapshot);
                self.queue.restore(snapshot);
                reason
            }
        };

        self.update_status(|_| {});
        match reason {
            Some(reason) => {
                tracing::warn!(%reason, "sync state recovered");
                self.publish(SyncEvent::StateRecovered { reason });
                true
            }
            None => false,
        }
    }
}

impl<T: Transport> SyncStateManager<T> {
    /// Write the queue snapshot to `path`.
    pub fn save_snapshot(&self, path: impl AsRef<Path>) -> SyncResult<()> {
        let json = serde_json::to_string_pretty(&self.queue.snapshot())?;
        std::fs::write(path, json)?;
        Ok(())
    }

    /// Restore the queue from a snapshot file written by `save_snapshot`.
    ///
    /// A missing file leaves the queue untouched. Returns true when the
    /// stored state needed repair.
    pub fn load_snapshot(&mut self, path: impl AsRef<Path>) -> SyncResult<bool> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(false);
        }
        let json = std::fs::read_to_string(path)?;
        Ok(self.restore_snapshot(&json))
    }
}

/// Drop invalid operations and merge any clock the snapshot lags behind.
fn repair_snapshot(mut snapshot: QueueSnapshot) -> (QueueSnapshot, Option<String>) {
    let before = snapshot.pending.len() + snapshot.dead_letters.len();
    snapshot.pending.retain(|op| op.validate().is_ok());
    snapshot.dead_letters.retain(|op| op.validate().is_ok());
    let dropped = before - snapshot.pending.len() - snapshot.dead_letters.len();

    let mut merged = false;
    for op in snapshot.pending.iter().chain(&snapshot.dead_letters) {
        if !snapshot.clock.dominates(&op.causal_clock) {
            merged = true;
        }
    }
    if merged {
        let clocks: Vec<_> = snapshot
            .pending
            .iter()
            .chain(&snapshot.dead_letters)
            .map(|op| op.causal_clock.clone())
            .collect();
        for clock in &clocks {
            snapshot.clock.update(clock);
        }
    }

    let reason = match (dropped, merged) {
        (0, false) => None,
        (0, true) => Some("queue clock behind queued operations".to_string()),
        (n, false) => Some(format!("dropped {n} invalid queued operations")),
        (n, true) => Some(format!(
            "dropped {n} invalid queued operations, queue clock behind queued operations"
        )),
    };
    (snapshot, reason)
}

/// Resolve once the network flag reads `false`.
///
/// Never resolves if the flag's sender is gone.
pub(crate) async fn wait_offline(network: &mut watch::Receiver<bool>) {
    loop {
        let online = *network.borrow_and_update();
        if !online {
            return;
        }
        if network.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}
