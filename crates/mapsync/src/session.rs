//! Per-document sync session.
//!
//! A [`SyncSession`] ties together the conflict resolver, the connectivity
//! state manager (which owns the outbound queue) and the mind-map document.
//! Sessions are constructed explicitly; there is no process-wide instance.
//!
//! Every replica must reach the same tree from the same set of operations, so
//! a resolved remote operation that cannot be applied here is recorded as
//! `noop` rather than surfaced as an error. Concurrent moves that would
//! together form a cycle are settled by timestamp: the later move stands and
//! the node moved by the earlier one becomes a root.

use crate::config::SyncConfig;
use crate::conflict::{
    detect_conflict, ConflictResolver, ManualChoice, PendingConflict, Resolution,
};
use crate::document::MindMap;
use crate::error::{SyncError, SyncResult};
use crate::ids::{ConflictId, DocumentId, OperationId, ParticipantId, TargetId};
use crate::operation::{Operation, OperationDraft, OperationType};
use crate::state::{SyncEvent, SyncStateManager, SyncStatus};
use crate::transform::{latest_wins, Winner};
use crate::transport::Transport;
use serde_json::Value;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::time::MissedTickBehavior;

/// Handle for stopping a running session loop.
#[derive(Clone)]
pub struct ShutdownHandle {
    tx: broadcast::Sender<()>,
}

impl ShutdownHandle {
    /// Signal the session loop to stop.
    pub fn shutdown(&self) {
        let _ = self.tx.send(());
    }
}

/// Sync session for a single document.
pub struct SyncSession<T: Transport> {
    document_id: DocumentId,
    config: SyncConfig,
    resolver: ConflictResolver,
    state: SyncStateManager<T>,
    document: MindMap,
    shutdown_tx: broadcast::Sender<()>,
}

impl<T: Transport> SyncSession<T> {
    /// Create a session for `document_id` editing as `participant`.
    pub fn new(
        document_id: impl Into<DocumentId>,
        participant: impl Into<ParticipantId>,
        transport: Arc<T>,
        network: watch::Receiver<bool>,
        config: SyncConfig,
    ) -> Self {
        let document_id = document_id.into();
        let resolver = ConflictResolver::with_settings(config.conflict_policy, config.history_limit);
        let state = SyncStateManager::new(participant.into(), transport, &config, network);
        let (shutdown_tx, _) = broadcast::channel(1);

        Self {
            document: MindMap::new(document_id.clone()),
            document_id,
            config,
            resolver,
            state,
            shutdown_tx,
        }
    }

    pub fn document_id(&self) -> &DocumentId {
        &self.document_id
    }

    pub fn participant(&self) -> &ParticipantId {
        self.state.queue().participant()
    }

    /// The document as seen locally.
    pub fn document(&self) -> &MindMap {
        &self.document
    }

    pub fn resolver(&self) -> &ConflictResolver {
        &self.resolver
    }

    pub fn state(&self) -> &SyncStateManager<T> {
        &self.state
    }

    pub fn status(&self) -> SyncStatus {
        self.state.status()
    }

    /// Subscribe to status changes and sync events.
    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.state.subscribe()
    }

    /// Get a shutdown handle for [`SyncSession::run`].
    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            tx: self.shutdown_tx.clone(),
        }
    }

    /// Submit a local edit.
    ///
    /// The operation is stamped and queued, applied to the local document
    /// right away and recorded for conflict detection. Delivery starts
    /// immediately when connected. Edits that cannot apply to the current
    /// tree are rejected before anything is queued.
    pub async fn add_operation(&mut self, draft: OperationDraft) -> SyncResult<OperationId> {
        if draft.document_id != self.document_id {
            return Err(self.wrong_document(&draft.document_id));
        }
        self.document.check(&draft)?;

        let id = self.state.add_operation(draft)?;
        if let Some(op) = self.state.queue().get(id).cloned() {
            let resolution = self.resolver.resolve_conflict(op)?;
            if resolution.should_apply {
                if let Err(err) = self.document.apply(&resolution.resolved_operation) {
                    tracing::warn!(operation_id = %id, error = %err, "local operation did not apply");
                }
            }
        }

        if self.state.status().is_connected {
            self.state.process_queue().await;
        }
        Ok(id)
    }

    /// Handle an operation pushed by the remote authority.
    ///
    /// Malformed operations and badly typed payloads are rejected before
    /// anything is recorded. Local operations rewritten by the resolution
    /// are updated in the outbound queue so they go out in resolved form.
    pub fn receive_remote(&mut self, op: Operation) -> SyncResult<Resolution> {
        op.validate()?;
        if op.document_id != self.document_id {
            return Err(self.wrong_document(&op.document_id));
        }
        self.document.check_payload(&op)?;

        let clock = op.causal_clock.clone();
        let mut resolution = self.resolver.resolve_conflict(op)?;
        self.state.queue_mut().observe(&clock);
        self.rewrite_queued(&resolution.local_updates);

        if resolution.should_apply {
            self.apply_resolved(&mut resolution);
        }
        self.publish_resolution(&resolution);
        Ok(resolution)
    }

    /// Conflicts parked under the manual policy.
    pub fn pending_conflicts(&self) -> Vec<&PendingConflict> {
        self.resolver.pending_conflicts().collect()
    }

    /// Settle a parked conflict and apply the chosen side.
    pub fn resolve_manually(
        &mut self,
        conflict_id: ConflictId,
        choice: ManualChoice,
    ) -> SyncResult<Resolution> {
        if let ManualChoice::MergeCustom(data) = &choice {
            if let Some(pending) = self.resolver.pending_conflict(conflict_id) {
                let mut merged = pending.remote.clone();
                merged.data = data.clone();
                self.document.check_payload(&merged)?;
            }
        }

        let mut resolution = self.resolver.resolve_manually(conflict_id, choice)?;
        self.rewrite_queued(&resolution.local_updates);
        if resolution.should_apply {
            self.apply_resolved(&mut resolution);
        }

        self.state.publish(SyncEvent::ConflictResolved {
            operation_id: resolution.resolved_operation.id,
            conflict_count: 1,
            applied: resolution.should_apply,
        });
        Ok(resolution)
    }

    /// Operations that exhausted their delivery attempts.
    pub fn dead_letters(&self) -> &[Operation] {
        self.state.queue().dead_letters()
    }

    pub fn has_unsynced_changes(&self) -> bool {
        self.state.queue().has_unsynced_changes()
    }

    /// Give dead letters another round of delivery attempts.
    pub async fn requeue_dead_letters(&mut self) -> usize {
        let count = self.state.queue_mut().requeue_dead_letters();
        if count > 0 {
            self.state.retry_now().await;
        }
        count
    }

    /// Apply the current network flag; `run` does this on every change.
    pub async fn on_network_change(&mut self) {
        self.state.on_network_change().await;
    }

    /// Manual retry of the connection and queue.
    pub async fn retry_now(&mut self) -> bool {
        self.state.retry_now().await
    }

    /// Serialize the outbound queue for persistence.
    pub fn snapshot_json(&self) -> SyncResult<String> {
        self.state.snapshot_json()
    }

    /// Restore the outbound queue from persisted JSON.
    pub fn restore_snapshot(&mut self, json: &str) -> bool {
        self.state.restore_snapshot(json)
    }

    pub fn save_snapshot(&self, path: impl AsRef<Path>) -> SyncResult<()> {
        self.state.save_snapshot(path)
    }

    pub fn load_snapshot(&mut self, path: impl AsRef<Path>) -> SyncResult<bool> {
        self.state.load_snapshot(path)
    }

    /// Drive the session until shutdown.
    ///
    /// Reacts to network transitions, applies operations pushed through
    /// `incoming`, and drains the queue every `process_interval`.
    pub async fn run(&mut self, mut incoming: mpsc::UnboundedReceiver<Operation>) {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let mut interval = tokio::time::interval(self.config.process_interval());
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        interval.tick().await;

        tracing::info!(document_id = %self.document_id, "sync session started");
        self.state.start().await;

        let mut network_open = true;
        let mut incoming_open = true;

        loop {
            tokio::select! {
                changed = self.state.network_changed(), if network_open => {
                    if changed {
                        self.state.on_network_change().await;
                    } else {
                        tracing::debug!("network signal closed");
                        network_open = false;
                    }
                }
                op = incoming.recv(), if incoming_open => match op {
                    Some(op) => {
                        let operation_id = op.id;
                        if let Err(err) = self.receive_remote(op) {
                            tracing::warn!(%operation_id, error = %err, "remote operation rejected");
                        }
                    }
                    None => {
                        tracing::debug!("incoming channel closed");
                        incoming_open = false;
                    }
                },
                _ = interval.tick() => {
                    self.state.tick().await;
                }
                _ = shutdown_rx.recv() => {
                    tracing::info!(document_id = %self.document_id, "sync session received shutdown signal");
                    break;
                }
            }
        }
    }

    fn rewrite_queued(&mut self, rewritten: &[Operation]) {
        let queue = self.state.queue_mut();
        for op in rewritten {
            queue.replace_pending(op);
        }
    }

    /// Apply a resolved operation, demoting it to `noop` if it cannot apply.
    fn apply_resolved(&mut self, resolution: &mut Resolution) {
        if resolution.resolved_operation.operation_type == OperationType::Move {
            self.settle_move_cycle(resolution);
            if !resolution.should_apply {
                return;
            }
        }

        if let Err(err) = self.document.apply(&resolution.resolved_operation) {
            tracing::warn!(
                operation_id = %resolution.resolved_operation.id,
                error = %err,
                "resolved operation does not apply, recording as noop"
            );
            self.demote(resolution);
        }
    }

    fn settle_move_cycle(&mut self, resolution: &mut Resolution) {
        let op = &resolution.resolved_operation;
        let Some(parent) = op.data.get("parent_id").and_then(Value::as_str) else {
            return;
        };
        let Some(path) = self.document.ancestor_path(&TargetId::new(parent), &op.target_id) else {
            return;
        };

        let rivals: Vec<&Operation> = self
            .resolver
            .history(&self.document_id)
            .into_iter()
            .flat_map(|history| history.iter())
            .filter(|recorded| {
                recorded.id != op.id
                    && recorded.operation_type == OperationType::Move
                    && path.contains(&recorded.target_id)
                    && detect_conflict(&op.causal_clock, &recorded.causal_clock)
            })
            .collect();

        let prevails = !rivals.is_empty()
            && rivals
                .iter()
                .all(|rival| latest_wins(op, rival) == Winner::First);
        let detached: Vec<TargetId> = if prevails {
            rivals.iter().map(|rival| rival.target_id.clone()).collect()
        } else if rivals.is_empty() {
            Vec::new()
        } else {
            vec![op.target_id.clone()]
        };

        tracing::info!(
            operation_id = %op.id,
            prevails,
            detached = detached.len(),
            "concurrent moves would form a cycle"
        );
        for id in &detached {
            self.document.detach(id);
        }
        if !prevails {
            self.demote(resolution);
        }
    }

    fn demote(&mut self, resolution: &mut Resolution) {
        resolution.resolved_operation.make_noop();
        resolution.should_apply = false;
        self.resolver.replace_recorded(&resolution.resolved_operation);
    }

    fn publish_resolution(&self, resolution: &Resolution) {
        let Some(info) = &resolution.conflict_info else {
            return;
        };
        let operation_id = resolution.resolved_operation.id;
        let event = match info.pending {
            Some(conflict_id) => SyncEvent::ConflictPending {
                conflict_id,
                operation_id,
            },
            None => SyncEvent::ConflictResolved {
                operation_id,
                conflict_count: info.conflict_count,
                applied: resolution.should_apply,
            },
        };
        self.state.publish(event);
    }

    fn wrong_document(&self, document_id: &DocumentId) -> SyncError {
        SyncError::InvalidPayload(format!(
            "operation for document {document_id} submitted to session for {}",
            self.document_id
        ))
    }
}
