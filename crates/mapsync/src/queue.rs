//! Outbound operation queue with retry, backoff and a dead-letter set.
//!
//! Local edits are stamped with a causal clock tick and appended to a FIFO.
//! Processing is strictly head-of-line: a single delivery attempt is in flight
//! at a time, so one participant's operations reach the remote authority in
//! enqueue order. A failed head is retried with backoff; once it exhausts its
//! attempts it moves to the dead-letter set and the queue advances.
//!
//! Going offline abandons the in-flight attempt (or backoff sleep) without
//! touching the queue; the next run resumes from the same head.

use crate::clock::CausalClock;
use crate::config::{RetryConfig, SyncConfig};
use crate::error::{DeliveryError, SyncResult};
use crate::ids::{OperationId, ParticipantId};
use crate::operation::{Operation, OperationDraft, OperationStatus};
use crate::state::{wait_offline, SyncEvent};
use crate::transport::Transport;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};

/// Serializable queue state for persistence.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct QueueSnapshot {
    pub participant_id: ParticipantId,
    pub clock: CausalClock,
    pub pending: Vec<Operation>,
    pub dead_letters: Vec<Operation>,
}

/// Summary of one `process_queue` run.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ProcessOutcome {
    /// Operations acknowledged by the remote, in delivery order.
    pub delivered: Vec<OperationId>,
    /// Operations moved to the dead-letter set.
    pub dead_lettered: Vec<OperationId>,
    /// True if the run stopped early with operations still queued.
    pub interrupted: bool,
}

/// Client-side outbound buffer.
pub struct OperationQueue<T: Transport> {
    participant: ParticipantId,
    clock: CausalClock,
    pending: VecDeque<Operation>,
    dead_letters: Vec<Operation>,
    transport: Arc<T>,
    retry: RetryConfig,
    delivery_timeout: Duration,
    network: watch::Receiver<bool>,
    events: broadcast::Sender<SyncEvent>,
}

impl<T: Transport> OperationQueue<T> {
    /// Create an empty queue for `participant`.
    ///
    /// `network` carries the network-online flag; flipping it to `false`
    /// cancels whatever delivery is in flight.
    pub fn new(
        participant: ParticipantId,
        transport: Arc<T>,
        config: &SyncConfig,
        network: watch::Receiver<bool>,
        events: broadcast::Sender<SyncEvent>,
    ) -> Self {
        Self {
            participant,
            clock: CausalClock::new(),
            pending: VecDeque::new(),
            dead_letters: Vec::new(),
            transport,
            retry: config.delivery.clone(),
            delivery_timeout: config.delivery_timeout(),
            network,
            events,
        }
    }

    /// The participant stamping operations from this queue.
    pub fn participant(&self) -> &ParticipantId {
        &self.participant
    }

    /// This participant's causal clock.
    pub fn clock(&self) -> &CausalClock {
        &self.clock
    }

    /// Fold a clock observed from elsewhere into ours.
    pub fn observe(&mut self, clock: &CausalClock) {
        self.clock.update(clock);
    }

    /// Stamp a draft and append it to the queue.
    ///
    /// Returns the new operation's ID immediately; delivery happens on the
    /// next `process_queue` run.
    pub fn add_operation(&mut self, draft: OperationDraft) -> SyncResult<OperationId> {
        draft.validate()?;

        self.clock.increment(&self.participant);
        let op = Operation::from_draft(draft, self.participant.clone(), self.clock.clone());
        let id = op.id;

        tracing::debug!(
            operation_id = %id,
            document_id = %op.document_id,
            target_id = %op.target_id,
            clock = %op.causal_clock,
            "operation queued"
        );

        self.pending.push_back(op);
        let _ = self.events.send(SyncEvent::OperationQueued { id });
        Ok(id)
    }

    /// Deliver queued operations while the transport stays connected.
    pub async fn process_queue(&mut self) -> ProcessOutcome {
        let mut outcome = ProcessOutcome::default();

        loop {
            if self.pending.is_empty() {
                break;
            }
            if !*self.network.borrow() || !self.transport.is_connected() {
                outcome.interrupted = true;
                break;
            }

            let op = match self.pending.front_mut() {
                Some(head) => {
                    head.status = OperationStatus::Sent;
                    head.clone()
                }
                None => break,
            };

            let attempt = tokio::select! {
                biased;
                _ = wait_offline(&mut self.network) => None,
                result = tokio::time::timeout(self.delivery_timeout, self.transport.send(&op)) => {
                    Some(result.unwrap_or(Err(DeliveryError::Timeout)))
                }
            };

            let Some(attempt) = attempt else {
                tracing::info!(operation_id = %op.id, "went offline, abandoning delivery attempt");
                self.mark_head(OperationStatus::Pending);
                outcome.interrupted = true;
                break;
            };

            match attempt {
                Ok(ack) => {
                    self.clock.update(&ack);
                    if let Some(mut delivered) = self.pending.pop_front() {
                        delivered.status = OperationStatus::Applied;
                    }
                    tracing::debug!(operation_id = %op.id, "operation delivered");
                    outcome.delivered.push(op.id);
                    let _ = self.events.send(SyncEvent::OperationDelivered { id: op.id });
                }
                Err(err) => {
                    if !self.handle_failure(&op, err, &mut outcome).await {
                        outcome.interrupted = true;
                        break;
                    }
                }
            }
        }

        outcome
    }

    /// Count a failed attempt on the head. Returns false if the backoff wait
    /// was cut short by going offline.
    async fn handle_failure(
        &mut self,
        op: &Operation,
        err: DeliveryError,
        outcome: &mut ProcessOutcome,
    ) -> bool {
        let retry_count = match self.pending.front_mut() {
            Some(head) => {
                head.retry_count += 1;
                head.status = OperationStatus::Pending;
                head.retry_count
            }
            None => return true,
        };

        if retry_count >= self.retry.max_attempts {
            if let Some(mut failed) = self.pending.pop_front() {
                failed.status = OperationStatus::Failed;
                tracing::warn!(
                    operation_id = %failed.id,
                    retry_count,
                    error = %err,
                    "delivery retries exhausted, moving to dead letters"
                );
                outcome.dead_lettered.push(failed.id);
                let _ = self.events.send(SyncEvent::OperationDeadLettered {
                    id: failed.id,
                    reason: err.to_string(),
                });
                self.dead_letters.push(failed);
            }
            return true;
        }

        let delay = self.retry.delay_for_attempt(retry_count);
        tracing::warn!(
            operation_id = %op.id,
            retry_count,
            delay_ms = delay.as_millis() as u64,
            error = %err,
            "delivery failed, backing off"
        );

        tokio::select! {
            biased;
            _ = wait_offline(&mut self.network) => false,
            _ = tokio::time::sleep(delay) => true,
        }
    }

    fn mark_head(&mut self, status: OperationStatus) {
        if let Some(head) = self.pending.front_mut() {
            head.status = status;
        }
    }

    /// Find a queued operation by ID.
    pub fn get(&self, id: OperationId) -> Option<&Operation> {
        self.pending.iter().find(|op| op.id == id)
    }

    /// Overwrite a still-undelivered operation with its resolved form.
    ///
    /// Conflict resolution may demote a local operation to `noop` or merge a
    /// rival's fields into it after it was queued; the outbound copy must carry
    /// that outcome. Dead letters are rewritten too so a later requeue sends the
    /// resolved form. Returns false if the operation is no longer held here.
    pub fn replace_pending(&mut self, resolved: &Operation) -> bool {
        let Some(queued) = self
            .pending
            .iter_mut()
            .chain(self.dead_letters.iter_mut())
            .find(|op| op.id == resolved.id)
        else {
            return false;
        };

        queued.operation_type = resolved.operation_type;
        queued.data = resolved.data.clone();
        if resolved.is_noop() {
            queued.status = OperationStatus::Noop;
        }
        tracing::debug!(
            operation_id = %resolved.id,
            operation_type = ?resolved.operation_type,
            "queued operation rewritten by conflict resolution"
        );
        true
    }

    /// Queued operations, head first.
    pub fn pending(&self) -> impl Iterator<Item = &Operation> {
        self.pending.iter()
    }

    /// Get number of queued operations.
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// Check if nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Operations that exhausted their delivery attempts.
    pub fn dead_letters(&self) -> &[Operation] {
        &self.dead_letters
    }

    /// Whether any change failed to sync.
    pub fn has_unsynced_changes(&self) -> bool {
        !self.dead_letters.is_empty()
    }

    /// Move dead letters back to the tail of the queue with a fresh budget.
    ///
    /// Returns the number of operations requeued.
    pub fn requeue_dead_letters(&mut self) -> usize {
        let count = self.dead_letters.len();
        for mut op in self.dead_letters.drain(..) {
            op.retry_count = 0;
            op.status = OperationStatus::Pending;
            self.pending.push_back(op);
        }
        if count > 0 {
            tracing::info!(count, "dead letters requeued");
        }
        count
    }

    /// Capture queue state for persistence.
    pub fn snapshot(&self) -> QueueSnapshot {
        QueueSnapshot {
            participant_id: self.participant.clone(),
            clock: self.clock.clone(),
            pending: self.pending.iter().cloned().collect(),
            dead_letters: self.dead_letters.clone(),
        }
    }

    /// Replace queue state with a previously captured snapshot.
    pub fn restore(&mut self, snapshot: QueueSnapshot) {
        self.participant = snapshot.participant_id;
        self.clock = snapshot.clock;
        self.pending = snapshot.pending.into();
        self.dead_letters = snapshot.dead_letters;
    }

    /// Drop all queue state, keeping the participant.
    pub fn reset(&mut self) {
        self.clock = CausalClock::new();
        self.pending.clear();
        self.dead_letters.clear();
    }
}
