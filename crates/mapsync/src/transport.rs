//! Transport abstraction for delivering operations to the remote authority.

use crate::clock::CausalClock;
use crate::error::DeliveryError;
use crate::ids::OperationId;
use crate::operation::Operation;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::mpsc;

/// A transport carries operations to and from the remote authority.
///
/// Implementations attach whatever credential the session needs; the sync
/// engine never inspects it. Delivery order of pushed operations is the
/// transport's responsibility.
#[trait_variant::make(Send)]
pub trait Transport: Send + Sync {
    /// Establish a logical session with the remote authority.
    async fn connect(&self) -> Result<(), DeliveryError>;

    /// Submit one operation; on success returns the authority's merged clock.
    async fn send(&self, operation: &Operation) -> Result<CausalClock, DeliveryError>;

    /// Whether a session is currently established.
    fn is_connected(&self) -> bool;

    /// Drop the session.
    fn disconnect(&self);

    /// Register for remotely-originated operations.
    fn subscribe_incoming(&self) -> mpsc::UnboundedReceiver<Operation>;
}

/// In-memory transport with scriptable failures, for tests and demos.
///
/// Acts as a trivial remote authority: every accepted operation's clock is
/// merged into an authority clock, which is returned as the acknowledgement.
#[derive(Debug, Default)]
pub struct MemoryTransport {
    connected: AtomicBool,
    connect_failures: Mutex<VecDeque<DeliveryError>>,
    send_failures: Mutex<VecDeque<DeliveryError>>,
    fail_all_sends: Mutex<Option<DeliveryError>>,
    latency: Mutex<Option<Duration>>,
    attempts: Mutex<Vec<OperationId>>,
    delivered: Mutex<Vec<Operation>>,
    authority_clock: Mutex<CausalClock>,
    subscribers: Mutex<Vec<mpsc::UnboundedSender<Operation>>>,
}

fn locked<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl MemoryTransport {
    /// Creates a disconnected transport.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a transport with an established session.
    pub fn connected() -> Self {
        let transport = Self::default();
        transport.connected.store(true, Ordering::SeqCst);
        transport
    }

    /// Force the connected flag.
    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    /// Fail the next `connect` calls with these errors, in order.
    pub fn fail_next_connects(&self, errors: impl IntoIterator<Item = DeliveryError>) {
        locked(&self.connect_failures).extend(errors);
    }

    /// Fail the next `send` calls with these errors, in order.
    pub fn fail_next_sends(&self, errors: impl IntoIterator<Item = DeliveryError>) {
        locked(&self.send_failures).extend(errors);
    }

    /// Fail every `send` with this error until cleared with `None`.
    pub fn fail_all_sends(&self, error: Option<DeliveryError>) {
        *locked(&self.fail_all_sends) = error;
    }

    /// Delay each `send` by this much before answering.
    pub fn set_latency(&self, latency: Option<Duration>) {
        *locked(&self.latency) = latency;
    }

    /// IDs of every delivery attempt, in order.
    pub fn attempts(&self) -> Vec<OperationId> {
        locked(&self.attempts).clone()
    }

    /// Operations accepted by the authority, in order.
    pub fn delivered(&self) -> Vec<Operation> {
        locked(&self.delivered).clone()
    }

    /// The authority's merged clock.
    pub fn authority_clock(&self) -> CausalClock {
        locked(&self.authority_clock).clone()
    }

    /// Push a remotely-originated operation to every subscriber.
    ///
    /// Returns the number of subscribers reached.
    pub fn push_remote(&self, operation: Operation) -> usize {
        let mut subscribers = locked(&self.subscribers);
        subscribers.retain(|tx| tx.send(operation.clone()).is_ok());
        subscribers.len()
    }
}

impl Transport for MemoryTransport {
    async fn connect(&self) -> Result<(), DeliveryError> {
        let failure = locked(&self.connect_failures).pop_front();
        if let Some(err) = failure {
            return Err(err);
        }
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn send(&self, operation: &Operation) -> Result<CausalClock, DeliveryError> {
        locked(&self.attempts).push(operation.id);

        let latency = *locked(&self.latency);
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }

        if !self.is_connected() {
            return Err(DeliveryError::NotConnected);
        }
        let scripted = locked(&self.send_failures).pop_front();
        if let Some(err) = scripted {
            return Err(err);
        }
        let persistent = locked(&self.fail_all_sends).clone();
        if let Some(err) = persistent {
            return Err(err);
        }

        let ack = {
            let mut authority = locked(&self.authority_clock);
            authority.update(&operation.causal_clock);
            authority.clone()
        };
        locked(&self.delivered).push(operation.clone());
        Ok(ack)
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn disconnect(&self) {
        self.connected.store(false, Ordering::SeqCst);
    }

    fn subscribe_incoming(&self) -> mpsc::UnboundedReceiver<Operation> {
        let (tx, rx) = mpsc::unbounded_channel();
        locked(&self.subscribers).push(tx);
        rx
    }
}
