//! WebSocket transport to a remote authority.
//!
//! Frames are JSON text messages tagged by `type`. When a token is configured
//! the client authenticates before anything else; operations are then
//! submitted one at a time and each waits for its matching acknowledgement.
//! Operations pushed by the authority are fanned out to every
//! `subscribe_incoming` receiver.
//!
//! This module is only available when the `ws` feature is enabled.

use crate::clock::CausalClock;
use crate::error::{DeliveryError, SyncResult};
use crate::ids::OperationId;
use crate::operation::Operation;
use crate::transport::Transport;
use futures_util::{SinkExt, Stream, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::{self, Message};

/// Messages sent from a client to the authority.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Authenticate with a token.
    Auth { token: String },
    /// Submit one operation.
    Submit { operation: Operation },
}

impl ClientMessage {
    pub fn to_json(&self) -> SyncResult<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Messages sent from the authority to a client.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    AuthSuccess,
    AuthError {
        message: String,
    },
    /// The operation was accepted; `clock` is the authority's merged clock.
    Ack {
        operation_id: OperationId,
        clock: CausalClock,
    },
    Reject {
        operation_id: OperationId,
        reason: String,
    },
    /// An operation from another participant.
    Push {
        operation: Operation,
    },
    Error {
        code: String,
        message: String,
    },
}

impl ServerMessage {
    pub fn from_json(text: &str) -> SyncResult<Self> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn to_json(&self) -> SyncResult<String> {
        Ok(serde_json::to_string(self)?)
    }
}

type AckSender = oneshot::Sender<Result<CausalClock, DeliveryError>>;
type Subscribers = Arc<Mutex<Vec<mpsc::UnboundedSender<Operation>>>>;

/// One established connection. `alive` is cleared by its reader task when
/// the socket closes, so a stale link never reports as connected.
struct Link {
    alive: Arc<AtomicBool>,
    outgoing: mpsc::UnboundedSender<ClientMessage>,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl Link {
    fn abort(self) {
        self.reader.abort();
        self.writer.abort();
    }
}

/// Transport over a single WebSocket connection.
pub struct WsTransport {
    url: String,
    token: Option<String>,
    pending: Arc<Mutex<HashMap<OperationId, AckSender>>>,
    subscribers: Subscribers,
    link: Mutex<Option<Link>>,
}

fn locked<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl WsTransport {
    /// Create a transport for `url` (e.g. `ws://host:port/sync`).
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            token: None,
            pending: Arc::new(Mutex::new(HashMap::new())),
            subscribers: Arc::new(Mutex::new(Vec::new())),
            link: Mutex::new(None),
        }
    }

    /// Authenticate with this token on every connect.
    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

impl Transport for WsTransport {
    async fn connect(&self) -> Result<(), DeliveryError> {
        self.disconnect();

        let (stream, _) = tokio_tungstenite::connect_async(self.url.as_str())
            .await
            .map_err(|e| DeliveryError::Unavailable(e.to_string()))?;
        let (mut sink, source) = stream.split();
        tracing::debug!(url = %self.url, "websocket connected");

        let (outgoing, mut outgoing_rx) = mpsc::unbounded_channel::<ClientMessage>();
        let (auth_tx, auth_rx) = oneshot::channel();

        let writer = tokio::spawn(async move {
            while let Some(msg) = outgoing_rx.recv().await {
                match msg.to_json() {
                    Ok(json) => {
                        if sink.send(Message::Text(json.into())).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        tracing::error!(error = %e, "failed to serialize message");
                    }
                }
            }
            let _ = sink.close().await;
        });

        let alive = Arc::new(AtomicBool::new(true));
        let reader = tokio::spawn(read_loop(
            source,
            auth_tx,
            Arc::clone(&alive),
            Arc::clone(&self.pending),
            Arc::clone(&self.subscribers),
        ));

        let link = Link {
            alive,
            outgoing,
            reader,
            writer,
        };

        if let Some(token) = &self.token {
            let auth = ClientMessage::Auth {
                token: token.clone(),
            };
            if link.outgoing.send(auth).is_err() {
                link.abort();
                return Err(DeliveryError::NotConnected);
            }
            let verdict = auth_rx.await.unwrap_or(Err(DeliveryError::NotConnected));
            if let Err(err) = verdict {
                tracing::warn!(url = %self.url, error = %err, "authentication failed");
                link.abort();
                return Err(err);
            }
        }

        if !link.alive.load(Ordering::SeqCst) {
            link.abort();
            return Err(DeliveryError::NotConnected);
        }

        *locked(&self.link) = Some(link);
        Ok(())
    }

    async fn send(&self, operation: &Operation) -> Result<CausalClock, DeliveryError> {
        if !self.is_connected() {
            return Err(DeliveryError::NotConnected);
        }

        let (tx, rx) = oneshot::channel();
        locked(&self.pending).insert(operation.id, tx);

        let submit = ClientMessage::Submit {
            operation: operation.clone(),
        };
        let queued = match locked(&self.link).as_ref() {
            Some(link) => link.outgoing.send(submit).is_ok(),
            None => false,
        };
        if !queued {
            locked(&self.pending).remove(&operation.id);
            return Err(DeliveryError::NotConnected);
        }

        rx.await.unwrap_or(Err(DeliveryError::NotConnected))
    }

    fn is_connected(&self) -> bool {
        locked(&self.link)
            .as_ref()
            .is_some_and(|link| link.alive.load(Ordering::SeqCst))
    }

    fn disconnect(&self) {
        let link = locked(&self.link).take();
        if let Some(link) = link {
            tracing::debug!(url = %self.url, "websocket disconnected");
            link.abort();
        }
        fail_pending(&self.pending);
    }

    fn subscribe_incoming(&self) -> mpsc::UnboundedReceiver<Operation> {
        let (tx, rx) = mpsc::unbounded_channel();
        locked(&self.subscribers).push(tx);
        rx
    }
}

impl Drop for WsTransport {
    fn drop(&mut self) {
        if let Some(link) = locked(&self.link).take() {
            link.abort();
        }
    }
}

fn fail_pending(pending: &Mutex<HashMap<OperationId, AckSender>>) {
    for (_, tx) in locked(pending).drain() {
        let _ = tx.send(Err(DeliveryError::NotConnected));
    }
}

async fn read_loop<S>(
    mut source: S,
    auth_tx: oneshot::Sender<Result<(), DeliveryError>>,
    alive: Arc<AtomicBool>,
    pending: Arc<Mutex<HashMap<OperationId, AckSender>>>,
    subscribers: Subscribers,
) where
    S: Stream<Item = Result<Message, tungstenite::Error>> + Unpin,
{
    let mut auth = Some(auth_tx);

    while let Some(frame) = source.next().await {
        let text = match frame {
            Ok(Message::Text(text)) => text,
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(e) => {
                tracing::warn!(error = %e, "websocket error");
                break;
            }
        };

        let msg = match ServerMessage::from_json(&text) {
            Ok(msg) => msg,
            Err(e) => {
                tracing::warn!(error = %e, "ignoring unreadable frame");
                continue;
            }
        };

        match msg {
            ServerMessage::AuthSuccess => {
                if let Some(tx) = auth.take() {
                    let _ = tx.send(Ok(()));
                }
            }
            ServerMessage::AuthError { message } => {
                if let Some(tx) = auth.take() {
                    let _ = tx.send(Err(DeliveryError::Rejected(message)));
                }
            }
            ServerMessage::Ack {
                operation_id,
                clock,
            } => {
                if let Some(tx) = locked(&pending).remove(&operation_id) {
                    let _ = tx.send(Ok(clock));
                }
            }
            ServerMessage::Reject {
                operation_id,
                reason,
            } => {
                if let Some(tx) = locked(&pending).remove(&operation_id) {
                    let _ = tx.send(Err(DeliveryError::Rejected(reason)));
                }
            }
            ServerMessage::Push { operation } => {
                locked(&subscribers).retain(|tx| tx.send(operation.clone()).is_ok());
            }
            ServerMessage::Error { code, message } => {
                tracing::warn!(%code, %message, "remote reported an error");
            }
        }
    }

    alive.store(false, Ordering::SeqCst);
    fail_pending(&pending);
}
