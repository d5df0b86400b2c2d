//! Client Fan-out
//!
//! Tracks live downstream connections and delivers serialized payloads to
//! them.
//!
//! # Architecture
//!
//! Each client owns a bounded mpsc queue drained by its socket writer
//! task. Sending never awaits. A send either lands in the queue or fails;
//! a failed client (queue closed, or full because the socket cannot keep
//! up) is reported to the caller for removal and its socket is told to
//! close. Because the broadcaster enqueues events one at a time, every
//! client sees events in the order they were broadcast.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use axum::extract::ws::Utf8Bytes;
use parking_lot::RwLock;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;

use crate::domain::subscription::ClientId;

// =============================================================================
// Outbound Messages
// =============================================================================

/// Work item for a client's socket writer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    /// A JSON text frame.
    Text(Utf8Bytes),
    /// A keepalive ping.
    Ping,
    /// Send a close frame and stop writing.
    Close,
}

/// Per-client delivery failures. Either one removes the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ClientTransportError {
    /// The client's writer is gone.
    #[error("client connection closed")]
    Closed,
    /// The client's queue is full.
    #[error("client queue full")]
    Lagging,
}

// =============================================================================
// Client Connection
// =============================================================================

/// Handle to one downstream socket. Identity is the id, never the content.
#[derive(Debug)]
pub struct ClientConnection {
    id: ClientId,
    tx: mpsc::Sender<Outbound>,
    shutdown: CancellationToken,
}

impl ClientConnection {
    /// Wrap a writer queue.
    #[must_use]
    pub fn new(id: ClientId, tx: mpsc::Sender<Outbound>) -> Self {
        Self {
            id,
            tx,
            shutdown: CancellationToken::new(),
        }
    }

    /// Client id.
    #[must_use]
    pub const fn id(&self) -> ClientId {
        self.id
    }

    /// Queue a text payload without waiting.
    ///
    /// # Errors
    ///
    /// `Lagging` if the queue is full, `Closed` if the writer is gone.
    pub fn send(&self, payload: Utf8Bytes) -> Result<(), ClientTransportError> {
        self.enqueue(Outbound::Text(payload))
    }

    /// Queue a keepalive ping.
    ///
    /// # Errors
    ///
    /// Same as [`Self::send`].
    pub fn ping(&self) -> Result<(), ClientTransportError> {
        self.enqueue(Outbound::Ping)
    }

    /// Tell the socket task to stop and, if there is room, queue a close
    /// frame. Safe to call more than once.
    pub fn close(&self) {
        self.shutdown.cancel();
        if let Err(e) = self.enqueue(Outbound::Close) {
            tracing::debug!(client_id = self.id, error = %e, "Close frame not queued");
        }
    }

    /// Resolves once [`Self::close`] has been called.
    pub async fn closed(&self) {
        self.shutdown.cancelled().await;
    }

    fn enqueue(&self, message: Outbound) -> Result<(), ClientTransportError> {
        self.tx.try_send(message).map_err(|e| match e {
            TrySendError::Full(_) => ClientTransportError::Lagging,
            TrySendError::Closed(_) => ClientTransportError::Closed,
        })
    }
}

// =============================================================================
// Client Hub
// =============================================================================

/// Result of one broadcast.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BroadcastOutcome {
    /// Clients the payload was queued for.
    pub delivered: usize,
    /// Failed clients whose queue was full.
    pub lagging: usize,
    /// Every client the payload could not be queued for; the caller must
    /// remove them.
    pub failed: Vec<ClientId>,
}

/// Set of live downstream connections.
///
/// # Example
///
/// ```rust
/// use dhan_stream_proxy::infrastructure::broadcast::{ClientHub, Outbound};
/// use tokio::sync::mpsc;
///
/// let hub = ClientHub::new();
/// let (tx, mut rx) = mpsc::channel(8);
/// let client = hub.register(tx);
///
/// let outcome = hub.broadcast(&"{\"type\":\"pong\"}".into());
/// assert_eq!(outcome.delivered, 1);
/// assert_eq!(rx.try_recv().unwrap(), Outbound::Text("{\"type\":\"pong\"}".into()));
///
/// hub.unregister(client.id());
/// assert_eq!(hub.client_count(), 0);
/// ```
#[derive(Debug, Default)]
pub struct ClientHub {
    clients: RwLock<HashMap<ClientId, Arc<ClientConnection>>>,
    next_id: AtomicU64,
}

impl ClientHub {
    /// Create an empty hub.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new client writer queue and assign it an id.
    pub fn register(&self, tx: mpsc::Sender<Outbound>) -> Arc<ClientConnection> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let client = Arc::new(ClientConnection::new(id, tx));
        self.clients.write().insert(id, Arc::clone(&client));
        client
    }

    /// Remove a client. Returns it if it was still registered.
    pub fn unregister(&self, id: ClientId) -> Option<Arc<ClientConnection>> {
        self.clients.write().remove(&id)
    }

    /// Queue the same payload for every live client.
    ///
    /// One client's failure never stops delivery to the rest.
    pub fn broadcast(&self, payload: &Utf8Bytes) -> BroadcastOutcome {
        let clients: Vec<_> = self.clients.read().values().cloned().collect();
        let mut outcome = BroadcastOutcome::default();

        for client in clients {
            match client.send(payload.clone()) {
                Ok(()) => outcome.delivered += 1,
                Err(e) => {
                    tracing::debug!(client_id = client.id(), error = %e, "Broadcast send failed");
                    if e == ClientTransportError::Lagging {
                        outcome.lagging += 1;
                    }
                    outcome.failed.push(client.id());
                }
            }
        }

        outcome
    }

    /// Number of live clients.
    #[must_use]
    pub fn client_count(&self) -> usize {
        self.clients.read().len()
    }

    /// Ids of live clients.
    #[must_use]
    pub fn client_ids(&self) -> Vec<ClientId> {
        self.clients.read().keys().copied().collect()
    }

    /// Ask every client to close and forget them all.
    ///
    /// Returns the number of clients closed.
    pub fn close_all(&self) -> usize {
        let clients: Vec<_> = self.clients.write().drain().map(|(_, c)| c).collect();
        for client in &clients {
            client.close();
        }
        clients.len()
    }
}

// =============================================================================
// Tests
// =============================================================================
