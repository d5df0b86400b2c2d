//! Client Connection Manager
//!
//! Owns the downstream side of the gateway: client registration, control
//! messages, and fan-out of feed events. Socket I/O lives in
//! [`super::socket`]; everything here is synchronous and runs between
//! suspension points, so each handler is atomic with respect to the
//! others.

use std::sync::Arc;
use std::time::Instant;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::application::ports::SubscriptionSink;
use crate::domain::streaming::InstrumentKey;
use crate::domain::subscription::{ClientId, SubscriptionRegistry};
use crate::infrastructure::broadcast::{
    BroadcastOutcome, ClientConnection, ClientHub, ClientTransportError, Outbound,
};
use crate::infrastructure::dhan::FeedEvent;
use crate::infrastructure::metrics;

use super::protocol::{ClientMessage, ServerMessage, parse_instruments};

/// Routes client control messages and broadcasts feed events.
pub struct ClientManager {
    hub: Arc<ClientHub>,
    registry: Arc<SubscriptionRegistry>,
    upstream: Arc<dyn SubscriptionSink>,
}

impl std::fmt::Debug for ClientManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientManager")
            .field("clients", &self.hub.client_count())
            .field("registry", &self.registry.stats())
            .finish_non_exhaustive()
    }
}

impl ClientManager {
    /// Create a manager over shared state.
    #[must_use]
    pub fn new(
        hub: Arc<ClientHub>,
        registry: Arc<SubscriptionRegistry>,
        upstream: Arc<dyn SubscriptionSink>,
    ) -> Self {
        Self {
            hub,
            registry,
            upstream,
        }
    }

    /// The live-client set.
    #[must_use]
    pub const fn hub(&self) -> &Arc<ClientHub> {
        &self.hub
    }

    /// The subscription registry.
    #[must_use]
    pub const fn registry(&self) -> &Arc<SubscriptionRegistry> {
        &self.registry
    }

    // =========================================================================
    // Client Lifecycle
    // =========================================================================

    /// Register a new client and greet it.
    pub fn on_client_connected(&self, tx: mpsc::Sender<Outbound>) -> Arc<ClientConnection> {
        let client = self.hub.register(tx);
        metrics::set_clients(self.hub.client_count());
        tracing::info!(
            client_id = client.id(),
            clients = self.hub.client_count(),
            "Client connected"
        );

        self.reply(&client, &ServerMessage::connected());
        client
    }

    /// Handle one inbound text frame. Bad input is logged and ignored.
    pub fn on_client_message(&self, client: &ClientConnection, raw: &str) {
        match ClientMessage::parse(raw) {
            Ok(ClientMessage::Subscribe { instruments }) => {
                let keys = parse_instruments(&instruments);
                self.subscribe(client, &keys, instruments.len());
            }
            Ok(ClientMessage::Ping) => self.reply(client, &ServerMessage::Pong),
            Err(e) => {
                tracing::warn!(client_id = client.id(), error = %e, "Ignoring client message");
            }
        }
    }

    /// Forget a client: drop it from the live set and from every interest
    /// set, and tell its socket to close. Safe to call more than once.
    pub fn on_client_disconnected(&self, id: ClientId) {
        let removed = self.hub.unregister(id);
        let orphaned = self.registry.remove_client(id);

        if let Some(client) = removed {
            client.close();
            metrics::set_clients(self.hub.client_count());
            tracing::info!(
                client_id = id,
                orphaned_instruments = orphaned.len(),
                clients = self.hub.client_count(),
                "Client disconnected"
            );
        }
    }

    fn subscribe(&self, client: &ClientConnection, keys: &[InstrumentKey], listed: usize) {
        let fresh = self.registry.plan_subscription(client.id(), keys);

        if fresh.is_empty() {
            tracing::debug!(
                client_id = client.id(),
                requested = keys.len(),
                "All instruments already subscribed upstream"
            );
        } else {
            let count = fresh.len();
            match self.upstream.request_subscription(fresh) {
                Ok(()) => {
                    tracing::info!(client_id = client.id(), count, "Requested upstream subscription");
                }
                Err(e) => {
                    tracing::warn!(
                        client_id = client.id(),
                        count,
                        error = %e,
                        "Upstream subscription deferred to next connect"
                    );
                }
            }
        }

        self.reply(client, &ServerMessage::Subscribed { count: listed });
    }

    fn reply(&self, client: &ClientConnection, message: &ServerMessage) {
        let payload = match message.to_payload() {
            Ok(payload) => payload,
            Err(e) => {
                tracing::error!(error = %e, "Failed to encode client reply");
                return;
            }
        };

        match client.send(payload) {
            Ok(()) => metrics::record_payloads_sent(1),
            Err(e) => {
                tracing::debug!(client_id = client.id(), error = %e, "Reply failed, dropping client");
                if e == ClientTransportError::Lagging {
                    metrics::record_payloads_dropped(1);
                }
                self.on_client_disconnected(client.id());
            }
        }
    }

    // =========================================================================
    // Fan-out
    // =========================================================================

    /// Serialize `message` once and queue it for every live client.
    ///
    /// Clients whose connection is gone or whose queue is full are removed
    /// as if they had disconnected.
    pub fn broadcast(&self, message: &ServerMessage) -> BroadcastOutcome {
        let started = Instant::now();

        let payload = match message.to_payload() {
            Ok(payload) => payload,
            Err(e) => {
                tracing::error!(error = %e, "Failed to encode broadcast");
                return BroadcastOutcome::default();
            }
        };

        let outcome = self.hub.broadcast(&payload);
        for id in &outcome.failed {
            self.on_client_disconnected(*id);
        }

        metrics::record_payloads_sent(outcome.delivered as u64);
        if outcome.lagging > 0 {
            metrics::record_payloads_dropped(outcome.lagging as u64);
        }
        metrics::record_broadcast_duration(started.elapsed());

        outcome
    }

    /// Apply one feed event: ticks and status messages go to every client,
    /// lifecycle events are logged.
    pub fn handle_feed_event(&self, event: FeedEvent) {
        match event {
            FeedEvent::Tick(tick) => {
                self.broadcast(&ServerMessage::Ticker(tick));
            }
            FeedEvent::Status(status) => {
                self.broadcast(&ServerMessage::Status {
                    message: status.payload,
                });
            }
            FeedEvent::Connected => tracing::info!("Upstream feed connected"),
            FeedEvent::Disconnected => tracing::warn!("Upstream feed disconnected"),
            FeedEvent::Reconnecting { attempt } => {
                tracing::info!(attempt, "Upstream feed reconnecting");
            }
            FeedEvent::Subscribed { count } => {
                tracing::debug!(count, "Upstream subscribe sent");
            }
            FeedEvent::Unavailable { attempts } => {
                tracing::error!(
                    attempts,
                    clients = self.hub.client_count(),
                    "Upstream feed unavailable, clients stay connected without ticks"
                );
            }
        }
    }

    /// Drain feed events until the feed client stops or shutdown.
    pub async fn relay_feed_events(
        self: Arc<Self>,
        mut events: mpsc::Receiver<FeedEvent>,
        cancel: CancellationToken,
    ) {
        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                event = events.recv() => match event {
                    Some(event) => self.handle_feed_event(event),
                    None => {
                        tracing::info!("Feed event stream ended");
                        break;
                    }
                },
            }
        }
    }

    /// Send a close to every client and forget them all.
    pub fn close_all(&self) -> usize {
        let ids = self.hub.client_ids();
        let closed = self.hub.close_all();
        for id in ids {
            self.registry.remove_client(id);
        }
        metrics::set_clients(0);
        closed
    }
}

// =============================================================================
// Tests
// =============================================================================
