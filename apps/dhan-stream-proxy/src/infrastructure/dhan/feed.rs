//! Dhan Feed Client
//!
//! Owns the single upstream connection: connect, replay subscriptions,
//! receive, reconnect with backoff.
//!
//! # State Machine
//!
//! ```text
//! Connecting ──ok──► Connected ──close/error──► Reconnecting ──backoff, ok──► Connected
//!     │                                             │
//!     └──fail──► Reconnecting                       └──attempts exhausted──► Disconnected (terminal)
//! ```
//!
//! The client task is the only owner of the socket. Subscribe requests
//! arrive over a command channel from [`FeedHandle`]; decoded ticks and
//! lifecycle changes leave over one ordered event channel.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;

use super::auth::{authenticated_url, redacted_url};
use super::codec;
use super::messages::SubscribeRequest;
use super::reconnect::{ReconnectConfig, ReconnectPolicy};
use crate::application::ports::{
    FeedConnector, FeedCredentials, FeedError, FeedFrame, FeedTransport, SubscriptionSink,
};
use crate::domain::streaming::{
    ConnectionState, InstrumentKey, ParsedMessage, StatusEvent, TickEvent,
};
use crate::domain::subscription::SubscriptionRegistry;
use crate::infrastructure::metrics::{self, FrameKind};

/// Default receive-stall warning threshold.
pub const DEFAULT_STALL_TIMEOUT: Duration = Duration::from_secs(60);

/// Default capacity of the subscribe command queue.
pub const DEFAULT_COMMAND_CAPACITY: usize = 256;

// =============================================================================
// Feed Events
// =============================================================================

/// Events emitted by the feed client, in upstream arrival order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FeedEvent {
    /// Connected to the feed.
    Connected,
    /// Connection lost.
    Disconnected,
    /// Waiting before a reconnection attempt.
    Reconnecting {
        /// Reconnection attempt number.
        attempt: u32,
    },
    /// Decoded ticker.
    Tick(TickEvent),
    /// Upstream status message.
    Status(StatusEvent),
    /// A subscribe request was written to the socket.
    Subscribed {
        /// Instruments in the request.
        count: usize,
    },
    /// Reconnection gave up; no further upstream data will arrive.
    Unavailable {
        /// Consecutive reconnection attempts made.
        attempts: u32,
    },
}

// =============================================================================
// Feed State
// =============================================================================

/// Upstream connection state shared with health and the subscribe path.
///
/// Written only by the feed client task.
#[derive(Debug, Default)]
pub struct FeedState {
    state: RwLock<ConnectionState>,
    last_connected_at: RwLock<Option<DateTime<Utc>>>,
    unavailable_reason: RwLock<Option<String>>,
    reconnect_attempts: AtomicU32,
    messages_received: AtomicU64,
    decode_errors: AtomicU64,
}

impl FeedState {
    /// Create state in `Disconnected`.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the connection state.
    pub fn set_state(&self, state: ConnectionState) {
        *self.state.write() = state;
        if state == ConnectionState::Connected {
            *self.last_connected_at.write() = Some(Utc::now());
            self.reconnect_attempts.store(0, Ordering::Relaxed);
        }
        metrics::set_upstream_connected(state == ConnectionState::Connected);
    }

    /// Current connection state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        *self.state.read()
    }

    /// Whether the upstream socket is currently live.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Record the current reconnection attempt number.
    pub fn set_reconnect_attempts(&self, attempts: u32) {
        self.reconnect_attempts.store(attempts, Ordering::Relaxed);
    }

    /// Current reconnection attempt number (0 while connected).
    #[must_use]
    pub fn reconnect_attempts(&self) -> u32 {
        self.reconnect_attempts.load(Ordering::Relaxed)
    }

    /// Count one received frame.
    pub fn increment_messages(&self) {
        self.messages_received.fetch_add(1, Ordering::Relaxed);
    }

    /// Frames received since startup.
    #[must_use]
    pub fn messages_received(&self) -> u64 {
        self.messages_received.load(Ordering::Relaxed)
    }

    /// Count one undecodable frame.
    pub fn increment_decode_errors(&self) {
        self.decode_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Undecodable frames since startup.
    #[must_use]
    pub fn decode_errors(&self) -> u64 {
        self.decode_errors.load(Ordering::Relaxed)
    }

    /// Time of the most recent successful connect.
    #[must_use]
    pub fn last_connected_at(&self) -> Option<DateTime<Utc>> {
        *self.last_connected_at.read()
    }

    /// Mark the feed as permanently unavailable.
    pub fn mark_unavailable(&self, reason: impl Into<String>) {
        *self.state.write() = ConnectionState::Disconnected;
        *self.unavailable_reason.write() = Some(reason.into());
        metrics::set_upstream_connected(false);
    }

    /// Why the feed is permanently unavailable, if it is.
    #[must_use]
    pub fn unavailable_reason(&self) -> Option<String> {
        self.unavailable_reason.read().clone()
    }
}

// =============================================================================
// Configuration
// =============================================================================

/// Configuration for the feed client.
#[derive(Debug, Clone)]
pub struct FeedClientConfig {
    /// Feed base URL (without auth query).
    pub base_url: String,
    /// Account credentials.
    pub credentials: FeedCredentials,
    /// Reconnection configuration.
    pub reconnect: ReconnectConfig,
    /// Silence after which a stall warning is logged.
    pub stall_timeout: Duration,
    /// Capacity of the subscribe command queue.
    pub command_capacity: usize,
}

impl FeedClientConfig {
    /// Create a configuration with default timings.
    #[must_use]
    pub fn new(base_url: impl Into<String>, credentials: FeedCredentials) -> Self {
        Self {
            base_url: base_url.into(),
            credentials,
            reconnect: ReconnectConfig::default(),
            stall_timeout: DEFAULT_STALL_TIMEOUT,
            command_capacity: DEFAULT_COMMAND_CAPACITY,
        }
    }

    /// Create a configuration from `FeedSettings`.
    #[must_use]
    pub fn from_settings(settings: &crate::FeedSettings, credentials: FeedCredentials) -> Self {
        Self {
            base_url: settings.url.clone(),
            credentials,
            reconnect: ReconnectConfig::from_feed_settings(settings),
            stall_timeout: settings.stall_timeout,
            command_capacity: DEFAULT_COMMAND_CAPACITY,
        }
    }

    fn url(&self) -> String {
        authenticated_url(&self.base_url, &self.credentials)
    }
}

// =============================================================================
// Feed Client
// =============================================================================

#[derive(Debug)]
enum FeedCommand {
    Subscribe(Vec<InstrumentKey>),
}

enum SessionEnd {
    Cancelled,
    Lost(FeedError),
}

/// Upstream feed client.
///
/// [`FeedClient::run`] consumes the client, so at most one receive loop
/// can ever exist for a given connection.
pub struct FeedClient {
    config: FeedClientConfig,
    connector: Arc<dyn FeedConnector>,
    registry: Arc<SubscriptionRegistry>,
    state: Arc<FeedState>,
    event_tx: mpsc::Sender<FeedEvent>,
    command_rx: mpsc::Receiver<FeedCommand>,
    cancel: CancellationToken,
}

impl FeedClient {
    /// Create a feed client and the handle used to reach it.
    #[must_use]
    pub fn new(
        config: FeedClientConfig,
        connector: Arc<dyn FeedConnector>,
        registry: Arc<SubscriptionRegistry>,
        event_tx: mpsc::Sender<FeedEvent>,
        cancel: CancellationToken,
    ) -> (Self, FeedHandle) {
        let (command_tx, command_rx) = mpsc::channel(config.command_capacity.max(1));
        let state = Arc::new(FeedState::new());

        let handle = FeedHandle {
            command_tx,
            state: Arc::clone(&state),
        };

        let client = Self {
            config,
            connector,
            registry,
            state,
            event_tx,
            command_rx,
            cancel,
        };

        (client, handle)
    }

    /// Shared connection state.
    #[must_use]
    pub fn state(&self) -> Arc<FeedState> {
        Arc::clone(&self.state)
    }

    /// Run the connect / receive / reconnect loop until cancelled or
    /// reconnection gives up.
    ///
    /// # Errors
    ///
    /// Returns `FeedError::MaxReconnectAttemptsExceeded` when the
    /// reconnection policy is exhausted.
    pub async fn run(mut self) -> Result<(), FeedError> {
        let mut policy = ReconnectPolicy::new(self.config.reconnect);
        let url = self.config.url();

        self.state.set_state(ConnectionState::Connecting);

        loop {
            tracing::info!(
                url = %redacted_url(&self.config.base_url, &self.config.credentials),
                "Connecting to Dhan feed"
            );

            let connected = tokio::select! {
                () = self.cancel.cancelled() => {
                    self.stopped();
                    return Ok(());
                }
                result = self.connector.connect(&url) => result,
            };

            match connected {
                Ok(transport) => {
                    policy.reset();
                    self.state.set_state(ConnectionState::Connected);
                    tracing::info!("Dhan feed connected");
                    self.emit(FeedEvent::Connected).await;

                    match self.run_session(transport).await {
                        SessionEnd::Cancelled => {
                            self.stopped();
                            return Ok(());
                        }
                        SessionEnd::Lost(e) => {
                            tracing::warn!(error = %e, "Dhan feed connection lost");
                            self.state.set_state(ConnectionState::Reconnecting);
                            self.emit(FeedEvent::Disconnected).await;
                        }
                    }
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Dhan feed connect failed");
                }
            }

            let Some(delay) = policy.next_delay() else {
                let attempts = policy.attempt_count();
                tracing::error!(attempts, "Dhan feed reconnection attempts exhausted, upstream unavailable");
                self.state
                    .mark_unavailable(format!("gave up after {attempts} reconnection attempts"));
                self.emit(FeedEvent::Unavailable { attempts }).await;
                return Err(FeedError::MaxReconnectAttemptsExceeded(attempts));
            };

            let attempt = policy.attempt_count();
            self.state.set_state(ConnectionState::Reconnecting);
            self.state.set_reconnect_attempts(attempt);
            metrics::record_reconnect();
            tracing::info!(
                attempt,
                delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                "Reconnecting to Dhan feed"
            );
            self.emit(FeedEvent::Reconnecting { attempt }).await;

            if !self.wait_backoff(delay).await {
                self.stopped();
                return Ok(());
            }
        }
    }

    /// Replay the dedup set, then receive until the connection ends.
    async fn run_session(&mut self, mut transport: Box<dyn FeedTransport>) -> SessionEnd {
        let replay = self.registry.all_dedup_keys();
        if !replay.is_empty() {
            tracing::info!(count = replay.len(), "Replaying upstream subscriptions");
            if let Err(e) = self.send_subscribe(transport.as_mut(), &replay).await {
                transport.close().await;
                return SessionEnd::Lost(e);
            }
        }

        // Requests queued since the state flipped to Connected may already
        // be covered by the replay.
        while let Ok(FeedCommand::Subscribe(keys)) = self.command_rx.try_recv() {
            let leftover = not_replayed(&replay, keys);
            if leftover.is_empty() {
                tracing::debug!("Queued subscribe already covered by replay");
                continue;
            }
            if let Err(e) = self.send_subscribe(transport.as_mut(), &leftover).await {
                transport.close().await;
                return SessionEnd::Lost(e);
            }
        }

        let stall_timeout = self.config.stall_timeout;
        let stall = tokio::time::sleep(stall_timeout);
        tokio::pin!(stall);

        loop {
            tokio::select! {
                () = self.cancel.cancelled() => {
                    transport.close().await;
                    return SessionEnd::Cancelled;
                }
                () = &mut stall => {
                    tracing::warn!(
                        stall_secs = stall_timeout.as_secs(),
                        "No data from Dhan feed, connection may be stale"
                    );
                    stall.as_mut().reset(tokio::time::Instant::now() + stall_timeout);
                }
                Some(FeedCommand::Subscribe(keys)) = self.command_rx.recv() => {
                    if let Err(e) = self.send_subscribe(transport.as_mut(), &keys).await {
                        transport.close().await;
                        return SessionEnd::Lost(e);
                    }
                }
                frame = transport.next_frame() => {
                    match frame {
                        Some(Ok(FeedFrame::Close)) | None => {
                            return SessionEnd::Lost(FeedError::ConnectionClosed);
                        }
                        Some(Ok(frame)) => {
                            stall.as_mut().reset(tokio::time::Instant::now() + stall_timeout);
                            self.handle_frame(&frame).await;
                        }
                        Some(Err(e)) => return SessionEnd::Lost(e),
                    }
                }
            }
        }
    }

    async fn handle_frame(&self, frame: &FeedFrame) {
        self.state.increment_messages();

        match codec::decode(frame) {
            Ok(ParsedMessage::Tick(tick)) => {
                metrics::record_frame_received(FrameKind::Ticker);
                tracing::trace!(
                    segment = tick.exchange_segment.code(),
                    security_id = %tick.security_id,
                    ltp = %tick.ltp,
                    "Tick"
                );
                self.emit(FeedEvent::Tick(tick)).await;
            }
            Ok(ParsedMessage::Status(status)) => {
                metrics::record_frame_received(FrameKind::Status);
                tracing::debug!(payload = %status.payload, "Feed status message");
                self.emit(FeedEvent::Status(status)).await;
            }
            Ok(ParsedMessage::Ignorable { reason }) => {
                metrics::record_frame_received(FrameKind::Ignored);
                tracing::warn!(%reason, "Ignoring feed frame");
            }
            Err(e) => {
                self.state.increment_decode_errors();
                metrics::record_decode_error();
                tracing::warn!(error = %e, "Dropping malformed feed packet");
            }
        }
    }

    async fn send_subscribe(
        &self,
        transport: &mut dyn FeedTransport,
        keys: &[InstrumentKey],
    ) -> Result<(), FeedError> {
        let request = SubscribeRequest::ticker(keys);
        if request.is_empty() {
            return Ok(());
        }

        let count = request.instrument_count;
        transport.send_text(request.to_json()?).await?;

        tracing::info!(count, "Subscribe request sent");
        metrics::set_upstream_subscriptions(self.registry.stats().upstream_subscriptions);
        self.emit(FeedEvent::Subscribed { count }).await;
        Ok(())
    }

    /// Sleep out a backoff delay. Returns `false` if cancelled.
    async fn wait_backoff(&mut self, delay: Duration) -> bool {
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);

        loop {
            tokio::select! {
                () = self.cancel.cancelled() => return false,
                () = &mut sleep => return true,
                Some(FeedCommand::Subscribe(keys)) = self.command_rx.recv() => {
                    tracing::warn!(
                        count = keys.len(),
                        "Subscribe request arrived while reconnecting, will be replayed"
                    );
                }
            }
        }
    }

    async fn emit(&self, event: FeedEvent) {
        if self.event_tx.send(event).await.is_err() {
            tracing::debug!("Feed event receiver dropped");
        }
    }

    fn stopped(&self) {
        self.state.set_state(ConnectionState::Disconnected);
        tracing::info!("Dhan feed client stopped");
    }
}

/// Keys absent from `replay`, which must be sorted.
fn not_replayed(replay: &[InstrumentKey], keys: Vec<InstrumentKey>) -> Vec<InstrumentKey> {
    keys.into_iter()
        .filter(|key| replay.binary_search(key).is_err())
        .collect()
}

// =============================================================================
// Feed Handle
// =============================================================================

/// Cloneable handle that forwards subscribe requests to the feed client.
#[derive(Debug, Clone)]
pub struct FeedHandle {
    command_tx: mpsc::Sender<FeedCommand>,
    state: Arc<FeedState>,
}

impl FeedHandle {
    /// Shared connection state.
    #[must_use]
    pub fn state(&self) -> Arc<FeedState> {
        Arc::clone(&self.state)
    }
}

impl SubscriptionSink for FeedHandle {
    fn request_subscription(&self, instruments: Vec<InstrumentKey>) -> Result<(), FeedError> {
        if instruments.is_empty() {
            return Ok(());
        }

        if !self.state.is_connected() {
            tracing::warn!(
                count = instruments.len(),
                state = self.state.state().as_str(),
                "Upstream not connected, subscribe request not sent"
            );
            return Err(FeedError::NotConnected);
        }

        self.command_tx
            .try_send(FeedCommand::Subscribe(instruments))
            .map_err(|e| match e {
                TrySendError::Full(_) => FeedError::CommandQueueFull,
                TrySendError::Closed(_) => FeedError::CommandChannelClosed,
            })
    }
}

/// Subscription sink used when the feed client could not be started.
#[derive(Debug, Clone)]
pub struct UnavailableUpstream {
    reason: String,
}

impl UnavailableUpstream {
    /// Create a sink that rejects every request with `reason`.
    #[must_use]
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

impl SubscriptionSink for UnavailableUpstream {
    fn request_subscription(&self, instruments: Vec<InstrumentKey>) -> Result<(), FeedError> {
        tracing::warn!(
            count = instruments.len(),
            reason = %self.reason,
            "Upstream feed unavailable, subscribe request not sent"
        );
        Err(FeedError::UpstreamUnavailable(self.reason.clone()))
    }
}

// =============================================================================
// Tests
// =============================================================================
