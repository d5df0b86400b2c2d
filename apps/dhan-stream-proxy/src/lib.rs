#![cfg_attr(
    test,
    allow(
        clippy::unwrap_used,
        clippy::expect_used,
        clippy::float_cmp,
        clippy::significant_drop_tightening,
        clippy::too_many_lines,
        clippy::needless_pass_by_value,
        clippy::items_after_statements
    )
)]

//! Dhan Stream Proxy - Market Data Fan-out
//!
//! Maintains a single connection to Dhan's binary market feed and relays
//! last-traded-price ticks to any number of downstream WebSocket clients
//! as JSON. Upstream subscriptions are deduplicated across clients and
//! replayed after every reconnect.
//!
//! # Layers (inside → outside)
//!
//! - **Domain**: value types and shared state
//!   - `streaming`: instrument keys, ticks, status events, connection state
//!   - `subscription`: per-instrument interest and the upstream dedup set
//!
//! - **Application**: port definitions
//!   - `ports`: feed connector/transport, subscription sink, credentials
//!
//! - **Infrastructure**: adapters
//!   - `dhan`: packet decoder, subscribe messages, feed client, backoff
//!   - `broadcast`: per-client queues and fan-out
//!   - `server`: client protocol, connection manager, WebSocket endpoint
//!   - `credentials`, `config`, `health`, `metrics`, `telemetry`
//!
//! # Data Flow
//!
//! ```text
//!                     subscribe (deduped)
//!            ┌───────────────────────────────────────┐
//!            ▼                                       │
//! Dhan feed WS ──► FeedClient ──► FeedEvent ──► ClientManager ──► Client 1
//!  (binary)        (decode)       channel      (serialize once) ─► Client 2
//!                                                                ─► Client N
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]

// =============================================================================
// Module Declarations
// =============================================================================

/// Domain layer - Core streaming types with no I/O.
pub mod domain;

/// Application layer - Port definitions.
pub mod application;

/// Infrastructure layer - Adapters and external integrations.
pub mod infrastructure;

// =============================================================================
// Re-exports
// =============================================================================

// Domain types
pub use domain::streaming::{
    ConnectionState, ExchangeSegment, InstrumentKey, ParsedMessage, StatusEvent, TickEvent,
};
pub use domain::subscription::{ClientId, RegistryStats, SubscriptionRegistry};

// Ports
pub use application::ports::{
    CredentialSource, CredentialsError, FeedConnector, FeedCredentials, FeedError, FeedFrame,
    FeedTransport, SubscriptionSink,
};

// Infrastructure config
pub use infrastructure::config::{
    ClientSettings, ConfigError, FeedSettings, ProxyConfig, ServerSettings,
};

// Feed client
pub use infrastructure::dhan::{
    FeedClient, FeedClientConfig, FeedEvent, FeedHandle, FeedState, ProtocolError,
    UnavailableUpstream, WsFeedConnector,
};

// Downstream server
pub use infrastructure::broadcast::{ClientHub, Outbound};
pub use infrastructure::server::{ClientManager, ClientServer, ClientServerError, ServerMessage};

// Health server
pub use infrastructure::health::{HealthServer, HealthServerError, HealthServerState};

// Metrics
pub use infrastructure::metrics::init_metrics;

// Telemetry
pub use infrastructure::telemetry::{TelemetryConfig, TelemetryGuard, init as init_telemetry};
