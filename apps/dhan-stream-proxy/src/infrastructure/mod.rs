//! Infrastructure Layer - Adapters and external integrations.
//!
//! Concrete implementations of the application ports plus the
//! downstream server and operational endpoints.

/// Dhan market feed client (upstream).
pub mod dhan;

/// Downstream client fan-out.
pub mod broadcast;

/// Downstream WebSocket server and client protocol.
pub mod server;

/// Credential sources for the upstream feed.
pub mod credentials;

/// Configuration loading.
pub mod config;

/// Health check HTTP endpoint.
pub mod health;

/// Prometheus metrics instrumentation.
pub mod metrics;

/// OpenTelemetry tracing integration.
pub mod telemetry;
