//! Domain Layer - Core streaming types and subscription tracking.
//!
//! Pure Rust value types and in-memory state with no I/O. Everything in
//! the infrastructure layer is expressed in terms of these types.

/// Instrument, tick and connection-state types.
pub mod streaming;

/// Subscription registry (interest tracking and upstream dedup).
pub mod subscription;
