//! Application Layer - Port definitions.
//!
//! The traits here are the seams between the gateway's logic and the
//! outside world: the upstream socket, the credential store and the
//! path from downstream clients to the upstream subscribe request.

/// Port interfaces for external systems.
pub mod ports;
