//! Downstream Client Server
//!
//! - [`protocol`]: JSON control messages exchanged with clients
//! - [`manager`]: client registration, subscribe handling and fan-out
//! - [`socket`]: the axum WebSocket endpoint

pub mod manager;
pub mod protocol;
pub mod socket;

pub use manager::ClientManager;
pub use protocol::{CONNECTED_MESSAGE, ClientMessage, InstrumentParseError, ServerMessage};
pub use socket::{ClientServer, ClientServerError, router};
