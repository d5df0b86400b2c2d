//! Dhan Market Feed Adapters
//!
//! Implements the upstream side of the gateway:
//!
//! - **codec**: 17-byte ticker packets and JSON status frames
//! - **messages**: outbound subscribe requests
//! - **auth**: authenticated feed URL
//! - **reconnect**: linear backoff policy
//! - **transport**: `tokio-tungstenite` connector
//! - **feed**: connection state machine and subscribe command path

pub mod auth;
pub mod codec;
pub mod feed;
pub mod messages;
pub mod reconnect;
pub mod transport;

pub use auth::{authenticated_url, redacted_url};
pub use codec::{PacketHeader, ProtocolError, TICKER_PACKET_LEN, decode, decode_at};
pub use feed::{
    FeedClient, FeedClientConfig, FeedEvent, FeedHandle, FeedState, UnavailableUpstream,
};
pub use messages::{REQUEST_CODE_TICKER, SubscribeRequest};
pub use reconnect::{ReconnectConfig, ReconnectPolicy};
pub use transport::{WsFeedConnector, WsFeedTransport};
