//! Port Interfaces
//!
//! Contracts that infrastructure adapters implement, following the
//! Hexagonal Architecture pattern.
//!
//! ## Driven Ports (Outbound)
//!
//! - `FeedConnector` / `FeedTransport`: the upstream market feed socket
//! - `CredentialSource`: account credentials for the upstream feed
//!
//! ## Driver Ports (Inbound)
//!
//! - `SubscriptionSink`: how downstream subscribe requests reach the
//!   upstream connection

use std::fmt;

use async_trait::async_trait;

use crate::domain::streaming::InstrumentKey;

// =============================================================================
// Feed Frames
// =============================================================================

/// A frame read from the upstream feed, with transport details stripped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FeedFrame {
    /// Binary packet (ticker data).
    Binary(Vec<u8>),
    /// Text message (status JSON).
    Text(String),
    /// The server closed the connection.
    Close,
}

// =============================================================================
// Errors
// =============================================================================

/// Errors raised by the upstream feed path.
#[derive(Debug, thiserror::Error)]
pub enum FeedError {
    /// Could not open the upstream connection.
    #[error("upstream unavailable: {0}")]
    UpstreamUnavailable(String),

    /// Transport error on an open connection.
    #[error("transport error: {0}")]
    Transport(String),

    /// Operation requires a live upstream connection.
    #[error("upstream not connected")]
    NotConnected,

    /// Upstream closed the connection.
    #[error("connection closed")]
    ConnectionClosed,

    /// Gave up reconnecting.
    #[error("maximum reconnection attempts ({0}) exceeded")]
    MaxReconnectAttemptsExceeded(u32),

    /// Failed to encode an outbound request.
    #[error("encode error: {0}")]
    Encode(#[from] serde_json::Error),

    /// The feed client is not draining its command queue fast enough.
    #[error("feed command queue full")]
    CommandQueueFull,

    /// The feed client task is gone.
    #[error("feed command channel closed")]
    CommandChannelClosed,
}

/// Errors loading upstream credentials.
#[derive(Debug, thiserror::Error)]
pub enum CredentialsError {
    /// No credentials configured.
    #[error("credentials missing: {0}")]
    Missing(String),

    /// Credential file could not be read.
    #[error("failed to read credentials: {0}")]
    Io(#[from] std::io::Error),

    /// Credential file is not valid JSON.
    #[error("failed to parse credentials: {0}")]
    Parse(#[from] serde_json::Error),
}

// =============================================================================
// Credentials
// =============================================================================

/// Dhan account credentials for the upstream feed.
#[derive(Clone, PartialEq, Eq)]
pub struct FeedCredentials {
    access_token: String,
    client_id: String,
}

impl FeedCredentials {
    /// Create credentials, rejecting empty values.
    ///
    /// # Errors
    ///
    /// Returns `CredentialsError::Missing` if either value is blank.
    pub fn new(
        access_token: impl Into<String>,
        client_id: impl Into<String>,
    ) -> Result<Self, CredentialsError> {
        let access_token = access_token.into();
        let client_id = client_id.into();

        if access_token.trim().is_empty() {
            return Err(CredentialsError::Missing("access token is empty".to_string()));
        }
        if client_id.trim().is_empty() {
            return Err(CredentialsError::Missing("client id is empty".to_string()));
        }

        Ok(Self {
            access_token,
            client_id,
        })
    }

    /// The access token.
    #[must_use]
    pub fn access_token(&self) -> &str {
        &self.access_token
    }

    /// The client identifier.
    #[must_use]
    pub fn client_id(&self) -> &str {
        &self.client_id
    }
}

impl fmt::Debug for FeedCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FeedCredentials")
            .field("access_token", &"[REDACTED]")
            .field("client_id", &"[REDACTED]")
            .finish()
    }
}

// =============================================================================
// Ports
// =============================================================================

/// Opens connections to the upstream feed.
#[async_trait]
pub trait FeedConnector: Send + Sync {
    /// Connect to `url`.
    ///
    /// # Errors
    ///
    /// Returns `FeedError::UpstreamUnavailable` on any transport failure.
    /// Does not retry.
    async fn connect(&self, url: &str) -> Result<Box<dyn FeedTransport>, FeedError>;
}

/// An open upstream connection.
#[async_trait]
pub trait FeedTransport: Send {
    /// Send a text frame.
    ///
    /// # Errors
    ///
    /// Returns `FeedError::Transport` if the write fails.
    async fn send_text(&mut self, text: String) -> Result<(), FeedError>;

    /// Next data frame, or `None` once the stream has ended.
    async fn next_frame(&mut self) -> Option<Result<FeedFrame, FeedError>>;

    /// Close the connection. Errors are swallowed.
    async fn close(&mut self);
}

/// Accepts batched upstream subscribe requests.
#[cfg_attr(test, mockall::automock)]
pub trait SubscriptionSink: Send + Sync {
    /// Ask the upstream feed to start sending `instruments`, all in one
    /// request.
    ///
    /// # Errors
    ///
    /// Returns `FeedError::NotConnected` (or `UpstreamUnavailable`) when
    /// the request cannot be delivered right now. Callers must not assume
    /// delivery.
    fn request_subscription(&self, instruments: Vec<InstrumentKey>) -> Result<(), FeedError>;
}

/// Reads upstream account credentials once at startup.
pub trait CredentialSource: Send + Sync {
    /// Load credentials.
    ///
    /// # Errors
    ///
    /// Returns `CredentialsError` if none are configured or they cannot
    /// be read.
    fn load(&self) -> Result<FeedCredentials, CredentialsError>;
}
