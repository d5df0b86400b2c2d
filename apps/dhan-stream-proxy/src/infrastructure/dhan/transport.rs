//! WebSocket Transport
//!
//! `tokio-tungstenite` implementation of the feed connector ports.

use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use crate::application::ports::{FeedConnector, FeedError, FeedFrame, FeedTransport};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Default time allowed for the TCP + TLS + upgrade handshake.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Opens upstream feed connections over WebSocket.
#[derive(Debug, Clone, Copy)]
pub struct WsFeedConnector {
    connect_timeout: Duration,
}

impl Default for WsFeedConnector {
    fn default() -> Self {
        Self::new(DEFAULT_CONNECT_TIMEOUT)
    }
}

impl WsFeedConnector {
    /// Create a connector with the given handshake timeout.
    #[must_use]
    pub const fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

#[async_trait]
impl FeedConnector for WsFeedConnector {
    async fn connect(&self, url: &str) -> Result<Box<dyn FeedTransport>, FeedError> {
        let handshake = tokio_tungstenite::connect_async(url);

        let (stream, _response) = tokio::time::timeout(self.connect_timeout, handshake)
            .await
            .map_err(|_| {
                FeedError::UpstreamUnavailable(format!(
                    "connect timed out after {}s",
                    self.connect_timeout.as_secs()
                ))
            })?
            .map_err(|e| FeedError::UpstreamUnavailable(e.to_string()))?;

        Ok(Box::new(WsFeedTransport { stream }))
    }
}

/// An open upstream WebSocket.
pub struct WsFeedTransport {
    stream: WsStream,
}

#[async_trait]
impl FeedTransport for WsFeedTransport {
    async fn send_text(&mut self, text: String) -> Result<(), FeedError> {
        self.stream
            .send(Message::Text(text.into()))
            .await
            .map_err(|e| FeedError::Transport(e.to_string()))
    }

    async fn next_frame(&mut self) -> Option<Result<FeedFrame, FeedError>> {
        loop {
            match self.stream.next().await? {
                Ok(Message::Binary(data)) => return Some(Ok(FeedFrame::Binary(data.to_vec()))),
                Ok(Message::Text(text)) => {
                    return Some(Ok(FeedFrame::Text(text.as_str().to_owned())));
                }
                Ok(Message::Ping(data)) => {
                    if let Err(e) = self.stream.send(Message::Pong(data)).await {
                        return Some(Err(FeedError::Transport(e.to_string())));
                    }
                }
                Ok(Message::Close(frame)) => {
                    tracing::info!(?frame, "Feed server sent close frame");
                    return Some(Ok(FeedFrame::Close));
                }
                Ok(Message::Pong(_) | Message::Frame(_)) => {}
                Err(e) => return Some(Err(FeedError::Transport(e.to_string()))),
            }
        }
    }

    async fn close(&mut self) {
        if let Err(e) = self.stream.close(None).await {
            tracing::debug!(error = %e, "Error closing feed socket");
        }
    }
}
