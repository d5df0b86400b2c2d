//! Downstream WebSocket Server
//!
//! axum endpoint that accepts client sockets and bridges them to the
//! [`ClientManager`]. Each socket gets a reader loop (this task) and a
//! writer task draining the client's bounded queue.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::body::Bytes;
use axum::extract::State;
use axum::extract::ws::{CloseFrame, Message, Utf8Bytes, WebSocket, WebSocketUpgrade, close_code};
use axum::response::Response;
use axum::routing::get;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::domain::subscription::ClientId;
use crate::infrastructure::broadcast::Outbound;
use crate::infrastructure::config::ClientSettings;

use super::manager::ClientManager;

/// How long a closing socket gets to flush its queue.
const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Errors from the client server.
#[derive(Debug, thiserror::Error)]
pub enum ClientServerError {
    /// Failed to bind the listen port.
    #[error("failed to bind to port {0}: {1}")]
    BindFailed(u16, String),

    /// Server error while running.
    #[error("client server error: {0}")]
    ServerFailed(String),
}

#[derive(Clone)]
struct SocketState {
    manager: Arc<ClientManager>,
    settings: ClientSettings,
    cancel: CancellationToken,
}

/// Build the client router: the WebSocket endpoint on `/` and `/ws`.
pub fn router(
    manager: Arc<ClientManager>,
    settings: ClientSettings,
    cancel: CancellationToken,
) -> Router {
    let state = SocketState {
        manager,
        settings,
        cancel,
    };

    Router::new()
        .route("/", get(ws_handler))
        .route("/ws", get(ws_handler))
        .with_state(state)
}

/// Downstream WebSocket server.
pub struct ClientServer {
    port: u16,
    manager: Arc<ClientManager>,
    settings: ClientSettings,
    cancel: CancellationToken,
}

impl ClientServer {
    /// Create a new client server.
    #[must_use]
    pub const fn new(
        port: u16,
        manager: Arc<ClientManager>,
        settings: ClientSettings,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            port,
            manager,
            settings,
            cancel,
        }
    }

    /// Bind the configured port and serve until cancelled.
    ///
    /// # Errors
    ///
    /// Returns `ClientServerError` if binding fails or the server stops
    /// with an error.
    pub async fn run(self) -> Result<(), ClientServerError> {
        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| ClientServerError::BindFailed(self.port, e.to_string()))?;

        self.serve(listener).await
    }

    /// Serve on an already bound listener until cancelled.
    ///
    /// # Errors
    ///
    /// Returns `ClientServerError::ServerFailed` if the server stops with
    /// an error.
    pub async fn serve(self, listener: TcpListener) -> Result<(), ClientServerError> {
        let local = listener.local_addr().ok();
        tracing::info!(addr = ?local, "Client WebSocket server listening");

        let app = router(self.manager, self.settings, self.cancel.clone());

        axum::serve(listener, app)
            .with_graceful_shutdown(self.cancel.cancelled_owned())
            .await
            .map_err(|e| ClientServerError::ServerFailed(e.to_string()))?;

        tracing::info!("Client WebSocket server stopped");
        Ok(())
    }
}

// =============================================================================
// Socket Handling
// =============================================================================

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<SocketState>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: SocketState) {
    let (sink, mut stream) = socket.split();
    let (tx, rx) = mpsc::channel(state.settings.buffer);

    let client = state.manager.on_client_connected(tx);
    let client_id = client.id();
    let mut writer = tokio::spawn(write_loop(sink, rx, client_id));
    let mut writer_done = false;

    let mut ping = tokio::time::interval(state.settings.ping_interval);
    ping.tick().await;

    loop {
        tokio::select! {
            () = state.cancel.cancelled() => break,
            () = client.closed() => break,
            _ = &mut writer => {
                writer_done = true;
                break;
            }
            _ = ping.tick() => {
                if let Err(e) = client.ping() {
                    tracing::debug!(client_id, error = %e, "Keepalive failed");
                    break;
                }
            }
            frame = stream.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    state.manager.on_client_message(&client, text.as_str());
                }
                Some(Ok(Message::Binary(data))) => match std::str::from_utf8(&data) {
                    Ok(text) => state.manager.on_client_message(&client, text),
                    Err(e) => tracing::warn!(client_id, error = %e, "Ignoring non-UTF-8 binary frame"),
                },
                Some(Ok(Message::Ping(_) | Message::Pong(_))) => {}
                Some(Ok(Message::Close(_))) | None => break,
                Some(Err(e)) => {
                    tracing::debug!(client_id, error = %e, "Client socket error");
                    break;
                }
            },
        }
    }

    state.manager.on_client_disconnected(client_id);
    client.close();
    drop(client);

    if !writer_done && tokio::time::timeout(WRITER_DRAIN_TIMEOUT, &mut writer).await.is_err() {
        writer.abort();
    }
}

async fn write_loop(
    mut sink: SplitSink<WebSocket, Message>,
    mut rx: mpsc::Receiver<Outbound>,
    client_id: ClientId,
) {
    while let Some(outbound) = rx.recv().await {
        let (message, last) = match outbound {
            Outbound::Text(text) => (Message::Text(text), false),
            Outbound::Ping => (Message::Ping(Bytes::new()), false),
            Outbound::Close => (
                Message::Close(Some(CloseFrame {
                    code: close_code::NORMAL,
                    reason: Utf8Bytes::from_static("server closing"),
                })),
                true,
            ),
        };

        if let Err(e) = sink.send(message).await {
            tracing::debug!(client_id, error = %e, "Client write failed");
            break;
        }
        if last {
            break;
        }
    }
}
