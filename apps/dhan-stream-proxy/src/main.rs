//! Dhan Stream Proxy Binary
//!
//! Starts the market data stream proxy.
//!
//! # Usage
//!
//! ```bash
//! cargo run --bin dhan-stream-proxy
//! ```
//!
//! # Environment Variables
//!
//! ## Credentials
//! - `DHAN_ACCESS_TOKEN`: Dhan access token
//! - `DHAN_CLIENT_ID`: Dhan client id
//! - `STREAM_PROXY_CREDENTIALS_FILE`: JSON file used when the two above are unset
//!
//! Without credentials the proxy still accepts clients but relays no ticks.
//!
//! ## Optional
//! - `STREAM_PROXY_FEED_URL`: Upstream feed URL (default: wss://api-feed.dhan.co)
//! - `STREAM_PROXY_WS_PORT`: Client WebSocket port (default: 8765)
//! - `STREAM_PROXY_HEALTH_PORT`: Health check HTTP port (default: 8082)
//! - `STREAM_PROXY_MAX_RECONNECT_ATTEMPTS`: Reconnects before giving up (default: 50)
//! - `OTEL_ENABLED`: Enable OpenTelemetry export (default: false)
//! - `RUST_LOG`: Log level (default: info)

use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use dhan_stream_proxy::application::ports::{CredentialSource, SubscriptionSink};
use dhan_stream_proxy::infrastructure::credentials::ChainedCredentialSource;
use dhan_stream_proxy::infrastructure::health::{HealthServer, HealthServerState};
use dhan_stream_proxy::infrastructure::telemetry;
use dhan_stream_proxy::{
    ClientHub, ClientManager, ClientServer, FeedClient, FeedClientConfig, FeedEvent, FeedState,
    ProxyConfig, SubscriptionRegistry, UnavailableUpstream, WsFeedConnector, init_metrics,
};
use tokio::signal;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Graceful shutdown timeout.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow!("rustls crypto provider already installed"))?;

    load_dotenv();

    // Initialize telemetry (OpenTelemetry + tracing)
    let _telemetry_guard = telemetry::init();

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "Starting Dhan Stream Proxy");

    if let Err(e) = init_metrics() {
        tracing::warn!(error = %e, "Prometheus recorder not installed");
    }

    let config = ProxyConfig::from_env()?;
    log_config(&config);

    let shutdown_token = CancellationToken::new();
    let registry = Arc::new(SubscriptionRegistry::new());
    let hub = Arc::new(ClientHub::new());
    let (event_tx, event_rx) = mpsc::channel::<FeedEvent>(config.feed.event_capacity);

    // Start the upstream feed, or run without one if credentials are missing
    let credentials = ChainedCredentialSource::standard(config.credentials_file.as_deref()).load();
    let (upstream, feed_state, feed_task) = match credentials {
        Ok(credentials) => {
            let connector = Arc::new(WsFeedConnector::new(config.feed.connect_timeout));
            let (client, handle) = FeedClient::new(
                FeedClientConfig::from_settings(&config.feed, credentials),
                connector,
                Arc::clone(&registry),
                event_tx,
                shutdown_token.clone(),
            );
            let state = handle.state();

            let feed_task = tokio::spawn(async move {
                if let Err(e) = client.run().await {
                    tracing::error!(error = %e, "Feed client stopped");
                }
            });

            let upstream: Arc<dyn SubscriptionSink> = Arc::new(handle);
            (upstream, state, Some(feed_task))
        }
        Err(e) => {
            tracing::error!(
                error = %e,
                "Dhan credentials unavailable, serving clients without an upstream feed"
            );
            drop(event_tx);
            let state = Arc::new(FeedState::new());
            state.mark_unavailable(e.to_string());
            let upstream: Arc<dyn SubscriptionSink> =
                Arc::new(UnavailableUpstream::new(e.to_string()));
            (upstream, state, None)
        }
    };

    let manager = Arc::new(ClientManager::new(
        Arc::clone(&hub),
        Arc::clone(&registry),
        upstream,
    ));

    // Relay feed events to clients
    tokio::spawn(Arc::clone(&manager).relay_feed_events(event_rx, shutdown_token.clone()));

    // Spawn health server
    let health_state = Arc::new(HealthServerState::new(
        env!("CARGO_PKG_VERSION").to_string(),
        feed_state,
        hub,
        registry,
    ));
    let health_server = HealthServer::new(
        config.server.health_port,
        health_state,
        shutdown_token.clone(),
    );
    tokio::spawn(async move {
        if let Err(e) = health_server.run().await {
            tracing::error!(error = %e, "Health server error");
        }
    });

    // Spawn client WebSocket server
    let client_server = ClientServer::new(
        config.server.ws_port,
        Arc::clone(&manager),
        config.clients.clone(),
        shutdown_token.clone(),
    );
    let server_shutdown = shutdown_token.clone();
    let server_task = tokio::spawn(async move {
        if let Err(e) = client_server.run().await {
            tracing::error!(error = %e, "Client server error");
            server_shutdown.cancel();
        }
    });

    tracing::info!("Stream proxy ready");

    await_shutdown(shutdown_token).await;

    let closed = manager.close_all();
    tracing::info!(closed, "Closed client connections");

    if tokio::time::timeout(SHUTDOWN_TIMEOUT, server_task).await.is_err() {
        tracing::warn!("Client server did not stop before the shutdown timeout");
    }

    // The feed client closes its upstream socket on cancellation
    if let Some(feed_task) = feed_task
        && tokio::time::timeout(SHUTDOWN_TIMEOUT, feed_task).await.is_err()
    {
        tracing::warn!("Feed client did not stop before the shutdown timeout");
    }

    tracing::info!("Stream proxy stopped");
    Ok(())
}

/// Load .env file from current or ancestor directories.
fn load_dotenv() {
    if dotenvy::dotenv().is_err() {
        load_dotenv_from_ancestors();
    }
}

/// Log the parsed configuration.
fn log_config(config: &ProxyConfig) {
    tracing::info!(
        ws_port = config.server.ws_port,
        health_port = config.server.health_port,
        max_reconnect_attempts = config.feed.max_reconnect_attempts,
        client_buffer = config.clients.buffer,
        "Configuration loaded"
    );
    tracing::debug!(
        feed_url = %config.feed.url,
        credentials_file = ?config.credentials_file,
        "Upstream endpoint"
    );
}

/// Load .env file from any ancestor directory.
fn load_dotenv_from_ancestors() {
    if let Ok(cwd) = std::env::current_dir() {
        let mut dir = cwd.as_path();
        while let Some(parent) = dir.parent() {
            let env_path = parent.join(".env");
            if env_path.exists() {
                let _ = dotenvy::from_path(&env_path);
                return;
            }
            dir = parent;
        }
    }
}

/// Wait for shutdown signal (SIGTERM or SIGINT) or an internal cancel.
#[allow(clippy::expect_used)]
async fn await_shutdown(shutdown_token: CancellationToken) {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("signal handler installation is critical for graceful shutdown");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("SIGTERM handler installation is critical for graceful shutdown")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating shutdown");
        }
        () = terminate => {
            tracing::info!("Received SIGTERM, initiating shutdown");
        }
        () = shutdown_token.cancelled() => {
            tracing::warn!("Internal shutdown requested");
        }
    }

    shutdown_token.cancel();

    tracing::info!(
        timeout_secs = SHUTDOWN_TIMEOUT.as_secs(),
        "Graceful shutdown started"
    );
}
