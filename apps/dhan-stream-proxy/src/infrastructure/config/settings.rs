//! Proxy Configuration Settings
//!
//! Configuration types for the stream proxy, loaded from environment variables.

use std::path::PathBuf;
use std::time::Duration;

/// Default upstream feed endpoint.
pub const DEFAULT_FEED_URL: &str = "wss://api-feed.dhan.co";

/// Upstream feed connection settings.
#[derive(Debug, Clone)]
pub struct FeedSettings {
    /// Feed WebSocket URL, without credentials.
    pub url: String,
    /// Receive silence after which a liveness warning is logged.
    pub stall_timeout: Duration,
    /// Handshake timeout for one connect attempt.
    pub connect_timeout: Duration,
    /// Backoff step: attempt `n` waits `n * step`.
    pub reconnect_step: Duration,
    /// Backoff cap.
    pub reconnect_delay_max: Duration,
    /// Reconnection attempts before giving up (0 = unlimited).
    pub max_reconnect_attempts: u32,
    /// Capacity of the feed event channel.
    pub event_capacity: usize,
}

impl Default for FeedSettings {
    fn default() -> Self {
        Self {
            url: DEFAULT_FEED_URL.to_string(),
            stall_timeout: Duration::from_secs(60),
            connect_timeout: Duration::from_secs(10),
            reconnect_step: Duration::from_secs(5),
            reconnect_delay_max: Duration::from_secs(60),
            max_reconnect_attempts: 50,
            event_capacity: 4096,
        }
    }
}

/// Downstream client settings.
#[derive(Debug, Clone)]
pub struct ClientSettings {
    /// Outbound queue length per client.
    pub buffer: usize,
    /// Interval between keepalive pings.
    pub ping_interval: Duration,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            buffer: 1024,
            ping_interval: Duration::from_secs(20),
        }
    }
}

/// Server port settings.
#[derive(Debug, Clone)]
pub struct ServerSettings {
    /// Client WebSocket port.
    pub ws_port: u16,
    /// Health check HTTP port.
    pub health_port: u16,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            ws_port: 8765,
            health_port: 8082,
        }
    }
}

/// Complete proxy configuration.
#[derive(Debug, Clone, Default)]
pub struct ProxyConfig {
    /// Upstream feed settings.
    pub feed: FeedSettings,
    /// Downstream client settings.
    pub clients: ClientSettings,
    /// Server port settings.
    pub server: ServerSettings,
    /// JSON credentials file, used when the environment has none.
    pub credentials_file: Option<PathBuf>,
}

impl ProxyConfig {
    /// Create configuration from environment variables.
    ///
    /// Unset or unparseable numeric values fall back to their defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if the feed URL is empty or not a WebSocket URL.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Create configuration from an arbitrary key lookup.
    ///
    /// # Errors
    ///
    /// Same as [`Self::from_env`].
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let url = lookup("STREAM_PROXY_FEED_URL").unwrap_or(defaults.feed.url);
        validate_feed_url(&url)?;

        let feed = FeedSettings {
            url,
            stall_timeout: parse_nonzero_secs(
                &lookup,
                "STREAM_PROXY_STALL_TIMEOUT_SECS",
                defaults.feed.stall_timeout,
            ),
            connect_timeout: parse_nonzero_secs(
                &lookup,
                "STREAM_PROXY_CONNECT_TIMEOUT_SECS",
                defaults.feed.connect_timeout,
            ),
            reconnect_step: parse_nonzero_secs(
                &lookup,
                "STREAM_PROXY_RECONNECT_STEP_SECS",
                defaults.feed.reconnect_step,
            ),
            reconnect_delay_max: parse_nonzero_secs(
                &lookup,
                "STREAM_PROXY_RECONNECT_DELAY_MAX_SECS",
                defaults.feed.reconnect_delay_max,
            ),
            max_reconnect_attempts: parse_or(
                &lookup,
                "STREAM_PROXY_MAX_RECONNECT_ATTEMPTS",
                defaults.feed.max_reconnect_attempts,
            ),
            event_capacity: parse_nonzero(
                &lookup,
                "STREAM_PROXY_FEED_EVENT_CAPACITY",
                defaults.feed.event_capacity,
            ),
        };

        let clients = ClientSettings {
            buffer: parse_nonzero(&lookup, "STREAM_PROXY_CLIENT_BUFFER", defaults.clients.buffer),
            ping_interval: parse_nonzero_secs(
                &lookup,
                "STREAM_PROXY_CLIENT_PING_INTERVAL_SECS",
                defaults.clients.ping_interval,
            ),
        };

        let server = ServerSettings {
            ws_port: parse_or(&lookup, "STREAM_PROXY_WS_PORT", defaults.server.ws_port),
            health_port: parse_or(&lookup, "STREAM_PROXY_HEALTH_PORT", defaults.server.health_port),
        };

        let credentials_file = lookup("STREAM_PROXY_CREDENTIALS_FILE")
            .filter(|path| !path.trim().is_empty())
            .map(PathBuf::from);

        Ok(Self {
            feed,
            clients,
            server,
            credentials_file,
        })
    }
}

/// Configuration error.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Environment variable has empty value.
    #[error("environment variable {0} cannot be empty")]
    EmptyValue(String),
    /// Feed URL is not a WebSocket URL.
    #[error("invalid feed url {0:?}: expected ws:// or wss://")]
    InvalidUrl(String),
}

fn validate_feed_url(url: &str) -> Result<(), ConfigError> {
    let trimmed = url.trim();
    if trimmed.is_empty() {
        return Err(ConfigError::EmptyValue("STREAM_PROXY_FEED_URL".to_string()));
    }
    if !(trimmed.starts_with("wss://") || trimmed.starts_with("ws://")) {
        return Err(ConfigError::InvalidUrl(url.to_string()));
    }
    Ok(())
}

fn parse_or<F, T>(lookup: &F, key: &str, default: T) -> T
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
{
    lookup(key)
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

fn parse_nonzero<F>(lookup: &F, key: &str, default: usize) -> usize
where
    F: Fn(&str) -> Option<String>,
{
    match parse_or(lookup, key, default) {
        0 => default,
        n => n,
    }
}

/// Whole seconds. Zero falls back to the default.
fn parse_nonzero_secs<F>(lookup: &F, key: &str, default: Duration) -> Duration
where
    F: Fn(&str) -> Option<String>,
{
    lookup(key)
        .and_then(|v| v.trim().parse::<u64>().ok())
        .filter(|secs| *secs > 0)
        .map_or(default, Duration::from_secs)
}
