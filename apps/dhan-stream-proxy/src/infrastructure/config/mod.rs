//! Configuration Module
//!
//! Configuration loading for the proxy service.

mod settings;

pub use settings::{
    ClientSettings, ConfigError, DEFAULT_FEED_URL, FeedSettings, ProxyConfig, ServerSettings,
};
