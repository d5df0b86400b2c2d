//! Dhan Feed Authentication
//!
//! The feed authenticates in the connection URL itself; there is no
//! handshake message after connect.
//!
//! ```text
//! wss://api-feed.dhan.co?version=2&token=<access token>&clientId=<client id>&authType=2
//! ```

use crate::application::ports::FeedCredentials;

/// Feed protocol version.
pub const FEED_VERSION: u8 = 2;

/// Auth type for access-token authentication.
pub const AUTH_TYPE: u8 = 2;

/// Build the authenticated feed URL from a base URL.
///
/// Existing query parameters on `base` are preserved.
#[must_use]
pub fn authenticated_url(base: &str, credentials: &FeedCredentials) -> String {
    let separator = if base.contains('?') { '&' } else { '?' };
    format!(
        "{base}{separator}version={FEED_VERSION}&token={}&clientId={}&authType={AUTH_TYPE}",
        credentials.access_token(),
        credentials.client_id()
    )
}

/// The URL with the token masked, for logs.
#[must_use]
pub fn redacted_url(base: &str, credentials: &FeedCredentials) -> String {
    authenticated_url(base, credentials).replace(credentials.access_token(), "[REDACTED]")
}
