//! Market Data Streaming Types
//!
//! Value types shared by the feed decoder, the subscription registry and
//! the downstream broadcaster. Everything here is plain data: created per
//! message, cloned freely, never persisted.

use std::fmt;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

// =============================================================================
// Exchange Segment
// =============================================================================

/// Dhan exchange segment code carried in byte 3 of every feed packet.
///
/// Unknown codes are valid: the feed may add segments and the gateway
/// passes them through untouched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExchangeSegment(u8);

impl ExchangeSegment {
    /// Index values.
    pub const IDX_I: Self = Self(0);
    /// NSE cash equity.
    pub const NSE_EQ: Self = Self(1);
    /// NSE futures and options.
    pub const NSE_FNO: Self = Self(2);
    /// NSE currency derivatives.
    pub const NSE_CURRENCY: Self = Self(3);
    /// BSE cash equity.
    pub const BSE_EQ: Self = Self(4);
    /// MCX commodities.
    pub const MCX_COMM: Self = Self(5);
    /// BSE currency derivatives.
    pub const BSE_CURRENCY: Self = Self(7);
    /// BSE futures and options.
    pub const BSE_FNO: Self = Self(8);

    const NAMED: [(Self, &'static str); 8] = [
        (Self::IDX_I, "IDX_I"),
        (Self::NSE_EQ, "NSE_EQ"),
        (Self::NSE_FNO, "NSE_FNO"),
        (Self::NSE_CURRENCY, "NSE_CURRENCY"),
        (Self::BSE_EQ, "BSE_EQ"),
        (Self::MCX_COMM, "MCX_COMM"),
        (Self::BSE_CURRENCY, "BSE_CURRENCY"),
        (Self::BSE_FNO, "BSE_FNO"),
    ];

    /// Wrap a raw segment code.
    #[must_use]
    pub const fn new(code: u8) -> Self {
        Self(code)
    }

    /// The numeric code sent on the wire.
    #[must_use]
    pub const fn code(self) -> u8 {
        self.0
    }

    /// Look up a segment by its Dhan name (`"BSE_EQ"`), case-insensitive.
    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        Self::NAMED
            .iter()
            .find(|(_, n)| n.eq_ignore_ascii_case(name.trim()))
            .map(|(segment, _)| *segment)
    }

    /// The Dhan name for this segment, if it is a known one.
    #[must_use]
    pub fn name(self) -> Option<&'static str> {
        Self::NAMED
            .iter()
            .find(|(segment, _)| *segment == self)
            .map(|(_, n)| *n)
    }
}

impl fmt::Display for ExchangeSegment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.name() {
            Some(name) => f.write_str(name),
            None => write!(f, "SEGMENT_{}", self.0),
        }
    }
}

// =============================================================================
// Instrument Key
// =============================================================================

/// Identity of one tradable instrument: `(exchange segment, security id)`.
///
/// The security id is kept in its canonical decimal string form so that a
/// key built from a client request and one built from a decoded packet
/// compare equal.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstrumentKey {
    /// Exchange segment.
    pub exchange_segment: ExchangeSegment,
    /// Security id as a decimal string.
    pub security_id: String,
}

impl InstrumentKey {
    /// Create a new instrument key.
    #[must_use]
    pub fn new(exchange_segment: ExchangeSegment, security_id: impl Into<String>) -> Self {
        Self {
            exchange_segment,
            security_id: security_id.into(),
        }
    }

    /// The security id as the integer the upstream feed expects.
    ///
    /// Returns `None` when the id is not a valid unsigned 32-bit number.
    #[must_use]
    pub fn security_id_number(&self) -> Option<u32> {
        self.security_id.parse().ok()
    }
}

impl fmt::Display for InstrumentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.exchange_segment.code(), self.security_id)
    }
}

// =============================================================================
// Feed Events
// =============================================================================

/// One last-traded-price update decoded from a ticker packet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TickEvent {
    /// Exchange segment of the instrument.
    pub exchange_segment: ExchangeSegment,
    /// Security id of the instrument.
    pub security_id: String,
    /// Last traded price, rounded to two decimal places.
    #[serde(with = "rust_decimal::serde::float")]
    pub ltp: Decimal,
    /// Last traded time (epoch seconds, as sent by the feed).
    pub ltt: u32,
    /// Wall clock at decode time, in milliseconds.
    #[serde(rename = "timestamp")]
    pub received_at_millis: i64,
}

impl TickEvent {
    /// The instrument this tick belongs to.
    #[must_use]
    pub fn instrument(&self) -> InstrumentKey {
        InstrumentKey::new(self.exchange_segment, self.security_id.clone())
    }
}

/// Opaque status payload relayed from the upstream feed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusEvent {
    /// The parsed JSON payload.
    pub payload: serde_json::Value,
}

/// Result of decoding one upstream frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParsedMessage {
    /// A ticker update.
    Tick(TickEvent),
    /// A status message to forward verbatim.
    Status(StatusEvent),
    /// Nothing to forward; the reason is only logged.
    Ignorable {
        /// Why the frame was ignored.
        reason: String,
    },
}

// =============================================================================
// Connection State
// =============================================================================

/// Upstream connection state, owned by the feed client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    /// Not connected (initial, after shutdown, or after giving up).
    #[default]
    Disconnected,
    /// First connection attempt in progress.
    Connecting,
    /// Connected and receiving.
    Connected,
    /// Waiting out a backoff or retrying a failed connection.
    Reconnecting,
}

impl ConnectionState {
    /// Lowercase name for logs and health output.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Reconnecting => "reconnecting",
        }
    }
}
