//! Client Wire Protocol
//!
//! JSON control messages exchanged with downstream clients. Every frame is
//! an object tagged by `"type"`.

use axum::extract::ws::Utf8Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::domain::streaming::{ExchangeSegment, InstrumentKey, TickEvent};

/// Status text sent to every client right after it connects.
pub const CONNECTED_MESSAGE: &str = "Connected to price feed";

// =============================================================================
// Client -> Server
// =============================================================================

/// Control message sent by a client.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Register interest in a list of instruments.
    Subscribe {
        /// Raw instrument entries, validated one by one.
        #[serde(default)]
        instruments: Vec<Value>,
    },
    /// Application-level keepalive.
    Ping,
}

impl ClientMessage {
    /// Parse one text frame.
    ///
    /// # Errors
    ///
    /// Returns the serde error for non-JSON input, a missing or unknown
    /// `type`, or a wrongly shaped body.
    pub fn parse(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }
}

/// Why an instrument entry was skipped.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum InstrumentParseError {
    /// Entry is not an object with the two expected fields.
    #[error("malformed instrument entry: {0}")]
    Malformed(String),
    /// Segment is neither a code nor a known name.
    #[error("unknown exchange segment: {0}")]
    UnknownSegment(String),
    /// Security id is not an unsigned integer.
    #[error("invalid security id: {0}")]
    InvalidSecurityId(String),
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum SegmentField {
    Code(u8),
    Text(String),
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum SecurityIdField {
    Number(u32),
    Text(String),
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InstrumentRequest {
    exchange_segment: SegmentField,
    security_id: SecurityIdField,
}

/// Turn one `{exchangeSegment, securityId}` entry into an instrument key.
///
/// The segment may be a code (`4`, `"4"`) or a name (`"BSE_EQ"`). The
/// security id may be a number or a string and is canonicalised to its
/// decimal form, so `"0500325"` and `500325` name the same instrument.
///
/// # Errors
///
/// Returns `InstrumentParseError` describing the first bad field.
pub fn parse_instrument(value: &Value) -> Result<InstrumentKey, InstrumentParseError> {
    let request = InstrumentRequest::deserialize(value)
        .map_err(|e| InstrumentParseError::Malformed(e.to_string()))?;

    let segment = match request.exchange_segment {
        SegmentField::Code(code) => ExchangeSegment::new(code),
        SegmentField::Text(text) => ExchangeSegment::from_name(&text)
            .or_else(|| text.trim().parse().ok().map(ExchangeSegment::new))
            .ok_or(InstrumentParseError::UnknownSegment(text))?,
    };

    let security_id = match request.security_id {
        SecurityIdField::Number(id) => id,
        SecurityIdField::Text(text) => text
            .trim()
            .parse::<u32>()
            .map_err(|_| InstrumentParseError::InvalidSecurityId(text))?,
    };

    Ok(InstrumentKey::new(segment, security_id.to_string()))
}

/// Parse every entry, skipping (and logging) the ones that do not parse.
#[must_use]
pub fn parse_instruments(values: &[Value]) -> Vec<InstrumentKey> {
    values
        .iter()
        .filter_map(|value| match parse_instrument(value) {
            Ok(key) => Some(key),
            Err(e) => {
                tracing::warn!(error = %e, "Skipping instrument entry");
                None
            }
        })
        .collect()
}

// =============================================================================
// Server -> Client
// =============================================================================

/// Message sent to clients.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Connection acknowledgment or relayed upstream status.
    Status {
        /// Text or opaque upstream payload.
        message: Value,
    },
    /// Subscribe acknowledgment.
    Subscribed {
        /// Number of instruments listed in the request.
        count: usize,
    },
    /// Reply to a client ping.
    Pong,
    /// Last-traded-price update.
    Ticker(TickEvent),
}

impl ServerMessage {
    /// The greeting every client gets on connect.
    #[must_use]
    pub fn connected() -> Self {
        Self::Status {
            message: Value::String(CONNECTED_MESSAGE.to_string()),
        }
    }

    /// Serialize to a text frame payload.
    ///
    /// # Errors
    ///
    /// Returns the serde error if the payload cannot be encoded.
    pub fn to_payload(&self) -> Result<Utf8Bytes, serde_json::Error> {
        serde_json::to_string(self).map(Utf8Bytes::from)
    }
}

#[cfg(test)]
mod tests {
    use rust_decimal::Decimal;
    use serde_json::json;
    use test_case::test_case;

    use super::*;

    #[test]
    fn parses_subscribe() {
        let msg = ClientMessage::parse(
            r#"{"type":"subscribe","instruments":[{"exchangeSegment":4,"securityId":"500325"}]}"#,
        )
        .unwrap();

        let ClientMessage::Subscribe { instruments } = msg else {
            panic!("expected subscribe");
        };
        assert_eq!(instruments.len(), 1);
    }

    #[test]
    fn subscribe_without_instruments_is_empty() {
        let msg = ClientMessage::parse(r#"{"type":"subscribe"}"#).unwrap();
        assert_eq!(msg, ClientMessage::Subscribe { instruments: vec![] });
    }

    #[test]
    fn parses_ping() {
        assert_eq!(ClientMessage::parse(r#"{"type":"ping"}"#).unwrap(), ClientMessage::Ping);
    }

    #[test_case("not json" ; "garbage")]
    #[test_case(r#"{"type":"unsubscribe"}"# ; "unknown type")]
    #[test_case(r#"{"instruments":[]}"# ; "missing type")]
    #[test_case(r#"{"type":"subscribe","instruments":"x"}"# ; "wrong shape")]
    fn rejects_bad_messages(raw: &str) {
        assert!(ClientMessage::parse(raw).is_err());
    }

    #[test_case(json!({"exchangeSegment": 4, "securityId": "500325"}), 4, "500325" ; "code and string")]
    #[test_case(json!({"exchangeSegment": "BSE_EQ", "securityId": 500325}), 4, "500325" ; "name and number")]
    #[test_case(json!({"exchangeSegment": "nse_eq", "securityId": "2885"}), 1, "2885" ; "lowercase name")]
    #[test_case(json!({"exchangeSegment": "2", "securityId": " 42 "}), 2, "42" ; "numeric strings")]
    #[test_case(json!({"exchangeSegment": 4, "securityId": "0500325"}), 4, "500325" ; "leading zero")]
    fn parses_instrument_entries(value: Value, segment: u8, id: &str) {
        let key = parse_instrument(&value).unwrap();
        assert_eq!(key, InstrumentKey::new(ExchangeSegment::new(segment), id));
    }

    #[test]
    fn rejects_bad_instrument_entries() {
        assert!(matches!(
            parse_instrument(&json!({"exchangeSegment": "NYSE", "securityId": "1"})),
            Err(InstrumentParseError::UnknownSegment(_))
        ));
        assert!(matches!(
            parse_instrument(&json!({"exchangeSegment": 4, "securityId": "RELIANCE"})),
            Err(InstrumentParseError::InvalidSecurityId(_))
        ));
        assert!(matches!(
            parse_instrument(&json!({"securityId": "1"})),
            Err(InstrumentParseError::Malformed(_))
        ));
    }

    #[test]
    fn parse_instruments_skips_bad_entries() {
        let values = vec![
            json!({"exchangeSegment": 4, "securityId": "500325"}),
            json!("junk"),
            json!({"exchangeSegment": 1, "securityId": 2885}),
        ];

        let keys = parse_instruments(&values);
        assert_eq!(keys.len(), 2);
    }

    #[test]
    fn server_messages_use_wire_shape() {
        let value = |m: ServerMessage| -> Value {
            serde_json::from_str(m.to_payload().unwrap().as_str()).unwrap()
        };

        assert_eq!(
            value(ServerMessage::connected()),
            json!({"type": "status", "message": "Connected to price feed"})
        );
        assert_eq!(
            value(ServerMessage::Subscribed { count: 3 }),
            json!({"type": "subscribed", "count": 3})
        );
        assert_eq!(value(ServerMessage::Pong), json!({"type": "pong"}));
        assert_eq!(
            value(ServerMessage::Status { message: json!({"code": 200}) }),
            json!({"type": "status", "message": {"code": 200}})
        );
    }

    #[test]
    fn ticker_is_flattened_under_type() {
        let tick = TickEvent {
            exchange_segment: ExchangeSegment::BSE_EQ,
            security_id: "500325".to_string(),
            ltp: Decimal::new(25005, 1),
            ltt: 1_700_000_000,
            received_at_millis: 1_700_000_000_123,
        };

        let payload = ServerMessage::Ticker(tick).to_payload().unwrap();
        let value: Value = serde_json::from_str(payload.as_str()).unwrap();

        assert_eq!(
            value,
            json!({
                "type": "ticker",
                "exchangeSegment": 4,
                "securityId": "500325",
                "ltp": 2500.5,
                "ltt": 1_700_000_000u32,
                "timestamp": 1_700_000_000_123i64,
            })
        );
    }
}
