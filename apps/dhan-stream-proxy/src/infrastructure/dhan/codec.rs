//! Feed Packet Codec
//!
//! Turns raw upstream frames into [`ParsedMessage`] values.
//!
//! # Ticker Packet Layout (17 bytes, little-endian)
//!
//! ```text
//! 0      response code (any value accepted)
//! 1..3   message length (u16, informational)
//! 3      exchange segment
//! 4..8   security id (u32)
//! 8..12  last traded price (f32)
//! 12..16 last traded time (u32, epoch seconds)
//! 16     reserved
//! ```
//!
//! Text frames carry JSON status messages and are passed through opaquely.
//! Decoding performs no I/O; the only side input is the wall clock.

use chrono::Utc;
use rust_decimal::Decimal;

use crate::application::ports::FeedFrame;
use crate::domain::streaming::{ExchangeSegment, ParsedMessage, StatusEvent, TickEvent};

/// Minimum size of a ticker packet.
pub const TICKER_PACKET_LEN: usize = 17;

/// Size of the common packet header.
pub const HEADER_LEN: usize = 8;

/// Decimal places kept on the last traded price.
const LTP_DECIMAL_PLACES: u32 = 2;

/// Protocol decoding errors.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ProtocolError {
    /// Binary frame shorter than the fixed ticker layout.
    #[error("packet too short: {len} bytes (need {TICKER_PACKET_LEN})")]
    PacketTooShort {
        /// Actual frame length.
        len: usize,
    },

    /// Price field is NaN, infinite, or out of decimal range.
    #[error("unrepresentable price: {value}")]
    InvalidPrice {
        /// The raw float read from the packet.
        value: f32,
    },
}

// =============================================================================
// Packet Header
// =============================================================================

/// The first eight bytes common to every binary feed packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    /// Feed response code (2 = ticker).
    pub response_code: u8,
    /// Length field as sent; not cross-checked.
    pub message_length: u16,
    /// Exchange segment.
    pub exchange_segment: ExchangeSegment,
    /// Security id.
    pub security_id: u32,
}

impl PacketHeader {
    /// Parse the header from the start of `bytes`.
    ///
    /// # Errors
    ///
    /// Returns `ProtocolError::PacketTooShort` if fewer than
    /// [`HEADER_LEN`] bytes are available.
    pub fn parse(bytes: &[u8]) -> Result<Self, ProtocolError> {
        if bytes.len() < HEADER_LEN {
            return Err(ProtocolError::PacketTooShort { len: bytes.len() });
        }

        Ok(Self {
            response_code: bytes[0],
            message_length: u16::from_le_bytes([bytes[1], bytes[2]]),
            exchange_segment: ExchangeSegment::new(bytes[3]),
            security_id: read_u32_le(bytes, 4),
        })
    }
}

// =============================================================================
// Decoding
// =============================================================================

/// Decode one frame, stamping ticks with the current wall clock.
///
/// # Errors
///
/// Returns `ProtocolError` for binary frames that cannot be a ticker
/// packet. Text frames never fail: unparseable text is `Ignorable`.
pub fn decode(frame: &FeedFrame) -> Result<ParsedMessage, ProtocolError> {
    decode_at(frame, Utc::now().timestamp_millis())
}

/// Decode one frame with an explicit receive timestamp.
///
/// # Errors
///
/// See [`decode`].
pub fn decode_at(frame: &FeedFrame, received_at_millis: i64) -> Result<ParsedMessage, ProtocolError> {
    match frame {
        FeedFrame::Binary(bytes) => decode_ticker(bytes, received_at_millis).map(ParsedMessage::Tick),
        FeedFrame::Text(text) => Ok(decode_status(text)),
        FeedFrame::Close => Ok(ParsedMessage::Ignorable {
            reason: "close frame".to_string(),
        }),
    }
}

/// Decode a 17-byte ticker packet.
///
/// # Errors
///
/// Returns `PacketTooShort` for fewer than 17 bytes and `InvalidPrice`
/// when the price float has no decimal representation.
pub fn decode_ticker(bytes: &[u8], received_at_millis: i64) -> Result<TickEvent, ProtocolError> {
    if bytes.len() < TICKER_PACKET_LEN {
        return Err(ProtocolError::PacketTooShort { len: bytes.len() });
    }

    let header = PacketHeader::parse(bytes)?;
    let raw_ltp = f32::from_le_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]);
    let ltt = read_u32_le(bytes, 12);

    Ok(TickEvent {
        exchange_segment: header.exchange_segment,
        security_id: header.security_id.to_string(),
        ltp: round_price(raw_ltp)?,
        ltt,
        received_at_millis,
    })
}

fn decode_status(text: &str) -> ParsedMessage {
    match serde_json::from_str::<serde_json::Value>(text) {
        Ok(payload) => ParsedMessage::Status(StatusEvent { payload }),
        Err(e) => ParsedMessage::Ignorable {
            reason: format!("non-JSON text frame: {e}"),
        },
    }
}

/// Round the exact binary value of `value` to two places, half-to-even.
fn round_price(value: f32) -> Result<Decimal, ProtocolError> {
    if !value.is_finite() {
        return Err(ProtocolError::InvalidPrice { value });
    }

    Decimal::from_f32_retain(value)
        .or_else(|| Decimal::try_from(value).ok())
        .map(|d| d.round_dp(LTP_DECIMAL_PLACES))
        .ok_or(ProtocolError::InvalidPrice { value })
}

fn read_u32_le(bytes: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes([
        bytes[offset],
        bytes[offset + 1],
        bytes[offset + 2],
        bytes[offset + 3],
    ])
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use test_case::test_case;

    use super::*;

    fn ticker_packet(segment: u8, security_id: u32, ltp: f32, ltt: u32) -> Vec<u8> {
        let mut packet = Vec::with_capacity(TICKER_PACKET_LEN);
        packet.push(2);
        packet.extend_from_slice(&16u16.to_le_bytes());
        packet.push(segment);
        packet.extend_from_slice(&security_id.to_le_bytes());
        packet.extend_from_slice(&ltp.to_le_bytes());
        packet.extend_from_slice(&ltt.to_le_bytes());
        packet.push(0);
        packet
    }

    #[test]
    fn decodes_known_ticker() {
        let packet = ticker_packet(4, 500_325, 2500.5, 1_700_000_000);
        let frame = FeedFrame::Binary(packet);

        let parsed = decode_at(&frame, 42).unwrap();
        let ParsedMessage::Tick(tick) = parsed else {
            panic!("expected tick, got {parsed:?}");
        };

        assert_eq!(tick.exchange_segment, ExchangeSegment::BSE_EQ);
        assert_eq!(tick.security_id, "500325");
        assert_eq!(tick.ltp, Decimal::new(25005, 1));
        assert_eq!(tick.ltt, 1_700_000_000);
        assert_eq!(tick.received_at_millis, 42);
    }

    #[test_case(0 ; "empty")]
    #[test_case(8 ; "header only")]
    #[test_case(16 ; "one byte short")]
    fn short_packets_are_rejected(len: usize) {
        let packet = ticker_packet(1, 2885, 1.0, 0);
        let err = decode_at(&FeedFrame::Binary(packet[..len].to_vec()), 0).unwrap_err();
        assert_eq!(err, ProtocolError::PacketTooShort { len });
    }

    #[test]
    fn longer_packets_are_accepted() {
        let mut packet = ticker_packet(2, 35_001, 99.0, 5);
        packet.extend_from_slice(&[0xAA; 8]);
        assert!(decode_ticker(&packet, 0).is_ok());
    }

    #[test]
    fn any_response_code_is_accepted() {
        let mut packet = ticker_packet(1, 1333, 10.0, 0);
        packet[0] = 0xFF;
        let tick = decode_ticker(&packet, 0).unwrap();
        assert_eq!(tick.security_id, "1333");
    }

    #[test_case(2500.5, 25005, 1 ; "exact half")]
    #[test_case(101.2345, 10123, 2 ; "rounds down")]
    #[test_case(19.995, 2000, 2 ; "binary value above tie rounds up")]
    #[test_case(1.005, 100, 2 ; "binary value below tie rounds down")]
    #[test_case(0.0, 0, 0 ; "zero")]
    fn ltp_is_rounded_to_two_places(raw: f32, mantissa: i64, scale: u32) {
        let tick = decode_ticker(&ticker_packet(1, 1, raw, 0), 0).unwrap();
        assert_eq!(tick.ltp, Decimal::new(mantissa, scale));
    }

    #[test]
    fn nan_price_is_rejected() {
        let err = decode_ticker(&ticker_packet(1, 1, f32::NAN, 0), 0).unwrap_err();
        assert!(matches!(err, ProtocolError::InvalidPrice { .. }));
    }

    #[test]
    fn header_fields_are_parsed() {
        let packet = ticker_packet(8, 0x0102_0304, 0.0, 0);
        let header = PacketHeader::parse(&packet).unwrap();
        assert_eq!(header.response_code, 2);
        assert_eq!(header.message_length, 16);
        assert_eq!(header.exchange_segment, ExchangeSegment::BSE_FNO);
        assert_eq!(header.security_id, 0x0102_0304);
    }

    #[test]
    fn json_text_becomes_status() {
        let frame = FeedFrame::Text(r#"{"status":"ok","code":200}"#.to_string());
        let parsed = decode_at(&frame, 0).unwrap();
        assert_eq!(
            parsed,
            ParsedMessage::Status(StatusEvent {
                payload: serde_json::json!({"status": "ok", "code": 200}),
            })
        );
    }

    #[test]
    fn malformed_text_is_ignorable() {
        let parsed = decode_at(&FeedFrame::Text("not json {".to_string()), 0).unwrap();
        assert!(matches!(parsed, ParsedMessage::Ignorable { .. }));
    }

    #[test]
    fn decode_stamps_wall_clock() {
        let before = Utc::now().timestamp_millis();
        let parsed = decode(&FeedFrame::Binary(ticker_packet(1, 1, 1.0, 0))).unwrap();
        let after = Utc::now().timestamp_millis();

        let ParsedMessage::Tick(tick) = parsed else {
            panic!("expected tick");
        };
        assert!(tick.received_at_millis >= before && tick.received_at_millis <= after);
    }
}
