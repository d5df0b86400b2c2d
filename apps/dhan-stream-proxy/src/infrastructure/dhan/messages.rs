//! Dhan Feed Request Messages
//!
//! Outbound JSON control messages for the upstream feed.
//!
//! ```json
//! {"RequestCode":15,"InstrumentCount":2,"InstrumentList":[
//!   {"ExchangeSegment":4,"SecurityId":500325},
//!   {"ExchangeSegment":1,"SecurityId":2885}
//! ]}
//! ```

use serde::Serialize;

use crate::domain::streaming::{ExchangeSegment, InstrumentKey};

/// Request code for ticker-only (LTP + LTT) subscriptions.
pub const REQUEST_CODE_TICKER: u8 = 15;

/// One entry in a subscribe request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct InstrumentEntry {
    /// Segment code.
    pub exchange_segment: ExchangeSegment,
    /// Numeric security id.
    pub security_id: u32,
}

/// Subscribe request listing every instrument at once.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct SubscribeRequest {
    /// Request mode.
    pub request_code: u8,
    /// Number of entries in `instrument_list`.
    pub instrument_count: usize,
    /// Instruments to subscribe.
    pub instrument_list: Vec<InstrumentEntry>,
}

impl SubscribeRequest {
    /// Build a ticker subscribe request.
    ///
    /// Keys whose security id is not numeric cannot be expressed on the
    /// wire and are skipped with a warning.
    #[must_use]
    pub fn ticker(keys: &[InstrumentKey]) -> Self {
        let instrument_list: Vec<_> = keys
            .iter()
            .filter_map(|key| {
                let entry = key.security_id_number().map(|security_id| InstrumentEntry {
                    exchange_segment: key.exchange_segment,
                    security_id,
                });
                if entry.is_none() {
                    tracing::warn!(instrument = %key, "Skipping non-numeric security id");
                }
                entry
            })
            .collect();

        Self {
            request_code: REQUEST_CODE_TICKER,
            instrument_count: instrument_list.len(),
            instrument_list,
        }
    }

    /// True if there is nothing to send.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.instrument_list.is_empty()
    }

    /// Serialize to the JSON text frame.
    ///
    /// # Errors
    ///
    /// Returns a serialization error (not expected for this type).
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}
