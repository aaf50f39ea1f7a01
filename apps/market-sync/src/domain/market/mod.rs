//! Instrument Price Records
//!
//! The validated record type shared by the snapshot endpoint and the delta
//! topic. Payloads are parsed and checked here, at the boundary, so nothing
//! partially typed reaches the canonical table.
//!
//! # Wire Format (JSON)
//!
//! ```json
//! [
//!   {"id": "BTC-KRW", "price": 100, "volume": 12.5, "change": 0.01, "timestamp": 1700000000000},
//!   {"market": "ETH-KRW", "tradePrice": 5}
//! ]
//! ```
//!
//! A single object is accepted as a one-element batch.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Market / instrument code, unique key of the price table.
pub type InstrumentId = String;

// =============================================================================
// Price Record
// =============================================================================

/// Latest known price information for one instrument.
///
/// Records are immutable once received; a newer record for the same
/// identifier replaces the older one wholesale.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PriceRecord {
    /// Instrument identifier (e.g. `BTC-KRW`).
    #[serde(alias = "market", alias = "code")]
    pub id: InstrumentId,

    /// Last traded value.
    #[serde(alias = "tradePrice", alias = "trade_price")]
    pub price: Decimal,

    /// Traded volume, if reported.
    #[serde(
        default,
        alias = "accTradeVolume24h",
        skip_serializing_if = "Option::is_none"
    )]
    pub volume: Option<Decimal>,

    /// Change versus the reference price, if reported.
    #[serde(
        default,
        alias = "signedChangeRate",
        skip_serializing_if = "Option::is_none"
    )]
    pub change: Option<Decimal>,

    /// Exchange-side event time (epoch milliseconds on the wire).
    #[serde(
        default,
        with = "chrono::serde::ts_milliseconds_option",
        skip_serializing_if = "Option::is_none"
    )]
    pub timestamp: Option<DateTime<Utc>>,

    /// Upstream source the record came from, when several are merged.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
}

impl PriceRecord {
    /// Create a record with only the identifier and price set.
    #[must_use]
    pub fn new(id: impl Into<InstrumentId>, price: Decimal) -> Self {
        Self {
            id: id.into(),
            price,
            volume: None,
            change: None,
            timestamp: None,
            source: None,
        }
    }

    /// Set the exchange-side timestamp.
    #[must_use]
    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    /// Check the invariants a record must satisfy before it may enter the table.
    ///
    /// # Errors
    ///
    /// Returns `RecordError` if the identifier is blank or the price is negative.
    pub fn validate(&self) -> Result<(), RecordError> {
        if self.id.trim().is_empty() {
            return Err(RecordError::EmptyId);
        }
        if self.price.is_sign_negative() && !self.price.is_zero() {
            return Err(RecordError::NegativePrice(self.id.clone()));
        }
        Ok(())
    }

    /// Whether this record is strictly older than `other` by exchange time.
    ///
    /// Records without a timestamp are never considered stale.
    #[must_use]
    pub fn is_older_than(&self, other: &Self) -> bool {
        match (self.timestamp, other.timestamp) {
            (Some(mine), Some(theirs)) => mine < theirs,
            _ => false,
        }
    }
}

// =============================================================================
// Parsing
// =============================================================================

/// Errors raised while turning a payload into price records.
#[derive(Debug, Error)]
pub enum RecordError {
    /// Payload is not valid JSON for a record batch.
    #[error("invalid price payload: {0}")]
    Json(#[from] serde_json::Error),

    /// Payload is neither a JSON array nor a JSON object.
    #[error("expected JSON array or object, got: {0}")]
    InvalidFormat(String),

    /// Record carries a blank identifier.
    #[error("price record has an empty identifier")]
    EmptyId,

    /// Record carries a negative price.
    #[error("price record {0} has a negative price")]
    NegativePrice(InstrumentId),
}

/// Parse a JSON payload into a batch of validated price records.
///
/// Any invalid record rejects the whole batch.
///
/// # Errors
///
/// Returns `RecordError` if the payload is malformed or a record fails validation.
///
/// # Example
///
/// ```rust
/// use market_sync::domain::market::parse_price_batch;
///
/// let records = parse_price_batch(r#"[{"id":"BTC-KRW","price":100}]"#).unwrap();
/// assert_eq!(records[0].id, "BTC-KRW");
/// ```
pub fn parse_price_batch(text: &str) -> Result<Vec<PriceRecord>, RecordError> {
    let trimmed = text.trim();

    let records = if trimmed.starts_with('[') {
        serde_json::from_str::<Vec<PriceRecord>>(trimmed)?
    } else if trimmed.starts_with('{') {
        vec![serde_json::from_str::<PriceRecord>(trimmed)?]
    } else {
        let preview: String = trimmed.chars().take(50).collect();
        return Err(RecordError::InvalidFormat(preview));
    };

    for record in &records {
        record.validate()?;
    }

    Ok(records)
}
