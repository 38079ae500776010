//! Wire and event shapes shared by the capture pipeline.
//!
//! Upstream trade messages arrive as JSON bytes in the producer's camelCase
//! field naming. `decode_trade` turns those bytes into a [`DecodedTrade`] or a
//! [`DecodeError`]; the caller decides what to do with undecodable input (the
//! receiver downgrades it to an invalid message, it never drops it).
//!
//! The downstream representation is [`TradeEvent`], encoded once at persist
//! time and forwarded byte-for-byte afterwards.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TradeSide {
    Buy,
    Sell,
}

impl TradeSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            TradeSide::Buy => "BUY",
            TradeSide::Sell => "SELL",
        }
    }
}

/// Raw upstream wire shape. Every field is optional: the producer contract
/// only promises JSON, not completeness, and missing identity fields must be
/// observable (they decide validity) rather than fail the whole decode.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TradeMessage {
    portfolio_id: Option<Uuid>,
    trade_id: Option<Uuid>,
    symbol: Option<String>,
    side: Option<TradeSide>,
    price_per_stock: Option<String>,
    quantity: Option<i64>,
    event_timestamp: Option<DateTime<Utc>>,
}

/// A trade that passed the validity predicate: both identity fields present
/// and non-nil. Business fields stay optional; absence of a symbol is an
/// audit concern, not a routing one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecodedTrade {
    pub portfolio_id: Uuid,
    pub trade_id: Uuid,
    pub symbol: Option<String>,
    pub side: Option<TradeSide>,
    pub price_per_stock: Option<String>,
    pub quantity: Option<i64>,
    pub event_timestamp: Option<DateTime<Utc>>,
}

/// The downstream record. Same fields as [`DecodedTrade`], serialized in the
/// producer's camelCase convention so downstream consumers see one dialect.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TradeEvent {
    pub trade_id: Uuid,
    pub portfolio_id: Uuid,
    pub symbol: Option<String>,
    pub side: Option<TradeSide>,
    pub price_per_stock: Option<String>,
    pub quantity: Option<i64>,
    pub event_timestamp: Option<DateTime<Utc>>,
}

impl From<&DecodedTrade> for TradeEvent {
    fn from(t: &DecodedTrade) -> Self {
        TradeEvent {
            trade_id: t.trade_id,
            portfolio_id: t.portfolio_id,
            symbol: t.symbol.clone(),
            side: t.side,
            price_per_stock: t.price_per_stock.clone(),
            quantity: t.quantity,
            event_timestamp: t.event_timestamp,
        }
    }
}

/// Why a payload failed to decode into a valid trade.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    Malformed(String),
    MissingPortfolioId,
    MissingTradeId,
}

impl std::fmt::Display for DecodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DecodeError::Malformed(detail) => write!(f, "malformed trade payload: {detail}"),
            DecodeError::MissingPortfolioId => write!(f, "portfolioId missing or nil"),
            DecodeError::MissingTradeId => write!(f, "tradeId missing or nil"),
        }
    }
}

impl std::error::Error for DecodeError {}

/// Decode raw bytes into a [`DecodedTrade`].
///
/// The validity predicate is `portfolioId ≠ ∅ ∧ tradeId ≠ ∅`; a nil UUID
/// counts as absent.
pub fn decode_trade(raw: &[u8]) -> Result<DecodedTrade, DecodeError> {
    let msg: TradeMessage =
        serde_json::from_slice(raw).map_err(|e| DecodeError::Malformed(e.to_string()))?;

    let portfolio_id = match msg.portfolio_id {
        Some(id) if !id.is_nil() => id,
        _ => return Err(DecodeError::MissingPortfolioId),
    };
    let trade_id = match msg.trade_id {
        Some(id) if !id.is_nil() => id,
        _ => return Err(DecodeError::MissingTradeId),
    };

    Ok(DecodedTrade {
        portfolio_id,
        trade_id,
        symbol: msg.symbol,
        side: msg.side,
        price_per_stock: msg.price_per_stock,
        quantity: msg.quantity,
        event_timestamp: msg.event_timestamp,
    })
}

/// Canonical downstream bytes for a trade. Encoded exactly once, at persist
/// time; the dispatcher forwards the stored bytes verbatim.
pub fn encode_event(trade: &DecodedTrade) -> Vec<u8> {
    // Serialization of a plain struct with no map keys beyond identifiers
    // cannot fail; a panic here would indicate a broken serde derive.
    serde_json::to_vec(&TradeEvent::from(trade)).expect("TradeEvent serialization must not fail")
}

/// Re-parse stored payload bytes into the downstream record.
///
/// Used by the dispatch worker as its local poison check before the payload
/// is handed to the downstream log.
pub fn decode_event(payload: &[u8]) -> Result<TradeEvent, serde_json::Error> {
    serde_json::from_slice(payload)
}
