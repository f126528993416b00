//! Tracker-format parser registry
//!
//! Each tracker type declares an extractor that turns annotated text into a
//! raw transaction; all extractors share the post-normalization stage below.
//! Parsers are pure and never terminate the pipeline: malformed input yields
//! `None` plus a single structured warning, unrecognized input yields `None`
//! with a debug trace.

pub mod amount;
pub mod entities;
mod type_a;
mod type_b;
mod type_c;

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use crate::model::{
    normalize_optional_wallet_address, QuoteSymbol, TradeSide, TrackerType, Transaction,
    SIMULATED_PREFIX,
};
use crate::session::source::InboundMessage;

/// Extractor output before shared normalization
#[derive(Debug, Clone)]
pub(crate) struct RawTransaction {
    pub wallet_label: String,
    pub wallet_address: Option<String>,
    pub side: TradeSide,
    pub token_symbol: String,
    pub token_address: Option<String>,
    pub amount: f64,
    pub quote_amount: f64,
    pub quote_symbol: Option<QuoteSymbol>,
    pub usd_value: Option<f64>,
    pub market_cap: Option<f64>,
    pub timestamp: DateTime<Utc>,
}

/// Symbols trackers emit when they could not resolve the token
const PLACEHOLDER_SYMBOLS: &[&str] = &["UNKNOWN", "???", "N/A", "NONE"];

/// Parse a message under the given tracker format.
///
/// Returns `None` when the text is not a recognized transaction or a key
/// field is missing; the message is ignored, not an error.
pub fn parse(msg: &InboundMessage, tracker_type: TrackerType) -> Option<Transaction> {
    let raw = match tracker_type {
        TrackerType::A => type_a::extract(msg),
        TrackerType::B => type_b::extract(msg),
        TrackerType::C => type_c::extract(msg),
    };

    match raw {
        Some(raw) => post_normalize(raw, tracker_type),
        None => {
            debug!(tracker_type = %tracker_type, "message did not match format");
            None
        }
    }
}

/// Shared post-normalization for all extractors
fn post_normalize(raw: RawTransaction, tracker_type: TrackerType) -> Option<Transaction> {
    let token_symbol = raw.token_symbol.trim().to_ascii_uppercase();

    let token_address = raw
        .token_address
        .filter(|a| !a.starts_with(SIMULATED_PREFIX));

    // A transaction with no token identity at all is unusable
    let symbol_is_placeholder =
        token_symbol.is_empty() || PLACEHOLDER_SYMBOLS.contains(&token_symbol.as_str());
    if symbol_is_placeholder && token_address.is_none() {
        warn!(
            tracker_type = %tracker_type,
            wallet = %raw.wallet_label,
            "dropping transaction without token identity"
        );
        return None;
    }

    if raw.wallet_label.trim().is_empty() {
        warn!(tracker_type = %tracker_type, "dropping transaction without wallet label");
        return None;
    }

    Some(Transaction {
        wallet_label: raw.wallet_label.trim().to_string(),
        wallet_address: normalize_optional_wallet_address(raw.wallet_address),
        side: raw.side,
        token_symbol,
        token_address,
        amount: raw.amount,
        quote_amount: raw.quote_amount,
        // A bare numeric quote means the tracker omitted the base symbol;
        // SOL is the default base on these channels.
        quote_symbol: raw.quote_symbol.unwrap_or(QuoteSymbol::Sol),
        usd_value: raw.usd_value.unwrap_or(0.0),
        market_cap: raw.market_cap.unwrap_or(0.0),
        timestamp: raw.timestamp,
    })
}
