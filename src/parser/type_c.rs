//! Type-C extractor: BUY/SELL word markers with a trailing bare address line
//!
//! Shape:
//!
//! ```text
//! 🟢 BUY FOO
//! 👤 Whale #4
//! Swapped 2.1 SOL for 500,000 FOO ($480.50)
//! MC: $95k
//! 7xKXtg2CW87d97TXJSDpbD5jBkheTqA83TZRuJosgAsUpump
//! ```

use lazy_static::lazy_static;
use regex::Regex;
use tracing::debug;

use super::amount::{market_cap, parse_amount};
use super::RawTransaction;
use crate::model::{normalize_token_address, QuoteSymbol, TradeSide};
use crate::session::source::InboundMessage;

lazy_static! {
    static ref SIDE_RE: Regex = Regex::new(r"(?m)^\s*\W*\s*(BUY|SELL)\b").unwrap();
    static ref SWAP_RE: Regex = Regex::new(
        r"(?i)([0-9][0-9,]*(?:\.[0-9]+)?)\s+#?([A-Za-z0-9]{1,16})\s+for\s+([0-9][0-9,]*(?:\.[0-9]+)?)\s+#?([A-Za-z0-9]{1,16})\s*\(\$([0-9][0-9,]*(?:\.[0-9]+)?)\)"
    )
    .unwrap();
    static ref HASHTAG_SYMBOL_RE: Regex = Regex::new(r"#([A-Za-z0-9]{1,16})").unwrap();
    static ref BARE_ADDRESS_RE: Regex =
        Regex::new(r"^[1-9A-HJ-NP-Za-km-z]{32,48}$").unwrap();
    static ref WALLET_LINE_RE: Regex =
        Regex::new(r"(?m)^\s*(?:👤|Wallet:)\s*(.+?)\s*$").unwrap();
}

/// Extract a transaction from a type-C message
pub fn extract(msg: &InboundMessage) -> Option<RawTransaction> {
    let side = match SIDE_RE.captures(&msg.text) {
        Some(c) if &c[1] == "BUY" => TradeSide::Buy,
        Some(_) => TradeSide::Sell,
        None => {
            debug!(tracker_type = "c", "no BUY/SELL marker");
            return None;
        }
    };

    let wallet_label = WALLET_LINE_RE
        .captures(&msg.text)
        .map(|c| c[1].to_string())?;

    // Swap line carries both quantities and the embedded USD value
    let (amount, quote_amount, quote_symbol, swap_token_symbol, usd_value) =
        match SWAP_RE.captures(&msg.text) {
            Some(c) => {
                let first_amount = parse_amount(&c[1])?;
                let first_symbol = c[2].to_string();
                let second_amount = parse_amount(&c[3])?;
                let second_symbol = c[4].to_string();
                let usd = parse_amount(&c[5]);
                match (
                    QuoteSymbol::parse(&first_symbol),
                    QuoteSymbol::parse(&second_symbol),
                ) {
                    (Some(q), None) => {
                        (second_amount, first_amount, Some(q), Some(second_symbol), usd)
                    }
                    (None, Some(q)) => {
                        (first_amount, second_amount, Some(q), Some(first_symbol), usd)
                    }
                    _ => match side {
                        TradeSide::Buy => {
                            (second_amount, first_amount, None, Some(second_symbol), usd)
                        }
                        TradeSide::Sell => {
                            (first_amount, second_amount, None, Some(first_symbol), usd)
                        }
                    },
                }
            }
            None => (0.0, 0.0, None, None, None),
        };

    let token_symbol = header_symbol(&msg.text)
        .or(swap_token_symbol)
        .or_else(|| hashtag_symbol(&msg.text))?;

    Some(RawTransaction {
        wallet_label,
        wallet_address: None,
        side,
        token_symbol,
        token_address: trailing_address(&msg.text),
        amount,
        quote_amount,
        quote_symbol,
        usd_value,
        market_cap: market_cap(&msg.text),
        timestamp: msg.timestamp,
    })
}

/// Symbol from the header line: the word following BUY/SELL
fn header_symbol(text: &str) -> Option<String> {
    let header = text.lines().find(|l| !l.trim().is_empty())?;
    let mut words = header.split_whitespace().skip_while(|w| {
        let cleaned: String = w.chars().filter(|c| c.is_alphanumeric()).collect();
        cleaned != "BUY" && cleaned != "SELL"
    });
    words.next()?;
    let symbol: String = words
        .next()?
        .trim_start_matches('#')
        .chars()
        .filter(|c| c.is_alphanumeric())
        .collect();
    if symbol.is_empty() {
        None
    } else {
        Some(symbol)
    }
}

/// Fallback symbol from any `#SYM` token
fn hashtag_symbol(text: &str) -> Option<String> {
    HASHTAG_SYMBOL_RE.captures(text).map(|c| c[1].to_string())
}

/// Last line of the message that is a bare base58 address, pump suffix
/// stripped
fn trailing_address(text: &str) -> Option<String> {
    text.lines()
        .rev()
        .map(str::trim)
        .find(|l| BARE_ADDRESS_RE.is_match(l))
        .and_then(normalize_token_address)
}
