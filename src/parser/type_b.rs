//! Type-B extractor: colon-labelled header with sent/received lines
//!
//! Shape:
//!
//! ```text
//! Whale #4: Token Buy 🟢
//! `7xKXtg2CW87d97TXJSDpbD5jBkheTqA83TZRuJosgAsU`
//! Sent: 2.00 SOL
//! Received: 1,234,567.89 FOO
//! Explorer
//! ```

use lazy_static::lazy_static;
use regex::Regex;
use tracing::debug;

use super::amount::{first_usd_value, market_cap, parse_amount};
use super::entities::{monospace_segments, resolve_explorer_wallet};
use super::RawTransaction;
use crate::model::{normalize_token_address, QuoteSymbol, TradeSide};
use crate::session::source::InboundMessage;

lazy_static! {
    static ref SENT_RE: Regex =
        Regex::new(r"(?im)^\s*Sent:\s*([0-9][0-9,]*(?:\.[0-9]+)?)\s+#?([A-Za-z0-9]{1,16})").unwrap();
    static ref RECEIVED_RE: Regex =
        Regex::new(r"(?im)^\s*Received:\s*([0-9][0-9,]*(?:\.[0-9]+)?)\s+#?([A-Za-z0-9]{1,16})")
            .unwrap();
    static ref SIDE_RE: Regex = Regex::new(r"(?i)Token\s+(Buy|Sell)").unwrap();
}

/// Extract a transaction from a type-B message
pub fn extract(msg: &InboundMessage) -> Option<RawTransaction> {
    let header = msg.text.lines().find(|l| !l.trim().is_empty())?;
    let wallet_label = header.split(':').next()?.trim().to_string();
    if wallet_label.is_empty() {
        return None;
    }

    let side = match SIDE_RE.captures(&msg.text) {
        Some(c) if c[1].eq_ignore_ascii_case("buy") => TradeSide::Buy,
        Some(_) => TradeSide::Sell,
        None => {
            debug!(tracker_type = "b", "no Token Buy/Sell marker");
            return None;
        }
    };

    let (sent_amount, sent_symbol) = {
        let c = SENT_RE.captures(&msg.text)?;
        (parse_amount(&c[1])?, c[2].to_string())
    };
    let (received_amount, received_symbol) = {
        let c = RECEIVED_RE.captures(&msg.text)?;
        (parse_amount(&c[1])?, c[2].to_string())
    };

    // The token is whichever side is not the base currency
    let (token_symbol, amount, quote_amount, quote_symbol) = match (
        QuoteSymbol::parse(&sent_symbol),
        QuoteSymbol::parse(&received_symbol),
    ) {
        (Some(quote), None) => (received_symbol, received_amount, sent_amount, Some(quote)),
        (None, Some(quote)) => (sent_symbol, sent_amount, received_amount, Some(quote)),
        _ => {
            // Both or neither look like base currencies; follow the side
            match side {
                TradeSide::Buy => (received_symbol, received_amount, sent_amount, None),
                TradeSide::Sell => (sent_symbol, sent_amount, received_amount, None),
            }
        }
    };

    let token_address = monospace_segments(msg)
        .iter()
        .find_map(|s| normalize_token_address(s));

    Some(RawTransaction {
        wallet_label,
        wallet_address: resolve_explorer_wallet(msg),
        side,
        token_symbol,
        token_address,
        amount,
        quote_amount,
        quote_symbol,
        usd_value: first_usd_value(&msg.text),
        market_cap: market_cap(&msg.text),
        timestamp: msg.timestamp,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::source::MessageEntity;
    use chrono::Utc;

    const ADDR: &str = "7xKXtg2CW87d97TXJSDpbD5jBkheTqA83TZRuJosgAsU";
    const WALLET: &str = "DYw8jCTfwHNRJhhmFcbXvVDTqWMEVFBX6ZKUmG5CNSKK";

    fn message(text: &str, entities: Vec<MessageEntity>) -> InboundMessage {
        InboundMessage {
            text: text.to_string(),
            entities,
            sender_id: 200,
            sender_handle: "tracker_b".into(),
            outbound: false,
            timestamp: Utc::now(),
            session_id: "s1".into(),
        }
    }

    fn sample_text() -> String {
        format!(
            "Whale #4: Token Buy 🟢\n`{ADDR}`\nSent: 2.00 SOL\nReceived: 1,234,567.89 FOO"
        )
    }

    #[test]
    fn test_buy_with_backtick_address() {
        let raw = extract(&message(&sample_text(), vec![])).unwrap();
        assert_eq!(raw.wallet_label, "Whale #4");
        assert_eq!(raw.side, TradeSide::Buy);
        assert_eq!(raw.token_symbol, "FOO");
        assert_eq!(raw.token_address.as_deref(), Some(ADDR));
        assert_eq!(raw.amount, 1_234_567.89);
        assert_eq!(raw.quote_amount, 2.0);
        assert_eq!(raw.quote_symbol, Some(QuoteSymbol::Sol));
    }

    #[test]
    fn test_sell_mirrors_sent_received() {
        let text = format!(
            "Whale #4: Token Sell 🔴\n`{ADDR}`\nSent: 900,000 FOO\nReceived: 1.20 SOL"
        );
        let raw = extract(&message(&text, vec![])).unwrap();
        assert_eq!(raw.side, TradeSide::Sell);
        assert_eq!(raw.token_symbol, "FOO");
        assert_eq!(raw.amount, 900_000.0);
        assert_eq!(raw.quote_amount, 1.2);
    }

    #[test]
    fn test_monospace_entity_preferred() {
        let text = format!(
            "Whale: Token Buy\n{ADDR}\nSent: 1.00 SOL\nReceived: 10 FOO"
        );
        let offset = text.chars().take_while(|c| *c != '7').count();
        let entities = vec![MessageEntity::code(offset, ADDR.chars().count())];
        let raw = extract(&message(&text, entities)).unwrap();
        assert_eq!(raw.token_address.as_deref(), Some(ADDR));
    }

    #[test]
    fn test_explorer_wallet_address() {
        let text = format!("{}\nExplorer", sample_text());
        let offset = text.chars().count() - 8;
        let entities = vec![MessageEntity::text_link(
            offset,
            8,
            format!("https://solscan.io/address/{WALLET}"),
        )];
        let raw = extract(&message(&text, entities)).unwrap();
        assert_eq!(raw.wallet_address.as_deref(), Some(WALLET));
    }

    #[test]
    fn test_missing_side_is_none() {
        let text = format!("Whale: something\n`{ADDR}`\nSent: 1 SOL\nReceived: 10 FOO");
        assert!(extract(&message(&text, vec![])).is_none());
    }

    #[test]
    fn test_missing_amount_lines_is_none() {
        let text = "Whale: Token Buy 🟢\njust some text".to_string();
        assert!(extract(&message(&text, vec![])).is_none());
    }
}
