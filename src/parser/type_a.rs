//! Type-A extractor: glyph-marked swap lines with chart/bot deep links
//!
//! Shape (entities carry the links):
//!
//! ```text
//! 🔺 Whale #4
//! 🟢🟢 Swapped 1.5 #SOL for 1,000,000 #FOO on Pump
//! 💰 MC: $150.2k
//! Chart | Trade | Profile
//! ```

use lazy_static::lazy_static;
use regex::Regex;
use tracing::debug;

use super::amount::{first_usd_value, market_cap, parse_amount};
use super::entities::{resolve_profile_wallet, resolve_token_address};
use super::RawTransaction;
use crate::model::{QuoteSymbol, TradeSide};
use crate::session::source::InboundMessage;

lazy_static! {
    static ref SWAP_RE: Regex = Regex::new(
        r"(?i)Swapped\s+([0-9][0-9,]*(?:\.[0-9]+)?)\s+#?([A-Za-z0-9]{1,16})\s+for\s+([0-9][0-9,]*(?:\.[0-9]+)?)\s+#?([A-Za-z0-9]{1,16})"
    )
    .unwrap();
}

const BUY_GLYPH: char = '\u{1F7E2}'; // 🟢
const SELL_GLYPH: char = '\u{1F534}'; // 🔴

/// Extract a transaction from a type-A message. `None` when the text is not
/// a recognized swap.
pub fn extract(msg: &InboundMessage) -> Option<RawTransaction> {
    let wallet_label = wallet_label(&msg.text)?;

    let caps = match SWAP_RE.captures(&msg.text) {
        Some(c) => c,
        None => {
            debug!(tracker_type = "a", "no swap pattern in message");
            return None;
        }
    };

    let first_amount = parse_amount(&caps[1])?;
    let first_symbol = caps[2].to_string();
    let second_amount = parse_amount(&caps[3])?;
    let second_symbol = caps[4].to_string();

    // Swapped QUOTE for TOKEN is a buy; the mirror is a sell. Colored-circle
    // glyphs settle token-to-token swaps the pattern cannot orient.
    let (side, token_symbol, amount, quote_amount, quote_symbol) =
        match (QuoteSymbol::parse(&first_symbol), QuoteSymbol::parse(&second_symbol)) {
            (Some(quote), None) => (
                TradeSide::Buy,
                second_symbol,
                second_amount,
                first_amount,
                Some(quote),
            ),
            (None, Some(quote)) => (
                TradeSide::Sell,
                first_symbol,
                first_amount,
                second_amount,
                Some(quote),
            ),
            _ => {
                let side = side_from_glyphs(&msg.text)?;
                match side {
                    TradeSide::Buy => {
                        (side, second_symbol, second_amount, first_amount, None)
                    }
                    TradeSide::Sell => {
                        (side, first_symbol, first_amount, second_amount, None)
                    }
                }
            }
        };

    Some(RawTransaction {
        wallet_label,
        wallet_address: resolve_profile_wallet(msg),
        side,
        token_symbol,
        token_address: resolve_token_address(msg),
        amount,
        quote_amount,
        quote_symbol,
        usd_value: first_usd_value(&msg.text),
        market_cap: market_cap(&msg.text),
        timestamp: msg.timestamp,
    })
}

/// Wallet label: first line after its marker glyph. Leading non-alphanumeric
/// glyph cluster is stripped; the remainder is the label.
fn wallet_label(text: &str) -> Option<String> {
    let first_line = text.lines().find(|l| !l.trim().is_empty())?;
    let label: String = first_line
        .trim()
        .trim_start_matches(|c: char| !c.is_alphanumeric() && c != '#')
        .trim()
        .to_string();
    if label.is_empty() {
        None
    } else {
        Some(label)
    }
}

/// Side from the pair of colored-circle glyphs
fn side_from_glyphs(text: &str) -> Option<TradeSide> {
    let buys = text.chars().filter(|c| *c == BUY_GLYPH).count();
    let sells = text.chars().filter(|c| *c == SELL_GLYPH).count();
    if buys >= 2 && sells == 0 {
        Some(TradeSide::Buy)
    } else if sells >= 2 && buys == 0 {
        Some(TradeSide::Sell)
    } else {
        None
    }
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
            sender_id: 100,
            sender_handle: "tracker_a".into(),
            outbound: false,
            timestamp: Utc::now(),
            session_id: "s1".into(),
        }
    }

    #[test]
    fn test_buy_swap() {
        let text = "🔺 Whale #4\n🟢🟢 Swapped 1.5 #SOL for 1,000,000 #FOO on Pump\n💰 MC: $150.2k";
        let raw = extract(&message(text, vec![])).unwrap();
        assert_eq!(raw.wallet_label, "Whale #4");
        assert_eq!(raw.side, TradeSide::Buy);
        assert_eq!(raw.token_symbol, "FOO");
        assert_eq!(raw.amount, 1_000_000.0);
        assert_eq!(raw.quote_amount, 1.5);
        assert_eq!(raw.quote_symbol, Some(QuoteSymbol::Sol));
        assert_eq!(raw.market_cap, Some(150_200.0));
    }

    #[test]
    fn test_sell_swap_mirror() {
        let text = "🔺 Whale #4\n🔴🔴 Swapped 500,000 #FOO for 0.8 #SOL\n💰 MC: $90k";
        let raw = extract(&message(text, vec![])).unwrap();
        assert_eq!(raw.side, TradeSide::Sell);
        assert_eq!(raw.token_symbol, "FOO");
        assert_eq!(raw.amount, 500_000.0);
        assert_eq!(raw.quote_amount, 0.8);
    }

    #[test]
    fn test_token_address_from_chart_entity() {
        let text = "🔺 Whale\n🟢🟢 Swapped 1.5 #SOL for 10 #FOO\nChart";
        let entities = vec![MessageEntity::text_link(
            text.chars().count() - 5,
            5,
            format!("https://dexscreener.com/solana/{ADDR}pump"),
        )];
        let raw = extract(&message(text, entities)).unwrap();
        assert_eq!(raw.token_address.as_deref(), Some(ADDR));
    }

    #[test]
    fn test_wallet_address_from_profile_entity() {
        let text = "🔺 Whale\n🟢🟢 Swapped 1.5 #SOL for 10 #FOO\nProfile";
        let entities = vec![MessageEntity::text_link(
            text.chars().count() - 7,
            7,
            format!("https://app.example.com/profile/{WALLET}"),
        )];
        let raw = extract(&message(text, entities)).unwrap();
        assert_eq!(raw.wallet_address.as_deref(), Some(WALLET));
    }

    #[test]
    fn test_glyphs_break_token_to_token_tie() {
        let text = "🔺 Whale\n🟢🟢 Swapped 100 #BAR for 200 #FOO";
        let raw = extract(&message(text, vec![])).unwrap();
        assert_eq!(raw.side, TradeSide::Buy);
        assert_eq!(raw.token_symbol, "FOO");

        let text = "🔺 Whale\n🔴🔴 Swapped 200 #FOO for 100 #BAR";
        let raw = extract(&message(text, vec![])).unwrap();
        assert_eq!(raw.side, TradeSide::Sell);
        assert_eq!(raw.token_symbol, "FOO");
    }

    #[test]
    fn test_unrecognized_text_is_none() {
        assert!(extract(&message("gm frens", vec![])).is_none());
        assert!(extract(&message("🔺 Whale\nno swap here", vec![])).is_none());
    }

    #[test]
    fn test_usd_value_first_occurrence() {
        let text = "🔺 Whale\n🟢🟢 Swapped 1.5 #SOL for 10 #FOO ($250.75)\n💰 MC: $1.2M";
        let raw = extract(&message(text, vec![])).unwrap();
        assert_eq!(raw.usd_value, Some(250.75));
        assert_eq!(raw.market_cap, Some(1_200_000.0));
    }
}
