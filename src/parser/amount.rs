//! Numeric field extraction from tracker text
//!
//! Trackers format quantities with comma grouping and market caps with
//! k/M/B suffixes. Everything here is best-effort: a miss is `None`, never
//! an error.

use lazy_static::lazy_static;
use regex::Regex;

lazy_static! {
    static ref USD_VALUE_RE: Regex = Regex::new(r"\$\s*([0-9][0-9,]*(?:\.[0-9]+)?)").unwrap();
    static ref MARKET_CAP_RE: Regex =
        Regex::new(r"(?i)MC:\s*\$\s*([0-9][0-9,]*(?:\.[0-9]+)?)\s*([kKmMbB])?").unwrap();
}

/// Parse a plain amount with optional comma grouping ("1,234,567.89")
pub fn parse_amount(raw: &str) -> Option<f64> {
    let cleaned = raw.trim().replace(',', "");
    if cleaned.is_empty() {
        return None;
    }
    cleaned.parse::<f64>().ok().filter(|v| v.is_finite())
}

/// Parse an amount with an optional magnitude suffix ("150.2k", "3.4M", "1B")
pub fn parse_suffixed_amount(raw: &str) -> Option<f64> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    let (digits, multiplier) = match trimmed.chars().last() {
        Some('k') | Some('K') => (&trimmed[..trimmed.len() - 1], 1_000.0),
        Some('m') | Some('M') => (&trimmed[..trimmed.len() - 1], 1_000_000.0),
        Some('b') | Some('B') => (&trimmed[..trimmed.len() - 1], 1_000_000_000.0),
        _ => (trimmed, 1.0),
    };
    parse_amount(digits).map(|v| v * multiplier)
}

/// First `$N` occurrence anywhere in the text
pub fn first_usd_value(text: &str) -> Option<f64> {
    USD_VALUE_RE
        .captures(text)
        .and_then(|c| parse_amount(&c[1]))
}

/// `MC: $N[k|M|B]` market-cap annotation
pub fn market_cap(text: &str) -> Option<f64> {
    let caps = MARKET_CAP_RE.captures(text)?;
    let base = parse_amount(&caps[1])?;
    let multiplier = match caps.get(2).map(|m| m.as_str()) {
        Some("k") | Some("K") => 1_000.0,
        Some("m") | Some("M") => 1_000_000.0,
        Some("b") | Some("B") => 1_000_000_000.0,
        _ => 1.0,
    };
    Some(base * multiplier)
}
