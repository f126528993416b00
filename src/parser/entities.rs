//! Token and wallet address resolution from embedded URLs
//!
//! Trackers hide the reliable data in links: chart pages and trading-bot
//! deep links carry the token address, profile and explorer links carry the
//! wallet address. Text-pattern fallbacks match the same shapes when the
//! upstream stripped the entity annotations.

use lazy_static::lazy_static;
use regex::Regex;
use url::Url;

use crate::model::{is_valid_address, normalize_token_address};
use crate::session::source::InboundMessage;

lazy_static! {
    /// Address-shaped path segment inside a URL appearing as plain text
    static ref URL_PATH_ADDR_RE: Regex =
        Regex::new(r"https?://\S+/([1-9A-HJ-NP-Za-km-z]{32,48})").unwrap();
    /// Trading-bot deep-link start parameter: start=d-<ref>-<addr>
    static ref DEEPLINK_ADDR_RE: Regex =
        Regex::new(r"start=d-[A-Za-z0-9_]+-([1-9A-HJ-NP-Za-km-z]{32,48})").unwrap();
    /// Inline monospace segment in raw text
    static ref BACKTICK_RE: Regex = Regex::new(r"`([^`\n]+)`").unwrap();
}

/// Resolve the token address from a chart-link URL: the first path segment
/// that is a valid address, optionally carrying a `pump` suffix.
/// Profile/explorer and deep-link URLs are not chart links.
pub fn token_address_from_chart_url(raw: &str) -> Option<String> {
    let parsed = Url::parse(raw).ok()?;
    if parsed.query().map(|q| q.contains("start=")).unwrap_or(false) {
        return None;
    }
    let segments: Vec<&str> = parsed.path_segments()?.collect();
    if segments.iter().any(|s| *s == "profile" || *s == "address") {
        return None;
    }
    segments
        .iter()
        .find_map(|segment| normalize_token_address(segment))
}

/// Resolve the token address from a trading-bot deep link
/// (`...?start=d-<ref>-<addr>`)
pub fn token_address_from_deeplink(raw: &str) -> Option<String> {
    DEEPLINK_ADDR_RE
        .captures(raw)
        .and_then(|c| normalize_token_address(&c[1]))
}

/// Text-pattern fallback matching the same URL shapes as the entity rules
pub fn token_address_from_text(text: &str) -> Option<String> {
    if let Some(caps) = DEEPLINK_ADDR_RE.captures(text) {
        if let Some(addr) = normalize_token_address(&caps[1]) {
            return Some(addr);
        }
    }
    for caps in URL_PATH_ADDR_RE.captures_iter(text) {
        if let Some(addr) = normalize_token_address(&caps[1]) {
            return Some(addr);
        }
    }
    None
}

/// Resolve a wallet address from a profile URL (`.../profile/<base58>`)
pub fn wallet_address_from_profile_url(raw: &str) -> Option<String> {
    address_after_segment(raw, "profile")
}

/// Resolve a wallet address from a block-explorer URL (`.../address/<base58>`)
pub fn wallet_address_from_explorer_url(raw: &str) -> Option<String> {
    address_after_segment(raw, "address")
}

fn address_after_segment(raw: &str, marker: &str) -> Option<String> {
    let parsed = Url::parse(raw).ok()?;
    let segments: Vec<&str> = parsed.path_segments()?.collect();
    let idx = segments.iter().position(|s| *s == marker)?;
    let candidate = segments.get(idx + 1)?;
    if is_valid_address(candidate) {
        Some((*candidate).to_string())
    } else {
        None
    }
}

/// Token address with the full type-A priority order: chart entity, deep-link
/// entity, then text fallback
pub fn resolve_token_address(msg: &InboundMessage) -> Option<String> {
    let urls = msg.entity_urls();
    for url in &urls {
        if let Some(addr) = token_address_from_chart_url(url) {
            return Some(addr);
        }
    }
    for url in &urls {
        if let Some(addr) = token_address_from_deeplink(url) {
            return Some(addr);
        }
    }
    token_address_from_text(&msg.text)
}

/// Wallet address from any profile URL on the message
pub fn resolve_profile_wallet(msg: &InboundMessage) -> Option<String> {
    msg.entity_urls()
        .iter()
        .find_map(|u| wallet_address_from_profile_url(u))
}

/// Wallet address from any block-explorer URL on the message
pub fn resolve_explorer_wallet(msg: &InboundMessage) -> Option<String> {
    msg.entity_urls()
        .iter()
        .find_map(|u| wallet_address_from_explorer_url(u))
}

/// Monospace segments: entity-annotated first, backtick fallback second
pub fn monospace_segments(msg: &InboundMessage) -> Vec<String> {
    let from_entities = msg.code_segments();
    if !from_entities.is_empty() {
        return from_entities;
    }
    BACKTICK_RE
        .captures_iter(&msg.text)
        .map(|c| c[1].trim().to_string())
        .collect()
}
