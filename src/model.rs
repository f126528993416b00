//! Core data model: trade events, token identity, subscriptions, confluences
//!
//! Token address is the canonical identity whenever present; the symbol is a
//! best-effort fallback. Address-keyed and symbol-keyed aggregation never
//! merge, even when the symbol matches.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Reserved prefix for simulated/placeholder addresses. Anything carrying it
/// never reaches the network or the aggregation buckets.
pub const SIMULATED_PREFIX: &str = "SIMULATED";

/// Tenant (group) identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TenantId(pub i64);

impl fmt::Display for TenantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for TenantId {
    fn from(id: i64) -> Self {
        TenantId(id)
    }
}

/// Message format family a tracker emits
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackerType {
    /// Glyph-marked swap lines with chart/bot deep links
    A,
    /// Colon-labelled header with sent/received lines and monospace address
    B,
    /// BUY/SELL word markers with a trailing bare address line
    C,
}

impl std::str::FromStr for TrackerType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "a" => Ok(TrackerType::A),
            "b" => Ok(TrackerType::B),
            "c" => Ok(TrackerType::C),
            other => Err(format!("unknown tracker type: {other}")),
        }
    }
}

impl fmt::Display for TrackerType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrackerType::A => write!(f, "a"),
            TrackerType::B => write!(f, "b"),
            TrackerType::C => write!(f, "c"),
        }
    }
}

/// Buy or sell side of a trade
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TradeSide {
    Buy,
    Sell,
}

impl fmt::Display for TradeSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TradeSide::Buy => write!(f, "buy"),
            TradeSide::Sell => write!(f, "sell"),
        }
    }
}

/// Base currency of a swap
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum QuoteSymbol {
    Sol,
    Eth,
    Usdc,
    Usdt,
}

impl QuoteSymbol {
    /// Parse a quote symbol from tracker text (case-insensitive)
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "SOL" | "WSOL" => Some(QuoteSymbol::Sol),
            "ETH" | "WETH" => Some(QuoteSymbol::Eth),
            "USDC" => Some(QuoteSymbol::Usdc),
            "USDT" => Some(QuoteSymbol::Usdt),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            QuoteSymbol::Sol => "SOL",
            QuoteSymbol::Eth => "ETH",
            QuoteSymbol::Usdc => "USDC",
            QuoteSymbol::Usdt => "USDT",
        }
    }
}

impl fmt::Display for QuoteSymbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Canonical aggregation key for a token
///
/// Address wins when present. A symbol-keyed bucket must never merge with an
/// address-keyed one, so the two variants are distinct even for the same coin.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TokenIdentity {
    Address(String),
    Symbol(String),
}

impl TokenIdentity {
    pub fn address(&self) -> Option<&str> {
        match self {
            TokenIdentity::Address(a) => Some(a),
            TokenIdentity::Symbol(_) => None,
        }
    }
}

impl fmt::Display for TokenIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TokenIdentity::Address(a) => write!(f, "addr:{a}"),
            TokenIdentity::Symbol(s) => write!(f, "sym:{s}"),
        }
    }
}

/// A normalized trade event extracted from tracker text
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transaction {
    /// Display label of the wallet as the tracker names it
    pub wallet_label: String,
    /// Resolved wallet address, when a profile/explorer link carried one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wallet_address: Option<String>,
    pub side: TradeSide,
    /// Uppercased token symbol
    pub token_symbol: String,
    /// Canonical token address, when resolvable
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_address: Option<String>,
    /// Token quantity
    pub amount: f64,
    /// Quote-currency quantity
    pub quote_amount: f64,
    pub quote_symbol: QuoteSymbol,
    /// USD value of the trade (0.0 when the tracker omitted it)
    pub usd_value: f64,
    /// Market cap at trade time (0.0 when the tracker omitted it)
    pub market_cap: f64,
    pub timestamp: DateTime<Utc>,
}

impl Transaction {
    /// Aggregation key: address when present, else normalized symbol
    pub fn token_identity(&self) -> TokenIdentity {
        match &self.token_address {
            Some(addr) if !addr.is_empty() => TokenIdentity::Address(addr.clone()),
            _ => TokenIdentity::Symbol(self.token_symbol.to_ascii_uppercase()),
        }
    }

    /// Distinct-wallet identity: address wins, else normalized label
    pub fn wallet_identity(&self) -> String {
        match &self.wallet_address {
            Some(addr) if !addr.is_empty() => addr.clone(),
            _ => normalize_wallet_label(&self.wallet_label),
        }
    }

    /// Key used to reject exact duplicate events inside a bucket
    pub fn dedup_key(&self) -> (String, i64, u64) {
        (
            self.wallet_identity(),
            self.timestamp.timestamp(),
            self.amount.to_bits(),
        )
    }
}

/// Normalize a wallet label for identity comparison: trim + ASCII lowercase.
/// Labels are emoji-heavy free text; ASCII folding is the only stable rule.
pub fn normalize_wallet_label(label: &str) -> String {
    label.trim().to_ascii_lowercase()
}

/// Check that a string is a plausible base58 on-chain address (32-44 chars,
/// decodes as base58, no simulation placeholder prefix)
pub fn is_valid_address(s: &str) -> bool {
    if !(32..=44).contains(&s.len()) {
        return false;
    }
    if s.starts_with(SIMULATED_PREFIX) {
        return false;
    }
    bs58::decode(s).into_vec().is_ok()
}

/// Validate and normalize a candidate token address.
/// Strips a trailing `pump` vanity suffix when the remainder is still a
/// valid address on its own.
pub fn normalize_token_address(raw: &str) -> Option<String> {
    let candidate = raw.trim();
    if is_valid_address(candidate) {
        return Some(candidate.to_string());
    }
    if let Some(stripped) = candidate.strip_suffix("pump") {
        if is_valid_address(stripped) {
            return Some(stripped.to_string());
        }
    }
    None
}

/// Validate a candidate wallet address; anything else becomes `None`
pub fn normalize_optional_wallet_address(raw: Option<String>) -> Option<String> {
    raw.filter(|a| is_valid_address(a))
}

/// Stable handle for an upstream tracker
///
/// Equality is handle-insensitive; the numeric id is resolved lazily at first
/// observation and kept as a secondary match key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackerIdentity {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub numeric_id: Option<i64>,
}

impl TrackerIdentity {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            numeric_id: None,
        }
    }

    pub fn with_id(name: impl Into<String>, id: i64) -> Self {
        Self {
            name: name.into(),
            numeric_id: Some(id),
        }
    }

    /// Match an inbound sender by numeric id, case-insensitive handle, or
    /// stringified id
    pub fn matches_sender(&self, sender_id: i64, sender_handle: &str) -> bool {
        if self.numeric_id == Some(sender_id) {
            return true;
        }
        if !sender_handle.is_empty() && self.name.eq_ignore_ascii_case(sender_handle) {
            return true;
        }
        self.name == sender_id.to_string()
    }
}

impl PartialEq for TrackerIdentity {
    fn eq(&self, other: &Self) -> bool {
        self.name.eq_ignore_ascii_case(&other.name)
    }
}

impl Eq for TrackerIdentity {}

impl std::hash::Hash for TrackerIdentity {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.name.to_ascii_lowercase().hash(state);
    }
}

/// A tracker activation for one tenant
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Subscription {
    pub tracker: String,
    pub tenant: TenantId,
    pub tracker_type: TrackerType,
    pub active: bool,
    /// Operator who set this subscription up
    pub setup_actor: String,
    pub created_at: DateTime<Utc>,
}

/// Maximum active subscriptions per tenant
pub const MAX_SUBSCRIPTIONS_PER_TENANT: usize = 5;

/// Tenant-level detection settings
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct TenantSettings {
    /// Distinct wallets required for a detection, within [2, 10]
    pub min_wallets: u32,
    /// Sliding window in minutes, within [60, 2880]
    pub window_minutes: u32,
}

impl TenantSettings {
    pub const MIN_WALLETS_RANGE: std::ops::RangeInclusive<u32> = 2..=10;
    pub const WINDOW_MINUTES_RANGE: std::ops::RangeInclusive<u32> = 60..=2880;

    pub fn validate(&self) -> crate::error::Result<()> {
        if !Self::MIN_WALLETS_RANGE.contains(&self.min_wallets) {
            return Err(crate::error::Error::InvalidSettings(format!(
                "min_wallets must be within [2, 10], got {}",
                self.min_wallets
            )));
        }
        if !Self::WINDOW_MINUTES_RANGE.contains(&self.window_minutes) {
            return Err(crate::error::Error::InvalidSettings(format!(
                "window_minutes must be within [60, 2880], got {}",
                self.window_minutes
            )));
        }
        Ok(())
    }

    pub fn window(&self) -> chrono::Duration {
        chrono::Duration::minutes(self.window_minutes as i64)
    }
}

impl Default for TenantSettings {
    fn default() -> Self {
        Self {
            min_wallets: 2,
            window_minutes: 1440,
        }
    }
}

/// One wallet's contribution to a confluence
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfluenceWallet {
    pub label: String,
    pub side: TradeSide,
    pub amount: f64,
    pub quote_amount: f64,
    pub timestamp: DateTime<Utc>,
}

/// A detection: N distinct wallets traded the same token within the window
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Confluence {
    pub tenant: TenantId,
    pub token_symbol: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_address: Option<String>,
    /// Timestamp of the event at which the min_wallets-th distinct wallet
    /// first appeared. Frozen once emitted.
    pub detection_timestamp: DateTime<Utc>,
    pub detection_market_cap: f64,
    pub wallet_count: u32,
    pub wallets: Vec<ConfluenceWallet>,
    pub first_tx_timestamp: DateTime<Utc>,
}

impl Confluence {
    /// Aggregation identity this confluence was detected under
    pub fn token_identity(&self) -> TokenIdentity {
        match &self.token_address {
            Some(addr) if !addr.is_empty() => TokenIdentity::Address(addr.clone()),
            _ => TokenIdentity::Symbol(self.token_symbol.to_ascii_uppercase()),
        }
    }

    /// Idempotence key for persistence: (tenant, token identity, detection ts)
    pub fn dedup_key(&self) -> (TenantId, TokenIdentity, i64) {
        (
            self.tenant,
            self.token_identity(),
            self.detection_timestamp.timestamp(),
        )
    }
}

/// Threshold crossing below the initial price
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EarlyDrop {
    /// Drop threshold from initial price, percent (20/30/40/50)
    pub threshold_pct: u32,
    /// Minutes from detection to the first crossing
    pub minutes_from_detection: i64,
}

/// Outcome of the post-detection price scan
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AthResult {
    pub token_address: String,
    pub initial_price: f64,
    pub ath_price: f64,
    pub ath_timestamp: DateTime<Utc>,
    pub percentage_gain: f64,
    pub minutes_to_ath: i64,
    /// Lowest price seen strictly before the ATH sample
    pub min_price_before_ath: f64,
    pub minutes_to_min_before_ath: i64,
    pub early_drops: Vec<EarlyDrop>,
    pub drop_50pct_detected: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub drop_50pct_timestamp: Option<DateTime<Utc>>,
    /// Number of price samples consumed by the scan
    pub data_points: usize,
}

impl AthResult {
    /// Whether the token dropped 50% within `within` of detection while the
    /// peak gain stayed under `max_gain_pct`
    pub fn is_quick_dump(
        &self,
        detection: DateTime<Utc>,
        within: chrono::Duration,
        max_gain_pct: f64,
    ) -> bool {
        match self.drop_50pct_timestamp {
            Some(ts) => ts - detection <= within && self.percentage_gain < max_gain_pct,
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    const ADDR: &str = "7xKXtg2CW87d97TXJSDpbD5jBkheTqA83TZRuJosgAsU";

    #[test]
    fn test_address_validation() {
        assert!(is_valid_address(ADDR));
        assert!(!is_valid_address("short"));
        assert!(!is_valid_address("0x0000000000000000000000000000000000000000")); // base58 rejects 0, l, I, O
        assert!(!is_valid_address(
            "SIMULATEDg2CW87d97TXJSDpbD5jBkheTqA83TZRu"
        ));
    }

    #[test]
    fn test_normalize_token_address_strips_pump_suffix() {
        let with_suffix = format!("{ADDR}pump");
        assert_eq!(normalize_token_address(&with_suffix).as_deref(), Some(ADDR));
        assert_eq!(normalize_token_address(ADDR).as_deref(), Some(ADDR));
        assert_eq!(normalize_token_address("garbage"), None);
    }

    #[test]
    fn test_token_identity_prefers_address() {
        let tx = sample_tx();
        assert_eq!(tx.token_identity(), TokenIdentity::Address(ADDR.into()));

        let mut symbol_only = sample_tx();
        symbol_only.token_address = None;
        assert_eq!(
            symbol_only.token_identity(),
            TokenIdentity::Symbol("FOO".into())
        );
    }

    #[test]
    fn test_wallet_identity_falls_back_to_label() {
        let mut tx = sample_tx();
        tx.wallet_address = None;
        tx.wallet_label = "  Whale #1  ".into();
        assert_eq!(tx.wallet_identity(), "whale #1");
    }

    #[test]
    fn test_tracker_identity_handle_insensitive() {
        let a = TrackerIdentity::new("CieloBot");
        let b = TrackerIdentity::with_id("cielobot", 42);
        assert_eq!(a, b);

        assert!(b.matches_sender(42, ""));
        assert!(a.matches_sender(7, "CIELOBOT"));
        assert!(!a.matches_sender(7, "other"));
    }

    #[test]
    fn test_tenant_settings_ranges() {
        assert!(TenantSettings::default().validate().is_ok());
        assert!(TenantSettings {
            min_wallets: 1,
            window_minutes: 60
        }
        .validate()
        .is_err());
        assert!(TenantSettings {
            min_wallets: 2,
            window_minutes: 30
        }
        .validate()
        .is_err());
        assert!(TenantSettings {
            min_wallets: 10,
            window_minutes: 2880
        }
        .validate()
        .is_ok());
    }

    #[test]
    fn test_quick_dump_rule() {
        let detection = Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap();
        let result = AthResult {
            token_address: ADDR.into(),
            initial_price: 1.0,
            ath_price: 1.2,
            ath_timestamp: detection,
            percentage_gain: 20.0,
            minutes_to_ath: 5,
            min_price_before_ath: 1.0,
            minutes_to_min_before_ath: 0,
            early_drops: vec![],
            drop_50pct_detected: true,
            drop_50pct_timestamp: Some(detection + chrono::Duration::minutes(90)),
            data_points: 10,
        };
        assert!(result.is_quick_dump(detection, chrono::Duration::hours(2), 50.0));

        let mut pumped = result.clone();
        pumped.percentage_gain = 120.0;
        assert!(!pumped.is_quick_dump(detection, chrono::Duration::hours(2), 50.0));
    }

    fn sample_tx() -> Transaction {
        Transaction {
            wallet_label: "#A".into(),
            wallet_address: Some("DYw8jCTfwHNRJhhmFcbXvVDTqWMEVFBX6ZKUmG5CNSKK".into()),
            side: TradeSide::Buy,
            token_symbol: "FOO".into(),
            token_address: Some(ADDR.into()),
            amount: 1_000_000.0,
            quote_amount: 1.5,
            quote_symbol: QuoteSymbol::Sol,
            usd_value: 250.0,
            market_cap: 150_000.0,
            timestamp: Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap(),
        }
    }
}
