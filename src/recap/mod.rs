//! Recap aggregator: consolidated performance view over a tenant's
//! confluence history
//!
//! Pure over its inputs: persisted confluences in the window go through the
//! analyzer, get classified into performance buckets, and come back as one
//! rendered payload with per-token, per-wallet, and group-wide views.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration as StdDuration;
use tracing::info;

use crate::analyzer::{AthAnalyzer, ScanOutcome, ScanRequest};
use crate::error::Result;
use crate::model::{AthResult, Confluence, TenantId};
use crate::store::Store;

/// Recap window bounds, hours
pub const MIN_WINDOW_HOURS: u32 = 1;
pub const MAX_WINDOW_HOURS: u32 = 168;

/// Weight applied to the first two distinct wallets at detection
const EARLY_WALLET_WEIGHT: f64 = 1.5;

/// Performance classification buckets, percent net outcome
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PerformanceBucket {
    LossBelow75,
    Loss50To75,
    Loss0To50,
    Gain0To50,
    Gain50To100,
    Gain100To200,
    Gain200To500,
    Gain500To1000,
    GainAbove1000,
}

impl PerformanceBucket {
    pub fn classify(net_pct: f64) -> Self {
        if net_pct <= -75.0 {
            PerformanceBucket::LossBelow75
        } else if net_pct <= -50.0 {
            PerformanceBucket::Loss50To75
        } else if net_pct < 0.0 {
            PerformanceBucket::Loss0To50
        } else if net_pct < 50.0 {
            PerformanceBucket::Gain0To50
        } else if net_pct < 100.0 {
            PerformanceBucket::Gain50To100
        } else if net_pct < 200.0 {
            PerformanceBucket::Gain100To200
        } else if net_pct < 500.0 {
            PerformanceBucket::Gain200To500
        } else if net_pct < 1000.0 {
            PerformanceBucket::Gain500To1000
        } else {
            PerformanceBucket::GainAbove1000
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            PerformanceBucket::LossBelow75 => "<= -75%",
            PerformanceBucket::Loss50To75 => "-75%..-50%",
            PerformanceBucket::Loss0To50 => "-50%..0%",
            PerformanceBucket::Gain0To50 => "0%..50%",
            PerformanceBucket::Gain50To100 => "50%..100%",
            PerformanceBucket::Gain100To200 => "100%..200%",
            PerformanceBucket::Gain200To500 => "200%..500%",
            PerformanceBucket::Gain500To1000 => "500%..1000%",
            PerformanceBucket::GainAbove1000 => ">= 1000%",
        }
    }
}

/// One analyzed token in the recap
#[derive(Debug, Clone)]
pub struct TokenRecap {
    pub symbol: String,
    pub address: String,
    pub detection_timestamp: DateTime<Utc>,
    pub detection_market_cap: f64,
    pub result: AthResult,
    pub net_pct: f64,
    pub bucket: PerformanceBucket,
    pub quick_dump: bool,
}

/// Per-wallet scorecard entry
#[derive(Debug, Clone)]
pub struct WalletScore {
    pub label: String,
    pub confluences: u32,
    pub weighted_score: f64,
    pub mean_pct: f64,
}

/// Group-wide statistics over analyzed tokens
#[derive(Debug, Clone, Default)]
pub struct GroupStats {
    /// Fraction of analyzed tokens reaching at least +100%
    pub hit_rate_100: f64,
    pub median_gain_pct: f64,
    pub mean_gain_pct: f64,
}

/// Full recap payload
#[derive(Debug, Clone)]
pub struct RecapReport {
    pub tenant: TenantId,
    pub window_hours: u32,
    pub total_confluences: usize,
    pub analyzed: usize,
    /// (token label, reason) for everything that could not be analyzed
    pub skipped: Vec<(String, &'static str)>,
    pub tokens: Vec<TokenRecap>,
    pub wallets: Vec<WalletScore>,
    pub stats: GroupStats,
}

/// Builds recap reports from the store and the analyzer
pub struct RecapAggregator {
    store: Arc<dyn Store>,
    analyzer: Arc<AthAnalyzer>,
    overall_deadline: StdDuration,
}

impl RecapAggregator {
    pub fn new(
        store: Arc<dyn Store>,
        analyzer: Arc<AthAnalyzer>,
        overall_deadline_secs: u64,
    ) -> Self {
        Self {
            store,
            analyzer,
            overall_deadline: StdDuration::from_secs(overall_deadline_secs),
        }
    }

    /// Build the recap for a tenant over the trailing window
    pub async fn build(&self, tenant: TenantId, window_hours: u32) -> Result<RecapReport> {
        let window_hours = window_hours.clamp(MIN_WINDOW_HOURS, MAX_WINDOW_HOURS);
        let until = Utc::now();
        let since = until - Duration::hours(window_hours as i64);

        let confluences = self.store.list_confluences(tenant, since, until).await?;
        info!(
            %tenant,
            window_hours,
            confluences = confluences.len(),
            "recap started"
        );

        let mut skipped: Vec<(String, &'static str)> = Vec::new();
        let mut analyzable: Vec<&Confluence> = Vec::new();
        for c in &confluences {
            match &c.token_address {
                Some(addr) if !addr.is_empty() => analyzable.push(c),
                _ => skipped.push((c.token_symbol.clone(), "no address")),
            }
        }

        let requests: Vec<ScanRequest> = analyzable
            .iter()
            .map(|c| ScanRequest {
                token_address: c.token_address.clone().unwrap_or_default(),
                detection_time: c.detection_timestamp,
                initial_market_cap: c.detection_market_cap,
                end_time: until,
            })
            .collect();

        let deadline = tokio::time::Instant::now() + self.overall_deadline;
        let outcomes = self.analyzer.analyze_batch_until(&requests, deadline).await;

        let mut tokens = Vec::new();
        for (idx, confluence) in analyzable.iter().enumerate() {
            match outcomes.get(idx) {
                Some(ScanOutcome::Complete(result)) => {
                    tokens.push(Self::token_recap(confluence, result.clone()));
                }
                Some(outcome) => {
                    skipped.push((confluence.token_symbol.clone(), outcome.reason()));
                }
                // Deadline cut the batch short
                None => skipped.push((confluence.token_symbol.clone(), "deadline")),
            }
        }

        tokens.sort_by(|a, b| {
            b.net_pct
                .partial_cmp(&a.net_pct)
                .unwrap_or(std::cmp::Ordering::Equal)
        });

        let wallets = Self::wallet_scores(&confluences, &tokens);
        let stats = Self::group_stats(&tokens);

        Ok(RecapReport {
            tenant,
            window_hours,
            total_confluences: confluences.len(),
            analyzed: tokens.len(),
            skipped,
            tokens,
            wallets,
            stats,
        })
    }

    fn token_recap(confluence: &Confluence, result: AthResult) -> TokenRecap {
        let net_pct = net_performance(&result);
        let quick_dump = result.is_quick_dump(
            confluence.detection_timestamp,
            Duration::hours(2),
            50.0,
        );
        TokenRecap {
            symbol: confluence.token_symbol.clone(),
            address: result.token_address.clone(),
            detection_timestamp: confluence.detection_timestamp,
            detection_market_cap: confluence.detection_market_cap,
            net_pct,
            bucket: PerformanceBucket::classify(net_pct),
            quick_dump,
            result,
        }
    }

    /// Per-wallet scorecard: the first two distinct wallets at detection are
    /// the early callers and weigh 1.5x
    fn wallet_scores(confluences: &[Confluence], tokens: &[TokenRecap]) -> Vec<WalletScore> {
        let by_key: HashMap<(Option<&str>, i64), &TokenRecap> = tokens
            .iter()
            .map(|t| {
                (
                    (Some(t.address.as_str()), t.detection_timestamp.timestamp()),
                    t,
                )
            })
            .collect();

        struct Acc {
            confluences: u32,
            weighted: f64,
            sum_pct: f64,
            scored: u32,
        }
        let mut acc: HashMap<String, Acc> = HashMap::new();

        for confluence in confluences {
            let recap = by_key.get(&(
                confluence.token_address.as_deref(),
                confluence.detection_timestamp.timestamp(),
            ));
            for (idx, wallet) in confluence.wallets.iter().enumerate() {
                let entry = acc.entry(wallet.label.clone()).or_insert(Acc {
                    confluences: 0,
                    weighted: 0.0,
                    sum_pct: 0.0,
                    scored: 0,
                });
                entry.confluences += 1;
                if let Some(recap) = recap {
                    let weight = if idx < 2 { EARLY_WALLET_WEIGHT } else { 1.0 };
                    entry.weighted += weight * recap.net_pct;
                    entry.sum_pct += recap.net_pct;
                    entry.scored += 1;
                }
            }
        }

        let mut scores: Vec<WalletScore> = acc
            .into_iter()
            .map(|(label, a)| WalletScore {
                label,
                confluences: a.confluences,
                weighted_score: a.weighted,
                mean_pct: if a.scored > 0 {
                    a.sum_pct / a.scored as f64
                } else {
                    0.0
                },
            })
            .collect();
        scores.sort_by(|a, b| {
            b.weighted_score
                .partial_cmp(&a.weighted_score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        scores
    }

    fn group_stats(tokens: &[TokenRecap]) -> GroupStats {
        if tokens.is_empty() {
            return GroupStats::default();
        }
        let mut gains: Vec<f64> = tokens.iter().map(|t| t.result.percentage_gain).collect();
        gains.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));

        let hits = gains.iter().filter(|g| **g >= 100.0).count();
        let mid = gains.len() / 2;
        let median = if gains.len() % 2 == 0 {
            (gains[mid - 1] + gains[mid]) / 2.0
        } else {
            gains[mid]
        };
        GroupStats {
            hit_rate_100: hits as f64 / gains.len() as f64,
            median_gain_pct: median,
            mean_gain_pct: gains.iter().sum::<f64>() / gains.len() as f64,
        }
    }
}

/// Net performance metric used for bucket classification. ATH gain wins when
/// the token actually moved; a flat token that only bled maps to the deepest
/// drop threshold it crossed.
fn net_performance(result: &AthResult) -> f64 {
    if result.percentage_gain >= 1.0 {
        return result.percentage_gain;
    }
    result
        .early_drops
        .iter()
        .map(|d| d.threshold_pct)
        .max()
        .map(|deepest| -(deepest as f64))
        .unwrap_or(result.percentage_gain)
}

impl RecapReport {
    /// Render the report as the outbound text payload
    pub fn render(&self) -> String {
        let mut out = format!(
            "📊 Recap — last {}h\nconfluences: {}  analyzed: {}/{}\n",
            self.window_hours,
            self.total_confluences,
            self.analyzed,
            self.analyzed + self.skipped.len(),
        );

        if self.tokens.is_empty() {
            if self.skipped.is_empty() {
                out.push_str("no confluences in window\n");
            } else {
                out.push_str("no analyzable tokens:\n");
                for (token, reason) in &self.skipped {
                    out.push_str(&format!("  {token}: {reason}\n"));
                }
            }
            return out;
        }

        out.push_str("\nTokens:\n");
        for t in &self.tokens {
            out.push_str(&format!(
                "  {} {:+.1}% [{}] ath in {}m, MC at detection ${:.0}{}\n",
                t.symbol,
                t.net_pct,
                t.bucket.label(),
                t.result.minutes_to_ath,
                t.detection_market_cap,
                if t.quick_dump { " ⚠ quick dump" } else { "" },
            ));
        }

        if !self.wallets.is_empty() {
            out.push_str("\nWallets:\n");
            for w in self.wallets.iter().take(10) {
                out.push_str(&format!(
                    "  {} score {:+.1} over {} confluences (mean {:+.1}%)\n",
                    w.label, w.weighted_score, w.confluences, w.mean_pct,
                ));
            }
        }

        out.push_str(&format!(
            "\nhit rate >=100%: {:.0}%  median {:+.1}%  mean {:+.1}%\n",
            self.stats.hit_rate_100 * 100.0,
            self.stats.median_gain_pct,
            self.stats.mean_gain_pct,
        ));

        if !self.skipped.is_empty() {
            out.push_str(&format!("skipped: {}\n", self.skipped.len()));
        }
        out
    }
}
