//! Sliding-window bucket for one (tenant, token identity) pair
//!
//! Entries are kept in event-timestamp order regardless of arrival order, so
//! detection is stable under replay and late delivery. Eviction is driven by
//! event time, not arrival time.

use chrono::{DateTime, Duration, Utc};

use crate::model::{Confluence, ConfluenceWallet, TenantId, TokenIdentity, Transaction};

/// Hard cap on entries per bucket; a runaway tracker must not exhaust heap
const MAX_ENTRIES: usize = 2_000;

/// Ordered window of transactions for a single token
#[derive(Debug, Default)]
pub struct TokenBucket {
    entries: Vec<Transaction>,
}

/// The point at which the threshold wallet first appeared
#[derive(Debug, Clone)]
pub struct DetectionPoint {
    pub detection_timestamp: DateTime<Utc>,
    pub detection_market_cap: f64,
    pub wallet_count: u32,
    pub wallets: Vec<ConfluenceWallet>,
    pub first_tx_timestamp: DateTime<Utc>,
}

impl TokenBucket {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert in timestamp order. An event identical in
    /// (wallet, timestamp, amount) is not double-counted; returns false.
    pub fn insert(&mut self, tx: Transaction) -> bool {
        let key = tx.dedup_key();
        if self.entries.iter().any(|e| e.dedup_key() == key) {
            return false;
        }

        let idx = self
            .entries
            .partition_point(|e| e.timestamp <= tx.timestamp);
        self.entries.insert(idx, tx);

        if self.entries.len() > MAX_ENTRIES {
            self.entries.remove(0);
        }
        true
    }

    /// Evict entries with timestamps before the cutoff. Returns the number
    /// removed.
    pub fn evict_before(&mut self, cutoff: DateTime<Utc>) -> usize {
        let before = self.entries.len();
        self.entries.retain(|e| e.timestamp >= cutoff);
        before - self.entries.len()
    }

    /// Newest event timestamp; the reference point for event-time eviction
    pub fn newest_timestamp(&self) -> Option<DateTime<Utc>> {
        self.entries.last().map(|e| e.timestamp)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Distinct wallet identifiers currently in the window
    pub fn distinct_wallets(&self) -> usize {
        let mut seen = std::collections::HashSet::new();
        for e in &self.entries {
            seen.insert(e.wallet_identity());
        }
        seen.len()
    }

    /// Walk entries in time order and find where the `min_wallets`-th
    /// distinct wallet first appeared. Stable under re-runs: the same window
    /// contents always produce the same detection point.
    pub fn detect(&self, min_wallets: u32) -> Option<DetectionPoint> {
        if min_wallets == 0 {
            return None;
        }

        let mut first_seen: Vec<(String, &Transaction)> = Vec::new();
        let mut detection_event: Option<&Transaction> = None;

        for e in &self.entries {
            let identity = e.wallet_identity();
            if !first_seen.iter().any(|(id, _)| *id == identity) {
                first_seen.push((identity, e));
                if first_seen.len() == min_wallets as usize && detection_event.is_none() {
                    detection_event = Some(e);
                }
            }
        }

        let detection_event = detection_event?;

        let wallets: Vec<ConfluenceWallet> = first_seen
            .iter()
            .map(|(_, e)| ConfluenceWallet {
                label: e.wallet_label.clone(),
                side: e.side,
                amount: e.amount,
                quote_amount: e.quote_amount,
                timestamp: e.timestamp,
            })
            .collect();

        // Market cap at the detection event; mean of the contributing
        // events' caps when the tracker omitted it there
        let detection_market_cap = if detection_event.market_cap > 0.0 {
            detection_event.market_cap
        } else {
            let caps: Vec<f64> = first_seen
                .iter()
                .map(|(_, e)| e.market_cap)
                .filter(|mc| *mc > 0.0)
                .collect();
            if caps.is_empty() {
                0.0
            } else {
                caps.iter().sum::<f64>() / caps.len() as f64
            }
        };

        Some(DetectionPoint {
            detection_timestamp: detection_event.timestamp,
            detection_market_cap,
            wallet_count: first_seen.len() as u32,
            wallets,
            first_tx_timestamp: self.entries.first()?.timestamp,
        })
    }

    /// Build the confluence record for a detection under this identity
    pub fn to_confluence(
        &self,
        tenant: TenantId,
        identity: &TokenIdentity,
        point: DetectionPoint,
    ) -> Confluence {
        let token_symbol = self
            .entries
            .first()
            .map(|e| e.token_symbol.clone())
            .unwrap_or_default();
        Confluence {
            tenant,
            token_symbol,
            token_address: identity.address().map(str::to_string),
            detection_timestamp: point.detection_timestamp,
            detection_market_cap: point.detection_market_cap,
            wallet_count: point.wallet_count,
            wallets: point.wallets,
            first_tx_timestamp: point.first_tx_timestamp,
        }
    }

    /// Evict by event time relative to the newest entry. Window semantics for
    /// the ingest path.
    pub fn evict_by_window(&mut self, window: Duration) -> usize {
        match self.newest_timestamp() {
            Some(newest) => self.evict_before(newest - window),
            None => 0,
        }
    }
}
