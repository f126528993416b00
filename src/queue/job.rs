//! Ingestion job envelope and per-tenant statistics

use chrono::{DateTime, Utc};
use tokio::time::Instant;
use uuid::Uuid;

use crate::model::{Confluence, TenantId, Transaction};

/// Routing metadata attached to a job at enqueue time
#[derive(Debug, Clone)]
pub struct JobMeta {
    pub tracker_name: String,
    /// Uppercased token symbol of the inbound event
    pub token_hint: String,
    /// Token address of the inbound event, when resolved
    pub token_address_hint: Option<String>,
    pub enqueued_at: DateTime<Utc>,
}

/// One transaction moving through a tenant's queue
#[derive(Debug, Clone)]
pub struct IngestJob {
    pub id: Uuid,
    pub tenant: TenantId,
    pub payload: Transaction,
    pub meta: JobMeta,
    pub attempts: u32,
    /// Retry envelope: the job is not eligible before this instant
    pub not_before: Option<Instant>,
}

impl IngestJob {
    pub fn new(tenant: TenantId, tracker_name: &str, payload: Transaction) -> Self {
        let meta = JobMeta {
            tracker_name: tracker_name.to_string(),
            token_hint: payload.token_symbol.to_ascii_uppercase(),
            token_address_hint: payload.token_address.clone(),
            enqueued_at: Utc::now(),
        };
        Self {
            id: Uuid::new_v4(),
            tenant,
            payload,
            meta,
            attempts: 0,
            not_before: None,
        }
    }

    /// Whether the retry envelope allows processing now
    pub fn is_ready(&self, now: Instant) -> bool {
        match self.not_before {
            Some(t) => now >= t,
            None => true,
        }
    }

    /// Token-scope filter: only alerts for the token this job carried are
    /// forwarded. Detections for unrelated tokens that became eligible in
    /// the same pass are suppressed here.
    pub fn matches_alert(&self, confluence: &Confluence) -> bool {
        match (&self.meta.token_address_hint, &confluence.token_address) {
            (Some(hint), Some(addr)) => hint == addr,
            (None, None) => {
                confluence.token_symbol.eq_ignore_ascii_case(&self.meta.token_hint)
            }
            _ => false,
        }
    }
}

/// Rolling statistics for one tenant's queue
#[derive(Debug, Clone, Default)]
pub struct TenantStats {
    pub pending: usize,
    pub processed: u64,
    pub errors: u64,
    /// Jobs discarded by the hard cap
    pub dropped: u64,
    pub last_processed_at: Option<DateTime<Utc>>,
    /// Exponential moving average of processing time
    pub avg_processing_ms: f64,
}

impl TenantStats {
    /// Fold one processing duration into the moving average
    pub fn record_processed(&mut self, elapsed_ms: f64) {
        self.processed += 1;
        self.last_processed_at = Some(Utc::now());
        if self.avg_processing_ms == 0.0 {
            self.avg_processing_ms = elapsed_ms;
        } else {
            self.avg_processing_ms = self.avg_processing_ms * 0.8 + elapsed_ms * 0.2;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{QuoteSymbol, TradeSide};

    const ADDR: &str = "7xKXtg2CW87d97TXJSDpbD5jBkheTqA83TZRuJosgAsU";

    fn tx(address: Option<&str>) -> Transaction {
        Transaction {
            wallet_label: "#A".into(),
            wallet_address: None,
            side: TradeSide::Buy,
            token_symbol: "foo".into(),
            token_address: address.map(str::to_string),
            amount: 1.0,
            quote_amount: 1.0,
            quote_symbol: QuoteSymbol::Sol,
            usd_value: 0.0,
            market_cap: 0.0,
            timestamp: Utc::now(),
        }
    }

    fn confluence(symbol: &str, address: Option<&str>) -> Confluence {
        Confluence {
            tenant: TenantId(1),
            token_symbol: symbol.into(),
            token_address: address.map(str::to_string),
            detection_timestamp: Utc::now(),
            detection_market_cap: 0.0,
            wallet_count: 2,
            wallets: vec![],
            first_tx_timestamp: Utc::now(),
        }
    }

    #[test]
    fn test_token_scope_filter_by_address() {
        let job = IngestJob::new(TenantId(1), "t", tx(Some(ADDR)));
        assert!(job.matches_alert(&confluence("FOO", Some(ADDR))));
        assert!(!job.matches_alert(&confluence(
            "FOO",
            Some("9WzDXwBbmkg8ZTbNMqUxvQRAyrZzDsGYdLVL9zYtAWWM")
        )));
        // Address-hinted job never matches a symbol-keyed detection
        assert!(!job.matches_alert(&confluence("FOO", None)));
    }

    #[test]
    fn test_token_scope_filter_by_symbol() {
        let job = IngestJob::new(TenantId(1), "t", tx(None));
        assert!(job.matches_alert(&confluence("FOO", None)));
        assert!(!job.matches_alert(&confluence("BAR", None)));
        assert!(!job.matches_alert(&confluence("FOO", Some(ADDR))));
    }

    #[test]
    fn test_retry_envelope_readiness() {
        let mut job = IngestJob::new(TenantId(1), "t", tx(None));
        let now = Instant::now();
        assert!(job.is_ready(now));
        job.not_before = Some(now + std::time::Duration::from_secs(2));
        assert!(!job.is_ready(now));
        assert!(job.is_ready(now + std::time::Duration::from_secs(3)));
    }

    #[test]
    fn test_stats_moving_average() {
        let mut stats = TenantStats::default();
        stats.record_processed(10.0);
        assert_eq!(stats.avg_processing_ms, 10.0);
        stats.record_processed(20.0);
        assert!((stats.avg_processing_ms - 12.0).abs() < 1e-9);
        assert_eq!(stats.processed, 2);
    }
}
