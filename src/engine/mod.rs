//! Confluence engine: sliding-window aggregation and detection
//!
//! Buckets are keyed by (tenant, token identity) and never cross tenants.
//! The queue engine serializes ingestion per tenant, so a bucket is only
//! ever mutated by one task at a time; the sweep takes the same per-bucket
//! locks and therefore cannot interleave mid-ingestion.

mod bucket;

pub use bucket::{DetectionPoint, TokenBucket};

use chrono::{Duration, Utc};
use dashmap::DashMap;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration as StdDuration;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::model::{Confluence, TenantId, TenantSettings, TokenIdentity, Transaction};
use crate::store::Store;

/// Outcome counters for one sweep pass
#[derive(Debug, Default, Clone, Copy)]
pub struct SweepStats {
    pub evicted_entries: usize,
    pub dropped_buckets: usize,
    pub pruned_transactions: u64,
}

/// Sliding-window confluence detector
pub struct ConfluenceEngine {
    store: Arc<dyn Store>,
    default_settings: TenantSettings,
    buckets: DashMap<(TenantId, TokenIdentity), Arc<Mutex<TokenBucket>>>,
    /// Detections already emitted this process: (tenant, identity, detection ts)
    emitted: Mutex<HashSet<(TenantId, TokenIdentity, i64)>>,
    /// (tenant, symbol) -> addresses seen; drives the one-shot collision warning
    symbol_addresses: Mutex<HashMap<(TenantId, String), HashSet<String>>>,
    retention: Duration,
}

impl ConfluenceEngine {
    pub fn new(
        store: Arc<dyn Store>,
        default_settings: TenantSettings,
        retention_hours: u64,
    ) -> Self {
        Self {
            store,
            default_settings,
            buckets: DashMap::new(),
            emitted: Mutex::new(HashSet::new()),
            symbol_addresses: Mutex::new(HashMap::new()),
            retention: Duration::hours(retention_hours as i64),
        }
    }

    /// Tenant settings snapshot for one detection pass
    async fn settings_for(&self, tenant: TenantId) -> TenantSettings {
        match self.store.get_tenant_settings(tenant).await {
            Ok(Some(settings)) => settings,
            Ok(None) => self.default_settings,
            Err(e) => {
                warn!(%tenant, error = %e, "settings load failed, using defaults");
                self.default_settings
            }
        }
    }

    /// Ingest one transaction and return any newly detected confluences.
    ///
    /// Emission is conditioned on successful persistence: a detection that
    /// cannot be stored after retries is not returned, so a crash never
    /// causes double alerts and a replay re-detects it cleanly.
    pub async fn ingest(&self, tenant: TenantId, tx: Transaction) -> Result<Vec<Confluence>> {
        let settings = self.settings_for(tenant).await;
        let identity = tx.token_identity();

        self.note_symbol_address(tenant, &tx).await;

        let candidate = {
            let bucket = Arc::clone(
                self.buckets
                    .entry((tenant, identity.clone()))
                    .or_insert_with(|| Arc::new(Mutex::new(TokenBucket::new())))
                    .value(),
            );
            let mut bucket = bucket.lock().await;

            if !bucket.insert(tx) {
                debug!(%tenant, token = %identity, "duplicate event ignored");
            }
            bucket.evict_by_window(settings.window());

            match bucket.detect(settings.min_wallets) {
                Some(point) => Some(bucket.to_confluence(tenant, &identity, point)),
                None => None,
            }
        };

        let Some(confluence) = candidate else {
            return Ok(vec![]);
        };

        // Suppress re-emission of a detection we already handed off
        let key = confluence.dedup_key();
        {
            let emitted = self.emitted.lock().await;
            if emitted.contains(&key) {
                return Ok(vec![]);
            }
        }
        if self
            .store
            .has_confluence(tenant, &identity, confluence.detection_timestamp)
            .await?
        {
            self.emitted.lock().await.insert(key);
            return Ok(vec![]);
        }

        if !self.persist_with_retry(&confluence).await {
            warn!(
                %tenant,
                token = %identity,
                "confluence persistence failed, withholding alert"
            );
            return Ok(vec![]);
        }

        self.emitted.lock().await.insert(key);
        info!(
            %tenant,
            token = %identity,
            wallets = confluence.wallet_count,
            detection = %confluence.detection_timestamp,
            "confluence detected"
        );
        Ok(vec![confluence])
    }

    /// Store the confluence, retrying transient failures briefly
    async fn persist_with_retry(&self, confluence: &Confluence) -> bool {
        let policy = backoff::ExponentialBackoff {
            initial_interval: StdDuration::from_millis(200),
            max_interval: StdDuration::from_secs(2),
            max_elapsed_time: Some(StdDuration::from_secs(10)),
            ..Default::default()
        };
        let result = backoff::future::retry(policy, || async {
            self.store.store_confluence(confluence).await.map_err(|e| {
                if e.is_retryable() {
                    backoff::Error::transient(e)
                } else {
                    backoff::Error::permanent(e)
                }
            })
        })
        .await;
        match result {
            Ok(_) => true,
            Err(e) => {
                warn!(error = %e, "confluence store failed after retries");
                false
            }
        }
    }

    /// One-shot warning when the same symbol shows up under multiple
    /// distinct addresses for a tenant
    async fn note_symbol_address(&self, tenant: TenantId, tx: &Transaction) {
        let Some(addr) = tx.token_address.as_deref() else {
            return;
        };
        let mut map = self.symbol_addresses.lock().await;
        let entry = map
            .entry((tenant, tx.token_symbol.clone()))
            .or_default();
        entry.insert(addr.to_string());
        if entry.len() == 2 {
            warn!(
                %tenant,
                symbol = %tx.token_symbol,
                "symbol maps to multiple distinct addresses; buckets stay separate"
            );
        }
    }

    /// Evict stale entries across all buckets against wall-clock time and
    /// drop buckets that became empty
    pub async fn sweep(&self) -> SweepStats {
        let now = Utc::now();
        let mut stats = SweepStats::default();
        let mut settings_cache: HashMap<TenantId, TenantSettings> = HashMap::new();

        let keys: Vec<(TenantId, TokenIdentity)> =
            self.buckets.iter().map(|e| e.key().clone()).collect();

        for key in keys {
            let settings = match settings_cache.get(&key.0) {
                Some(s) => *s,
                None => {
                    let s = self.settings_for(key.0).await;
                    settings_cache.insert(key.0, s);
                    s
                }
            };
            let cutoff = now - settings.window();

            let bucket = match self.buckets.get(&key) {
                Some(b) => Arc::clone(b.value()),
                None => continue,
            };
            {
                let mut bucket = bucket.lock().await;
                stats.evicted_entries += bucket.evict_before(cutoff);
            }
            // Only drop the entry if no ingest holds the bucket right now
            let removed = self
                .buckets
                .remove_if(&key, |_, b| {
                    b.try_lock().map(|b| b.is_empty()).unwrap_or(false)
                })
                .is_some();
            if removed {
                stats.dropped_buckets += 1;
            }
        }

        match self.store.prune_transactions(now - self.retention).await {
            Ok(pruned) => stats.pruned_transactions = pruned,
            Err(e) => warn!(error = %e, "transaction retention prune failed"),
        }

        if stats.evicted_entries > 0 || stats.dropped_buckets > 0 {
            debug!(
                evicted = stats.evicted_entries,
                dropped = stats.dropped_buckets,
                pruned = stats.pruned_transactions,
                "sweep completed"
            );
        }
        stats
    }

    /// Drop all in-memory state for a tenant (subscription removal path)
    pub async fn evict_tenant(&self, tenant: TenantId) -> usize {
        let before = self.buckets.len();
        self.buckets.retain(|(t, _), _| *t != tenant);
        let dropped = before - self.buckets.len();

        self.emitted.lock().await.retain(|(t, _, _)| *t != tenant);
        self.symbol_addresses
            .lock()
            .await
            .retain(|(t, _), _| *t != tenant);

        if dropped > 0 {
            info!(%tenant, buckets = dropped, "tenant buckets evicted");
        }
        dropped
    }

    /// Number of live buckets (status output)
    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    /// Periodic sweep loop; runs until cancelled
    pub async fn run_sweep_loop(&self, interval_secs: u64, cancel: CancellationToken) {
        let mut interval = tokio::time::interval(StdDuration::from_secs(interval_secs));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("sweep loop stopped");
                    return;
                }
                _ = interval.tick() => {
                    self.sweep().await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{QuoteSymbol, TradeSide};
    use crate::store::MemoryStore;
    use chrono::TimeZone;

    const ADDR: &str = "7xKXtg2CW87d97TXJSDpbD5jBkheTqA83TZRuJosgAsU";
    const ADDR2: &str = "9WzDXwBbmkg8ZTbNMqUxvQRAyrZzDsGYdLVL9zYtAWWM";

    fn tx(wallet: &str, minute: i64, address: Option<&str>) -> Transaction {
        Transaction {
            wallet_label: wallet.into(),
            wallet_address: None,
            side: TradeSide::Buy,
            token_symbol: "FOO".into(),
            token_address: address.map(str::to_string),
            amount: 100.0,
            quote_amount: 1.0,
            quote_symbol: QuoteSymbol::Sol,
            usd_value: 200.0,
            market_cap: 50_000.0,
            timestamp: Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap()
                + Duration::minutes(minute),
        }
    }

    fn engine() -> (ConfluenceEngine, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let engine = ConfluenceEngine::new(store.clone(), TenantSettings::default(), 48);
        (engine, store)
    }

    #[tokio::test]
    async fn test_basic_confluence_two_wallets() {
        let (engine, store) = engine();
        let tenant = TenantId(1);

        let none = engine.ingest(tenant, tx("#A", 0, Some(ADDR))).await.unwrap();
        assert!(none.is_empty());

        let detected = engine.ingest(tenant, tx("#B", 5, Some(ADDR))).await.unwrap();
        assert_eq!(detected.len(), 1);
        let c = &detected[0];
        assert_eq!(c.wallet_count, 2);
        assert_eq!(
            c.detection_timestamp,
            Utc.with_ymd_and_hms(2024, 6, 1, 12, 5, 0).unwrap()
        );
        assert_eq!(c.token_address.as_deref(), Some(ADDR));
        assert_eq!(store.confluence_count().await, 1);
    }

    #[tokio::test]
    async fn test_address_and_symbol_buckets_never_merge() {
        let (engine, _) = engine();
        let tenant = TenantId(1);

        engine.ingest(tenant, tx("#A", 0, Some(ADDR))).await.unwrap();
        // Same symbol, no address: separate bucket, no confluence
        let out = engine.ingest(tenant, tx("#B", 5, None)).await.unwrap();
        assert!(out.is_empty());
        assert_eq!(engine.bucket_count(), 2);
    }

    #[tokio::test]
    async fn test_tenants_are_isolated() {
        let (engine, _) = engine();
        engine.ingest(TenantId(1), tx("#A", 0, Some(ADDR))).await.unwrap();
        let out = engine
            .ingest(TenantId(2), tx("#B", 5, Some(ADDR)))
            .await
            .unwrap();
        assert!(out.is_empty());
    }

    #[tokio::test]
    async fn test_same_detection_not_reemitted() {
        let (engine, store) = engine();
        let tenant = TenantId(1);

        engine.ingest(tenant, tx("#A", 0, Some(ADDR))).await.unwrap();
        let first = engine.ingest(tenant, tx("#B", 5, Some(ADDR))).await.unwrap();
        assert_eq!(first.len(), 1);

        // A third wallet joins; detection point is unchanged, no re-emission
        let third = engine.ingest(tenant, tx("#C", 10, Some(ADDR))).await.unwrap();
        assert!(third.is_empty());
        assert_eq!(store.confluence_count().await, 1);
    }

    #[tokio::test]
    async fn test_replayed_event_not_double_counted() {
        let (engine, store) = engine();
        let tenant = TenantId(1);

        engine.ingest(tenant, tx("#A", 0, Some(ADDR))).await.unwrap();
        engine.ingest(tenant, tx("#A", 0, Some(ADDR))).await.unwrap();
        let out = engine.ingest(tenant, tx("#A", 0, Some(ADDR))).await.unwrap();
        assert!(out.is_empty());

        let detected = engine.ingest(tenant, tx("#B", 5, Some(ADDR))).await.unwrap();
        assert_eq!(detected.len(), 1);
        assert_eq!(store.confluence_count().await, 1);
    }

    #[tokio::test]
    async fn test_sliding_eviction_prevents_stale_confluence() {
        let (engine, store) = engine();
        let tenant = TenantId(1);
        store
            .upsert_tenant_settings(
                tenant,
                TenantSettings {
                    min_wallets: 2,
                    window_minutes: 60,
                },
            )
            .await
            .unwrap();

        engine.ingest(tenant, tx("#A", 0, Some(ADDR))).await.unwrap();
        // 65 minutes later: #A evicted by event-time window, only #C remains
        let out = engine.ingest(tenant, tx("#C", 65, Some(ADDR))).await.unwrap();
        assert!(out.is_empty());
        assert_eq!(store.confluence_count().await, 0);
    }

    #[tokio::test]
    async fn test_detection_exactly_at_window_boundary() {
        let (engine, _) = engine();
        let tenant = TenantId(1);
        let store = engine.store.clone();
        store
            .upsert_tenant_settings(
                tenant,
                TenantSettings {
                    min_wallets: 2,
                    window_minutes: 60,
                },
            )
            .await
            .unwrap();

        engine.ingest(tenant, tx("#A", 0, Some(ADDR))).await.unwrap();
        let detected = engine.ingest(tenant, tx("#B", 60, Some(ADDR))).await.unwrap();
        assert_eq!(detected.len(), 1);
    }

    #[tokio::test]
    async fn test_restart_replay_suppressed_by_store() {
        let store = Arc::new(MemoryStore::new());
        let tenant = TenantId(1);

        {
            let engine = ConfluenceEngine::new(store.clone(), TenantSettings::default(), 48);
            engine.ingest(tenant, tx("#A", 0, Some(ADDR))).await.unwrap();
            let out = engine.ingest(tenant, tx("#B", 5, Some(ADDR))).await.unwrap();
            assert_eq!(out.len(), 1);
        }

        // Fresh engine (post-restart): same replayed events, store dedup wins
        let engine = ConfluenceEngine::new(store.clone(), TenantSettings::default(), 48);
        engine.ingest(tenant, tx("#A", 0, Some(ADDR))).await.unwrap();
        let out = engine.ingest(tenant, tx("#B", 5, Some(ADDR))).await.unwrap();
        assert!(out.is_empty());
        assert_eq!(store.confluence_count().await, 1);
    }

    #[tokio::test]
    async fn test_evict_tenant_drops_buckets() {
        let (engine, _) = engine();
        engine.ingest(TenantId(1), tx("#A", 0, Some(ADDR))).await.unwrap();
        engine.ingest(TenantId(2), tx("#A", 0, Some(ADDR))).await.unwrap();

        assert_eq!(engine.evict_tenant(TenantId(1)).await, 1);
        assert_eq!(engine.bucket_count(), 1);
    }

    #[tokio::test]
    async fn test_sweep_drops_empty_buckets() {
        let (engine, _) = engine();
        let tenant = TenantId(1);
        // Events far in the past relative to wall clock
        engine.ingest(tenant, tx("#A", 0, Some(ADDR))).await.unwrap();
        engine.ingest(tenant, tx("#B", 1, Some(ADDR2))).await.unwrap();
        assert_eq!(engine.bucket_count(), 2);

        let stats = engine.sweep().await;
        assert_eq!(stats.dropped_buckets, 2);
        assert_eq!(engine.bucket_count(), 0);
    }

    #[tokio::test]
    async fn test_symbol_collision_tracked_once() {
        let (engine, _) = engine();
        let tenant = TenantId(1);
        engine.ingest(tenant, tx("#A", 0, Some(ADDR))).await.unwrap();
        engine.ingest(tenant, tx("#B", 1, Some(ADDR2))).await.unwrap();

        let map = engine.symbol_addresses.lock().await;
        let addrs = map.get(&(tenant, "FOO".to_string())).unwrap();
        assert_eq!(addrs.len(), 2);
    }
}
