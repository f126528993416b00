//! CoreServices: explicit ownership of every long-lived component
//!
//! One construct owns the store, directory, engines, analyzer, sinks, and
//! session pool, and spawns the background tasks. Nothing in the crate holds
//! module-level state; anything a component needs is threaded through here.

use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::alert::{AlertSink, LogAlertSink};
use crate::analyzer::{AthAnalyzer, HttpPriceHistoryClient, PriceHistorySource};
use crate::config::Config;
use crate::directory::{SubscribeOutcome, TrackerDirectory};
use crate::engine::ConfluenceEngine;
use crate::error::Result;
use crate::model::{TenantId, TrackerType};
use crate::queue::QueueEngine;
use crate::recap::RecapAggregator;
use crate::router::FanInRouter;
use crate::session::{RelaySession, SessionEvent, SessionManager, UpdateSource};
use crate::store::Store;

/// The assembled service graph
pub struct CoreServices {
    pub config: Config,
    pub store: Arc<dyn Store>,
    pub directory: Arc<TrackerDirectory>,
    pub engine: Arc<ConfluenceEngine>,
    pub queue: Arc<QueueEngine>,
    pub analyzer: Arc<AthAnalyzer>,
    pub recap: Arc<RecapAggregator>,
    pub sessions: Arc<SessionManager>,
    pub router: Arc<FanInRouter>,
    events: async_channel::Receiver<SessionEvent>,
    cancel: CancellationToken,
}

impl CoreServices {
    /// Assemble with production defaults: configured store, HTTP price
    /// client, log alert sink, relay sessions from config
    pub async fn init(config: Config) -> Result<Self> {
        let store = crate::store::open(&config.store).await?;
        let price_source: Arc<dyn PriceHistorySource> =
            Arc::new(HttpPriceHistoryClient::new(&config.price_api));
        let alerts: Arc<dyn AlertSink> = Arc::new(LogAlertSink);
        let sources: Vec<Arc<dyn UpdateSource>> = config
            .sessions
            .relays
            .iter()
            .map(|cred| {
                Arc::new(RelaySession::new(cred, &config.sessions)) as Arc<dyn UpdateSource>
            })
            .collect();
        Ok(Self::assemble(config, store, price_source, alerts, sources))
    }

    /// Assemble from explicit parts; the seam used by tests and tooling
    pub fn assemble(
        config: Config,
        store: Arc<dyn Store>,
        price_source: Arc<dyn PriceHistorySource>,
        alerts: Arc<dyn AlertSink>,
        sources: Vec<Arc<dyn UpdateSource>>,
    ) -> Self {
        let directory = Arc::new(TrackerDirectory::new(store.clone()));
        let engine = Arc::new(ConfluenceEngine::new(
            store.clone(),
            config.detection.default_settings(),
            config.sweeper.retention_hours,
        ));
        let queue = QueueEngine::new(
            config.queue.clone(),
            store.clone(),
            engine.clone(),
            alerts,
        );
        let analyzer = Arc::new(AthAnalyzer::new(
            price_source,
            &config.price_api,
            config.analyzer.clone(),
        ));
        let recap = Arc::new(RecapAggregator::new(
            store.clone(),
            analyzer.clone(),
            config.recap.overall_deadline_secs,
        ));
        let (sessions, events) = SessionManager::new(sources, &config.sessions);
        let router = Arc::new(FanInRouter::new(directory.clone(), queue.clone(), None));

        Self {
            config,
            store,
            directory,
            engine,
            queue,
            analyzer,
            recap,
            sessions: Arc::new(sessions),
            router,
            events,
            cancel: CancellationToken::new(),
        }
    }

    /// Spawn all background tasks and block until shutdown
    pub async fn run(&self) -> Result<()> {
        self.directory.refresh().await?;
        info!(
            subscriptions = self.directory.snapshot().await.len(),
            "directory loaded"
        );

        let directory = self.directory.clone();
        let refresh_secs = self.config.directory.refresh_secs;
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            directory.run_refresh_loop(refresh_secs, cancel).await;
        });

        let engine = self.engine.clone();
        let sweep_secs = self.config.sweeper.interval_secs;
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            engine.run_sweep_loop(sweep_secs, cancel).await;
        });

        tokio::spawn(self.queue.clone().run(self.cancel.clone()));

        let router = self.router.clone();
        let events = self.events.clone();
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            router.run(events, cancel).await;
        });

        self.sessions.start_all().await;
        let sessions = self.sessions.clone();
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            sessions.run_probe_loop(cancel).await;
        });

        info!("confluence service running");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("shutdown signal received");
            }
            _ = self.cancel.cancelled() => {}
        }
        self.shutdown().await;
        Ok(())
    }

    /// Stop every background task
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        self.sessions.shutdown().await;
        info!("confluence service stopped");
    }

    /// Operator subscribe, delegated to the directory
    pub async fn subscribe(
        &self,
        tracker: &str,
        tenant: TenantId,
        tracker_type: TrackerType,
        actor: &str,
    ) -> Result<SubscribeOutcome> {
        self.directory
            .subscribe(tracker, tenant, tracker_type, actor)
            .await
    }

    /// Operator unsubscribe with the transitive cleanup the contract
    /// requires: cancel queued work, evict buckets, purge history, and
    /// unbind the sender when no other tenant still follows the tracker
    pub async fn unsubscribe(&self, tracker: &str, tenant: TenantId) -> Result<bool> {
        let removed = self.directory.unsubscribe(tracker, tenant).await?;
        if !removed {
            return Ok(false);
        }

        self.queue.cancel_tenant(tenant).await;
        self.engine.evict_tenant(tenant).await;
        let purged = self.store.purge_confluences(tenant).await?;

        let snapshot = self.directory.snapshot().await;
        if snapshot.subscribers(tracker).is_empty() {
            self.router.unbind(tracker);
        }

        info!(tracker, %tenant, purged, "subscription torn down");
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alert::ChannelAlertSink;
    use crate::analyzer::{PricePoint, Resolution};
    use crate::error::Result as CrateResult;
    use crate::store::MemoryStore;
    use async_trait::async_trait;
    use chrono::{DateTime, Utc};

    struct NoPrices;

    #[async_trait]
    impl PriceHistorySource for NoPrices {
        async fn price_history(
            &self,
            _token: &str,
            _from: DateTime<Utc>,
            _to: DateTime<Utc>,
            _resolution: Resolution,
        ) -> CrateResult<Vec<PricePoint>> {
            Ok(vec![])
        }
    }

    fn services(store: Arc<MemoryStore>) -> CoreServices {
        let (sink, _rx) = ChannelAlertSink::new();
        CoreServices::assemble(
            Config::default(),
            store,
            Arc::new(NoPrices),
            Arc::new(sink),
            vec![],
        )
    }

    #[tokio::test]
    async fn test_subscribe_unsubscribe_roundtrip() {
        let store = Arc::new(MemoryStore::new());
        let core = services(store.clone());
        let tenant = TenantId(1);

        let outcome = core
            .subscribe("tracker", tenant, TrackerType::A, "op")
            .await
            .unwrap();
        assert_eq!(outcome, SubscribeOutcome::Subscribed);

        assert!(core.unsubscribe("tracker", tenant).await.unwrap());

        // Directory back to prior state, nothing retained
        assert!(core.directory.snapshot().await.is_empty());
        assert_eq!(core.engine.bucket_count(), 0);
        assert_eq!(store.confluence_count().await, 0);
        assert!(core.queue.stats(tenant).await.is_none());

        assert!(!core.unsubscribe("tracker", tenant).await.unwrap());
    }
}
