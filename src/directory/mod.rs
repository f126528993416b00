//! Tracker directory: the live set of trackers and their tenant subscriptions
//!
//! The directory is read on every inbound message, so lookups go through a
//! copy-on-write snapshot republished under a writer lock. The snapshot is
//! refreshed from the durable store on a bounded poll interval and
//! immediately after any operator mutation.

use chrono::Utc;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::model::{
    Subscription, TenantId, TrackerType, MAX_SUBSCRIPTIONS_PER_TENANT,
};
use crate::store::Store;

/// Outcome of a subscribe attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscribeOutcome {
    Subscribed,
    /// Tenant already has the maximum number of active subscriptions
    MaxReached,
    /// The (tracker, tenant) pair is already active
    Duplicate,
}

/// Immutable view of the active subscription set
#[derive(Debug, Default)]
pub struct DirectorySnapshot {
    subscriptions: Vec<Subscription>,
}

impl DirectorySnapshot {
    /// All tracker handles with at least one active subscription (lowercased)
    pub fn active_trackers(&self) -> HashSet<String> {
        self.subscriptions
            .iter()
            .map(|s| s.tracker.to_ascii_lowercase())
            .collect()
    }

    /// Subscribers of a tracker with their recorded format type
    pub fn subscribers(&self, tracker: &str) -> Vec<(TenantId, TrackerType)> {
        self.subscriptions
            .iter()
            .filter(|s| s.tracker.eq_ignore_ascii_case(tracker))
            .map(|s| (s.tenant, s.tracker_type))
            .collect()
    }

    pub fn subscription_count(&self, tenant: TenantId) -> usize {
        self.subscriptions
            .iter()
            .filter(|s| s.tenant == tenant)
            .count()
    }

    pub fn has_subscription(&self, tracker: &str, tenant: TenantId) -> bool {
        self.subscriptions
            .iter()
            .any(|s| s.tenant == tenant && s.tracker.eq_ignore_ascii_case(tracker))
    }

    pub fn tenants(&self) -> HashSet<TenantId> {
        self.subscriptions.iter().map(|s| s.tenant).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.subscriptions.is_empty()
    }

    pub fn len(&self) -> usize {
        self.subscriptions.len()
    }
}

/// Subscription registry backed by the durable store
pub struct TrackerDirectory {
    store: Arc<dyn Store>,
    snapshot: RwLock<Arc<DirectorySnapshot>>,
}

impl TrackerDirectory {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self {
            store,
            snapshot: RwLock::new(Arc::new(DirectorySnapshot::default())),
        }
    }

    /// Current snapshot; cheap to clone, safe to hold across awaits
    pub async fn snapshot(&self) -> Arc<DirectorySnapshot> {
        self.snapshot.read().await.clone()
    }

    /// Activate a tracker for a tenant
    pub async fn subscribe(
        &self,
        tracker: &str,
        tenant: TenantId,
        tracker_type: TrackerType,
        actor: &str,
    ) -> Result<SubscribeOutcome> {
        {
            let snapshot = self.snapshot.read().await;
            if snapshot.has_subscription(tracker, tenant) {
                return Ok(SubscribeOutcome::Duplicate);
            }
            if snapshot.subscription_count(tenant) >= MAX_SUBSCRIPTIONS_PER_TENANT {
                return Ok(SubscribeOutcome::MaxReached);
            }
        }

        let sub = Subscription {
            tracker: tracker.to_string(),
            tenant,
            tracker_type,
            active: true,
            setup_actor: actor.to_string(),
            created_at: Utc::now(),
        };
        self.store.upsert_subscription(&sub).await?;
        self.refresh().await?;

        info!(tracker, %tenant, %tracker_type, actor, "subscription added");
        Ok(SubscribeOutcome::Subscribed)
    }

    /// Deactivate a tracker for a tenant. Returns true when it existed.
    pub async fn unsubscribe(&self, tracker: &str, tenant: TenantId) -> Result<bool> {
        let removed = self.store.remove_subscription(tracker, tenant).await?;
        if removed {
            self.refresh().await?;
            info!(tracker, %tenant, "subscription removed");
        } else {
            debug!(tracker, %tenant, "unsubscribe for unknown subscription");
        }
        Ok(removed)
    }

    /// Reload the snapshot from the durable store
    pub async fn refresh(&self) -> Result<()> {
        let subscriptions = self.store.list_active_subscriptions().await?;
        let next = Arc::new(DirectorySnapshot { subscriptions });
        *self.snapshot.write().await = next;
        Ok(())
    }

    /// Periodic refresh loop; runs until cancelled
    pub async fn run_refresh_loop(&self, interval_secs: u64, cancel: CancellationToken) {
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(interval_secs));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("directory refresh loop stopped");
                    return;
                }
                _ = interval.tick() => {
                    if let Err(e) = self.refresh().await {
                        warn!(error = %e, "directory refresh failed");
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    async fn directory() -> TrackerDirectory {
        TrackerDirectory::new(Arc::new(MemoryStore::new()))
    }

    #[tokio::test]
    async fn test_subscribe_and_lookup() {
        let dir = directory().await;
        let outcome = dir
            .subscribe("CieloBot", TenantId(1), TrackerType::A, "op")
            .await
            .unwrap();
        assert_eq!(outcome, SubscribeOutcome::Subscribed);

        let snapshot = dir.snapshot().await;
        assert!(snapshot.active_trackers().contains("cielobot"));
        assert_eq!(
            snapshot.subscribers("cielobot"),
            vec![(TenantId(1), TrackerType::A)]
        );
    }

    #[tokio::test]
    async fn test_duplicate_subscription() {
        let dir = directory().await;
        dir.subscribe("t", TenantId(1), TrackerType::A, "op")
            .await
            .unwrap();
        let outcome = dir
            .subscribe("T", TenantId(1), TrackerType::B, "op")
            .await
            .unwrap();
        assert_eq!(outcome, SubscribeOutcome::Duplicate);
    }

    #[tokio::test]
    async fn test_subscription_cap() {
        let dir = directory().await;
        for i in 0..MAX_SUBSCRIPTIONS_PER_TENANT {
            let outcome = dir
                .subscribe(&format!("tracker{i}"), TenantId(1), TrackerType::A, "op")
                .await
                .unwrap();
            assert_eq!(outcome, SubscribeOutcome::Subscribed);
        }
        let outcome = dir
            .subscribe("one-too-many", TenantId(1), TrackerType::A, "op")
            .await
            .unwrap();
        assert_eq!(outcome, SubscribeOutcome::MaxReached);

        // A different tenant is unaffected by the cap
        let outcome = dir
            .subscribe("tracker0", TenantId(2), TrackerType::A, "op")
            .await
            .unwrap();
        assert_eq!(outcome, SubscribeOutcome::Subscribed);
    }

    #[tokio::test]
    async fn test_unsubscribe_restores_prior_state() {
        let dir = directory().await;
        dir.subscribe("t", TenantId(1), TrackerType::A, "op")
            .await
            .unwrap();
        assert!(dir.unsubscribe("t", TenantId(1)).await.unwrap());
        assert!(!dir.unsubscribe("t", TenantId(1)).await.unwrap());

        let snapshot = dir.snapshot().await;
        assert!(snapshot.is_empty());
    }

    #[tokio::test]
    async fn test_same_tracker_multiple_tenants_with_types() {
        let dir = directory().await;
        dir.subscribe("t", TenantId(1), TrackerType::A, "op")
            .await
            .unwrap();
        dir.subscribe("t", TenantId(2), TrackerType::B, "op")
            .await
            .unwrap();

        let mut subscribers = dir.snapshot().await.subscribers("t");
        subscribers.sort_by_key(|(tenant, _)| tenant.0);
        assert_eq!(
            subscribers,
            vec![(TenantId(1), TrackerType::A), (TenantId(2), TrackerType::B)]
        );
    }
}
