//! In-memory store used by tests and as the default for dry runs

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use tokio::sync::RwLock;

use super::Store;
use crate::error::Result;
use crate::model::{Confluence, Subscription, TenantId, TenantSettings, TokenIdentity, Transaction};

#[derive(Default)]
struct Inner {
    /// Transaction dedup keys: (tenant, timestamp, wallet label, token identity)
    transaction_keys: HashSet<(TenantId, i64, String, String)>,
    transactions: Vec<(TenantId, Transaction)>,
    confluences: Vec<Confluence>,
    subscriptions: HashMap<(String, TenantId), Subscription>,
    settings: HashMap<TenantId, TenantSettings>,
}

/// Heap-backed store. Everything is lost on restart; useful for tests and
/// `--dry-run` operation.
#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored transactions (test observability)
    pub async fn transaction_count(&self) -> usize {
        self.inner.read().await.transactions.len()
    }

    /// Number of stored confluences (test observability)
    pub async fn confluence_count(&self) -> usize {
        self.inner.read().await.confluences.len()
    }
}

fn tx_key(tenant: TenantId, tx: &Transaction) -> (TenantId, i64, String, String) {
    (
        tenant,
        tx.timestamp.timestamp(),
        tx.wallet_label.clone(),
        tx.token_identity().to_string(),
    )
}

fn sub_key(tracker: &str, tenant: TenantId) -> (String, TenantId) {
    (tracker.to_ascii_lowercase(), tenant)
}

#[async_trait]
impl Store for MemoryStore {
    async fn store_transaction(&self, tenant: TenantId, tx: &Transaction) -> Result<()> {
        let mut inner = self.inner.write().await;
        if inner.transaction_keys.insert(tx_key(tenant, tx)) {
            inner.transactions.push((tenant, tx.clone()));
        }
        Ok(())
    }

    async fn store_confluence(&self, confluence: &Confluence) -> Result<bool> {
        let mut inner = self.inner.write().await;
        let key = confluence.dedup_key();
        if inner.confluences.iter().any(|c| c.dedup_key() == key) {
            return Ok(false);
        }
        inner.confluences.push(confluence.clone());
        Ok(true)
    }

    async fn has_confluence(
        &self,
        tenant: TenantId,
        token: &TokenIdentity,
        detection_ts: DateTime<Utc>,
    ) -> Result<bool> {
        let key = (tenant, token.clone(), detection_ts.timestamp());
        Ok(self
            .inner
            .read()
            .await
            .confluences
            .iter()
            .any(|c| c.dedup_key() == key))
    }

    async fn list_confluences(
        &self,
        tenant: TenantId,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Result<Vec<Confluence>> {
        Ok(self
            .inner
            .read()
            .await
            .confluences
            .iter()
            .filter(|c| {
                c.tenant == tenant
                    && c.detection_timestamp >= since
                    && c.detection_timestamp < until
            })
            .cloned()
            .collect())
    }

    async fn purge_confluences(&self, tenant: TenantId) -> Result<u64> {
        let mut inner = self.inner.write().await;
        let before = inner.confluences.len();
        inner.confluences.retain(|c| c.tenant != tenant);
        Ok((before - inner.confluences.len()) as u64)
    }

    async fn list_active_subscriptions(&self) -> Result<Vec<Subscription>> {
        Ok(self
            .inner
            .read()
            .await
            .subscriptions
            .values()
            .filter(|s| s.active)
            .cloned()
            .collect())
    }

    async fn upsert_subscription(&self, sub: &Subscription) -> Result<()> {
        self.inner
            .write()
            .await
            .subscriptions
            .insert(sub_key(&sub.tracker, sub.tenant), sub.clone());
        Ok(())
    }

    async fn remove_subscription(&self, tracker: &str, tenant: TenantId) -> Result<bool> {
        Ok(self
            .inner
            .write()
            .await
            .subscriptions
            .remove(&sub_key(tracker, tenant))
            .is_some())
    }

    async fn get_tenant_settings(&self, tenant: TenantId) -> Result<Option<TenantSettings>> {
        Ok(self.inner.read().await.settings.get(&tenant).copied())
    }

    async fn upsert_tenant_settings(
        &self,
        tenant: TenantId,
        settings: TenantSettings,
    ) -> Result<()> {
        settings.validate()?;
        self.inner.write().await.settings.insert(tenant, settings);
        Ok(())
    }

    async fn prune_transactions(&self, older_than: DateTime<Utc>) -> Result<u64> {
        let mut inner = self.inner.write().await;
        let before = inner.transactions.len();
        inner.transactions.retain(|(_, tx)| tx.timestamp >= older_than);
        inner
            .transaction_keys
            .retain(|(_, ts, _, _)| *ts >= older_than.timestamp());
        Ok((before - inner.transactions.len()) as u64)
    }
}
