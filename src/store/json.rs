//! JSON-file store
//!
//! One file per collection under a data directory. Writes go through a
//! temp-file-and-rename so a crash mid-write never truncates the previous
//! snapshot. State is mirrored in memory; files are the source of truth only
//! at open.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use tokio::sync::RwLock;
use tracing::{debug, info};

use super::Store;
use crate::error::{Error, Result};
use crate::model::{Confluence, Subscription, TenantId, TenantSettings, TokenIdentity, Transaction};

const TRANSACTIONS_FILE: &str = "transactions.json";
const CONFLUENCES_FILE: &str = "confluences.json";
const SUBSCRIPTIONS_FILE: &str = "subscriptions.json";
const SETTINGS_FILE: &str = "settings.json";

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredTransaction {
    tenant: TenantId,
    #[serde(flatten)]
    tx: Transaction,
}

#[derive(Default)]
struct Inner {
    transactions: Vec<StoredTransaction>,
    transaction_keys: HashSet<(TenantId, i64, String, String)>,
    confluences: Vec<Confluence>,
    subscriptions: HashMap<(String, TenantId), Subscription>,
    settings: HashMap<TenantId, TenantSettings>,
}

/// Durable store backed by JSON files in a directory
pub struct JsonFileStore {
    dir: PathBuf,
    inner: RwLock<Inner>,
}

impl JsonFileStore {
    /// Open (and create if missing) the data directory, loading any existing
    /// snapshots
    pub async fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        tokio::fs::create_dir_all(&dir).await?;

        let mut inner = Inner::default();

        if let Some(transactions) =
            load_file::<Vec<StoredTransaction>>(&dir.join(TRANSACTIONS_FILE)).await?
        {
            for stored in &transactions {
                inner.transaction_keys.insert(tx_key(stored.tenant, &stored.tx));
            }
            inner.transactions = transactions;
        }
        if let Some(confluences) = load_file::<Vec<Confluence>>(&dir.join(CONFLUENCES_FILE)).await?
        {
            inner.confluences = confluences;
        }
        if let Some(subscriptions) =
            load_file::<Vec<Subscription>>(&dir.join(SUBSCRIPTIONS_FILE)).await?
        {
            inner.subscriptions = subscriptions
                .into_iter()
                .map(|s| (sub_key(&s.tracker, s.tenant), s))
                .collect();
        }
        if let Some(settings) =
            load_file::<HashMap<i64, TenantSettings>>(&dir.join(SETTINGS_FILE)).await?
        {
            inner.settings = settings
                .into_iter()
                .map(|(id, s)| (TenantId(id), s))
                .collect();
        }

        info!(
            dir = %dir.display(),
            transactions = inner.transactions.len(),
            confluences = inner.confluences.len(),
            subscriptions = inner.subscriptions.len(),
            "json store opened"
        );

        Ok(Self {
            dir,
            inner: RwLock::new(inner),
        })
    }

    async fn persist_transactions(&self, inner: &Inner) -> Result<()> {
        write_file(&self.dir.join(TRANSACTIONS_FILE), &inner.transactions).await
    }

    async fn persist_confluences(&self, inner: &Inner) -> Result<()> {
        write_file(&self.dir.join(CONFLUENCES_FILE), &inner.confluences).await
    }

    async fn persist_subscriptions(&self, inner: &Inner) -> Result<()> {
        let list: Vec<&Subscription> = inner.subscriptions.values().collect();
        write_file(&self.dir.join(SUBSCRIPTIONS_FILE), &list).await
    }

    async fn persist_settings(&self, inner: &Inner) -> Result<()> {
        let map: HashMap<i64, TenantSettings> =
            inner.settings.iter().map(|(k, v)| (k.0, *v)).collect();
        write_file(&self.dir.join(SETTINGS_FILE), &map).await
    }
}

async fn load_file<T: serde::de::DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    match tokio::fs::read_to_string(path).await {
        Ok(data) => {
            let value = serde_json::from_str(&data)
                .map_err(|e| Error::Store(format!("corrupt {}: {e}", path.display())))?;
            Ok(Some(value))
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(Error::Io(e.to_string())),
    }
}

async fn write_file<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let data = serde_json::to_string_pretty(value)?;
    let tmp = path.with_extension("json.tmp");
    tokio::fs::write(&tmp, data).await?;
    tokio::fs::rename(&tmp, path).await?;
    debug!(path = %path.display(), "snapshot written");
    Ok(())
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
impl Store for JsonFileStore {
    async fn store_transaction(&self, tenant: TenantId, tx: &Transaction) -> Result<()> {
        let mut inner = self.inner.write().await;
        if inner.transaction_keys.insert(tx_key(tenant, tx)) {
            inner.transactions.push(StoredTransaction {
                tenant,
                tx: tx.clone(),
            });
            self.persist_transactions(&inner).await?;
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
        self.persist_confluences(&inner).await?;
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
        let removed = (before - inner.confluences.len()) as u64;
        if removed > 0 {
            self.persist_confluences(&inner).await?;
        }
        Ok(removed)
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
        let mut inner = self.inner.write().await;
        inner
            .subscriptions
            .insert(sub_key(&sub.tracker, sub.tenant), sub.clone());
        self.persist_subscriptions(&inner).await
    }

    async fn remove_subscription(&self, tracker: &str, tenant: TenantId) -> Result<bool> {
        let mut inner = self.inner.write().await;
        let removed = inner
            .subscriptions
            .remove(&sub_key(tracker, tenant))
            .is_some();
        if removed {
            self.persist_subscriptions(&inner).await?;
        }
        Ok(removed)
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
        let mut inner = self.inner.write().await;
        inner.settings.insert(tenant, settings);
        self.persist_settings(&inner).await
    }

    async fn prune_transactions(&self, older_than: DateTime<Utc>) -> Result<u64> {
        let mut inner = self.inner.write().await;
        let before = inner.transactions.len();
        inner.transactions.retain(|s| s.tx.timestamp >= older_than);
        inner
            .transaction_keys
            .retain(|(_, ts, _, _)| *ts >= older_than.timestamp());
        let removed = (before - inner.transactions.len()) as u64;
        if removed > 0 {
            self.persist_transactions(&inner).await?;
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{QuoteSymbol, TradeSide};
    use chrono::TimeZone;

    fn sample_tx() -> Transaction {
        Transaction {
            wallet_label: "#A".into(),
            wallet_address: None,
            side: TradeSide::Buy,
            token_symbol: "FOO".into(),
            token_address: None,
            amount: 100.0,
            quote_amount: 1.0,
            quote_symbol: QuoteSymbol::Sol,
            usd_value: 200.0,
            market_cap: 50_000.0,
            timestamp: Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap(),
        }
    }

    #[tokio::test]
    async fn test_roundtrip_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().to_path_buf();

        {
            let store = JsonFileStore::open(&path).await.unwrap();
            store
                .store_transaction(TenantId(1), &sample_tx())
                .await
                .unwrap();
            let sub = Subscription {
                tracker: "CieloBot".into(),
                tenant: TenantId(1),
                tracker_type: crate::model::TrackerType::A,
                active: true,
                setup_actor: "op".into(),
                created_at: Utc::now(),
            };
            store.upsert_subscription(&sub).await.unwrap();
        }

        let reopened = JsonFileStore::open(&path).await.unwrap();
        let subs = reopened.list_active_subscriptions().await.unwrap();
        assert_eq!(subs.len(), 1);
        assert_eq!(subs[0].tracker, "CieloBot");

        // Replay of the same transaction stays deduped after reopen
        reopened
            .store_transaction(TenantId(1), &sample_tx())
            .await
            .unwrap();
        assert_eq!(reopened.inner.read().await.transactions.len(), 1);
    }

    #[tokio::test]
    async fn test_subscription_removal_case_insensitive() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::open(dir.path()).await.unwrap();
        let sub = Subscription {
            tracker: "CieloBot".into(),
            tenant: TenantId(1),
            tracker_type: crate::model::TrackerType::A,
            active: true,
            setup_actor: "op".into(),
            created_at: Utc::now(),
        };
        store.upsert_subscription(&sub).await.unwrap();
        assert!(store.remove_subscription("cielobot", TenantId(1)).await.unwrap());
        assert!(!store.remove_subscription("cielobot", TenantId(1)).await.unwrap());
    }
}
