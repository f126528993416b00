//! Persistence contract
//!
//! The concrete store schema is a deployment concern; the core programs
//! against this trait. All operations are idempotent under replay:
//! transactions dedup on `(tenant, timestamp, wallet label, token identity)`,
//! confluences on `(tenant, token identity, detection timestamp)`.

mod json;
mod memory;

pub use json::JsonFileStore;
pub use memory::MemoryStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;

use crate::config::StoreConfig;
use crate::error::Result;
use crate::model::{Confluence, Subscription, TenantId, TenantSettings, TokenIdentity, Transaction};

/// Durable store for transactions, confluences, subscriptions, and settings
#[async_trait]
pub trait Store: Send + Sync {
    /// Persist a transaction. Replaying the same event is a no-op.
    async fn store_transaction(&self, tenant: TenantId, tx: &Transaction) -> Result<()>;

    /// Persist a confluence. Returns false when the same detection already
    /// exists (idempotent replay).
    async fn store_confluence(&self, confluence: &Confluence) -> Result<bool>;

    /// Whether a confluence with this identity and detection timestamp exists
    async fn has_confluence(
        &self,
        tenant: TenantId,
        token: &TokenIdentity,
        detection_ts: DateTime<Utc>,
    ) -> Result<bool>;

    /// Confluences for a tenant with detection time in `[since, until)`
    async fn list_confluences(
        &self,
        tenant: TenantId,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Result<Vec<Confluence>>;

    /// Drop all confluences for a tenant. Returns the number removed.
    async fn purge_confluences(&self, tenant: TenantId) -> Result<u64>;

    async fn list_active_subscriptions(&self) -> Result<Vec<Subscription>>;

    async fn upsert_subscription(&self, sub: &Subscription) -> Result<()>;

    /// Deactivate and remove a subscription. Returns true when it existed.
    async fn remove_subscription(&self, tracker: &str, tenant: TenantId) -> Result<bool>;

    async fn get_tenant_settings(&self, tenant: TenantId) -> Result<Option<TenantSettings>>;

    async fn upsert_tenant_settings(
        &self,
        tenant: TenantId,
        settings: TenantSettings,
    ) -> Result<()>;

    /// Drop stored transactions older than the cutoff. Returns the number
    /// removed.
    async fn prune_transactions(&self, older_than: DateTime<Utc>) -> Result<u64>;
}

/// Build a store from configuration: `memory:` or a directory path for the
/// JSON-file store
pub async fn open(config: &StoreConfig) -> Result<Arc<dyn Store>> {
    if config.uri == "memory:" {
        Ok(Arc::new(MemoryStore::new()))
    } else {
        Ok(Arc::new(JsonFileStore::open(&config.uri).await?))
    }
}
