//! CLI command implementations

use anyhow::{Context, Result};
use chrono::{Duration, Utc};
use tracing::info;

use crate::config::Config;
use crate::directory::SubscribeOutcome;
use crate::model::{TenantId, TenantSettings, TrackerType};
use crate::recap::RecapAggregator;
use crate::services::CoreServices;

/// Start the service and run until shutdown
pub async fn start(mut config: Config, dry_run: bool) -> Result<()> {
    if dry_run {
        info!("dry-run: using the in-memory store");
        config.store.uri = "memory:".to_string();
    }
    if config.sessions.relays.is_empty() {
        info!("no relay sessions configured; running without upstream input");
    }

    let core = CoreServices::init(config)
        .await
        .context("Failed to initialize services")?;
    core.run().await.context("Service terminated with error")?;
    Ok(())
}

/// Print the masked configuration
pub fn show_config(config: &Config) -> Result<()> {
    println!("{}", config.masked_display());
    Ok(())
}

/// Show subscriptions, settings, and recent activity from the store
pub async fn status(config: Config) -> Result<()> {
    let store = crate::store::open(&config.store).await?;
    let subscriptions = store.list_active_subscriptions().await?;

    if subscriptions.is_empty() {
        println!("no active subscriptions");
        return Ok(());
    }

    println!("Active subscriptions:");
    let mut tenants: Vec<TenantId> = subscriptions.iter().map(|s| s.tenant).collect();
    tenants.sort();
    tenants.dedup();

    for sub in &subscriptions {
        println!(
            "  {} -> tenant {} (type {}, by {})",
            sub.tracker, sub.tenant, sub.tracker_type, sub.setup_actor
        );
    }

    let until = Utc::now();
    let since = until - Duration::hours(24);
    println!("\nLast 24h:");
    for tenant in tenants {
        let settings = store
            .get_tenant_settings(tenant)
            .await?
            .unwrap_or(config.detection.default_settings());
        let confluences = store.list_confluences(tenant, since, until).await?;
        println!(
            "  tenant {}: {} confluences (min_wallets {}, window {}m)",
            tenant,
            confluences.len(),
            settings.min_wallets,
            settings.window_minutes
        );
    }
    Ok(())
}

/// Run a recap for one tenant and print the rendered report
pub async fn recap(config: Config, tenant: i64, hours: u32) -> Result<()> {
    let store = crate::store::open(&config.store).await?;
    let price_source = std::sync::Arc::new(crate::analyzer::HttpPriceHistoryClient::new(
        &config.price_api,
    ));
    let analyzer = std::sync::Arc::new(crate::analyzer::AthAnalyzer::new(
        price_source,
        &config.price_api,
        config.analyzer.clone(),
    ));
    let aggregator = RecapAggregator::new(store, analyzer, config.recap.overall_deadline_secs);

    let report = aggregator.build(TenantId(tenant), hours).await?;
    println!("{}", report.render());
    Ok(())
}

/// Subscribe a tracker for a tenant
pub async fn subscribe(
    config: Config,
    tracker: String,
    tenant: i64,
    tracker_type: TrackerType,
    actor: String,
) -> Result<()> {
    let store = crate::store::open(&config.store).await?;
    let directory = crate::directory::TrackerDirectory::new(store);
    directory.refresh().await?;

    match directory
        .subscribe(&tracker, TenantId(tenant), tracker_type, &actor)
        .await?
    {
        SubscribeOutcome::Subscribed => {
            println!("subscribed {tracker} for tenant {tenant} (type {tracker_type})");
        }
        SubscribeOutcome::Duplicate => {
            println!("{tracker} is already active for tenant {tenant}");
        }
        SubscribeOutcome::MaxReached => {
            anyhow::bail!(
                "tenant {tenant} already has the maximum number of active subscriptions"
            );
        }
    }
    Ok(())
}

/// Remove a tracker subscription with full cleanup
pub async fn unsubscribe(config: Config, tracker: String, tenant: i64) -> Result<()> {
    let core = CoreServices::init(config)
        .await
        .context("Failed to initialize services")?;
    if core.unsubscribe(&tracker, TenantId(tenant)).await? {
        println!("unsubscribed {tracker} for tenant {tenant}");
    } else {
        println!("no active subscription {tracker} for tenant {tenant}");
    }
    Ok(())
}

/// View or adjust tenant settings
pub async fn settings(
    config: Config,
    tenant: i64,
    min_wallets: Option<u32>,
    window_minutes: Option<u32>,
) -> Result<()> {
    let store = crate::store::open(&config.store).await?;
    let tenant = TenantId(tenant);
    let current = store
        .get_tenant_settings(tenant)
        .await?
        .unwrap_or(config.detection.default_settings());

    if min_wallets.is_none() && window_minutes.is_none() {
        println!(
            "tenant {}: min_wallets {}, window {}m",
            tenant, current.min_wallets, current.window_minutes
        );
        return Ok(());
    }

    let next = TenantSettings {
        min_wallets: min_wallets.unwrap_or(current.min_wallets),
        window_minutes: window_minutes.unwrap_or(current.window_minutes),
    };
    next.validate().map_err(|e| anyhow::anyhow!("{e}"))?;
    store.upsert_tenant_settings(tenant, next).await?;
    println!(
        "tenant {}: min_wallets {}, window {}m",
        tenant, next.min_wallets, next.window_minutes
    );
    Ok(())
}
