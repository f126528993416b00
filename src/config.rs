//! Configuration loading and validation

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;

use crate::model::TenantSettings;

/// Main configuration structure
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub sessions: SessionsConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub price_api: PriceApiConfig,
    #[serde(default)]
    pub detection: DetectionConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub directory: DirectoryConfig,
    #[serde(default)]
    pub sweeper: SweeperConfig,
    #[serde(default)]
    pub analyzer: AnalyzerConfig,
    #[serde(default)]
    pub recap: RecapConfig,
}

/// Upstream relay sessions
#[derive(Debug, Clone, Deserialize)]
pub struct SessionsConfig {
    /// One entry per parallel upstream session
    #[serde(default)]
    pub relays: Vec<SessionCredential>,
    #[serde(default = "default_probe_interval_secs")]
    pub probe_interval_secs: u64,
    #[serde(default = "default_reconnect_delay_ms")]
    pub reconnect_delay_ms: u64,
    /// 0 = infinite
    #[serde(default = "default_max_reconnect_attempts")]
    pub max_reconnect_attempts: u32,
    #[serde(default = "default_ping_interval_secs")]
    pub ping_interval_secs: u64,
}

impl Default for SessionsConfig {
    fn default() -> Self {
        Self {
            relays: vec![],
            probe_interval_secs: default_probe_interval_secs(),
            reconnect_delay_ms: default_reconnect_delay_ms(),
            max_reconnect_attempts: default_max_reconnect_attempts(),
            ping_interval_secs: default_ping_interval_secs(),
        }
    }
}

/// One upstream session credential
#[derive(Debug, Clone, Deserialize)]
pub struct SessionCredential {
    pub name: String,
    pub relay_url: String,
    #[serde(default)]
    pub credential: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    /// Persistence URI: `memory:` or a directory path for the JSON store
    #[serde(default = "default_store_uri")]
    pub uri: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            uri: default_store_uri(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PriceApiConfig {
    #[serde(default = "default_price_api_base")]
    pub base_url: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_requests_per_second")]
    pub requests_per_second: u32,
    #[serde(default = "default_inter_request_delay_ms")]
    pub inter_request_delay_ms: u64,
}

impl Default for PriceApiConfig {
    fn default() -> Self {
        Self {
            base_url: default_price_api_base(),
            api_key: String::new(),
            request_timeout_secs: default_request_timeout_secs(),
            requests_per_second: default_requests_per_second(),
            inter_request_delay_ms: default_inter_request_delay_ms(),
        }
    }
}

/// Tenant-setting defaults applied when a tenant has no stored settings
#[derive(Debug, Clone, Deserialize)]
pub struct DetectionConfig {
    #[serde(default = "default_min_wallets")]
    pub default_min_wallets: u32,
    #[serde(default = "default_window_minutes")]
    pub default_window_minutes: u32,
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            default_min_wallets: default_min_wallets(),
            default_window_minutes: default_window_minutes(),
        }
    }
}

impl DetectionConfig {
    pub fn default_settings(&self) -> TenantSettings {
        TenantSettings {
            min_wallets: self.default_min_wallets,
            window_minutes: self.default_window_minutes,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct QueueConfig {
    #[serde(default = "default_batch_max")]
    pub batch_max: usize,
    #[serde(default = "default_warn_pending")]
    pub warn_pending: usize,
    /// Optional hard cap per tenant queue; oldest jobs are dropped and counted
    #[serde(default)]
    pub hard_cap: Option<usize>,
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            batch_max: default_batch_max(),
            warn_pending: default_warn_pending(),
            hard_cap: None,
            workers: default_workers(),
            max_attempts: default_max_attempts(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DirectoryConfig {
    #[serde(default = "default_refresh_secs")]
    pub refresh_secs: u64,
}

impl Default for DirectoryConfig {
    fn default() -> Self {
        Self {
            refresh_secs: default_refresh_secs(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SweeperConfig {
    #[serde(default = "default_sweep_interval_secs")]
    pub interval_secs: u64,
    #[serde(default = "default_retention_hours")]
    pub retention_hours: u64,
}

impl Default for SweeperConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_sweep_interval_secs(),
            retention_hours: default_retention_hours(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct AnalyzerConfig {
    /// Tokens per batch in the orchestrator
    #[serde(default = "default_analyzer_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_inter_batch_delay_ms")]
    pub inter_batch_delay_ms: u64,
    /// Total span scanned after a detection point
    #[serde(default = "default_scan_span_hours")]
    pub scan_span_hours: u64,
}

impl Default for AnalyzerConfig {
    fn default() -> Self {
        Self {
            batch_size: default_analyzer_batch_size(),
            inter_batch_delay_ms: default_inter_batch_delay_ms(),
            scan_span_hours: default_scan_span_hours(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RecapConfig {
    #[serde(default = "default_recap_deadline_secs")]
    pub overall_deadline_secs: u64,
}

impl Default for RecapConfig {
    fn default() -> Self {
        Self {
            overall_deadline_secs: default_recap_deadline_secs(),
        }
    }
}

// Default value functions
fn default_probe_interval_secs() -> u64 {
    300
}

fn default_reconnect_delay_ms() -> u64 {
    1000
}

fn default_max_reconnect_attempts() -> u32 {
    10
}

fn default_ping_interval_secs() -> u64 {
    30
}

fn default_store_uri() -> String {
    std::env::var("CONFLUENCE_STORE_URI").unwrap_or_else(|_| "data".into())
}

fn default_price_api_base() -> String {
    std::env::var("PRICE_API_BASE_URL")
        .unwrap_or_else(|_| "https://public-api.birdeye.so".into())
}

fn default_request_timeout_secs() -> u64 {
    15
}

fn default_requests_per_second() -> u32 {
    5
}

fn default_inter_request_delay_ms() -> u64 {
    200
}

fn default_min_wallets() -> u32 {
    2
}

fn default_window_minutes() -> u32 {
    1440
}

fn default_batch_max() -> usize {
    10
}

fn default_warn_pending() -> usize {
    100
}

fn default_workers() -> usize {
    4
}

fn default_max_attempts() -> u32 {
    3
}

fn default_refresh_secs() -> u64 {
    60
}

fn default_sweep_interval_secs() -> u64 {
    600
}

fn default_retention_hours() -> u64 {
    48
}

fn default_analyzer_batch_size() -> usize {
    3
}

fn default_inter_batch_delay_ms() -> u64 {
    1000
}

fn default_scan_span_hours() -> u64 {
    48
}

fn default_recap_deadline_secs() -> u64 {
    300
}

impl Config {
    /// Load configuration from file and environment variables
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        let settings = config::Config::builder()
            // Start with defaults
            .set_default("store.uri", default_store_uri())?
            .set_default("price_api.base_url", default_price_api_base())?
            .set_default(
                "detection.default_min_wallets",
                default_min_wallets() as i64,
            )?
            .set_default(
                "detection.default_window_minutes",
                default_window_minutes() as i64,
            )?
            // Load from file if exists
            .add_source(config::File::from(path).required(false))
            // Override with environment variables (prefix CONFLUENCE_)
            .add_source(
                config::Environment::with_prefix("CONFLUENCE")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .context("Failed to build configuration")?;

        let config: Config = settings
            .try_deserialize()
            .context("Failed to deserialize configuration")?;

        config.validate()?;

        Ok(config)
    }

    /// Validate configuration values
    fn validate(&self) -> Result<()> {
        self.detection
            .default_settings()
            .validate()
            .map_err(|e| anyhow::anyhow!("{e}"))?;

        if self.queue.batch_max == 0 {
            anyhow::bail!("queue.batch_max must be positive");
        }
        if self.queue.workers == 0 {
            anyhow::bail!("queue.workers must be positive");
        }
        if self.queue.max_attempts == 0 {
            anyhow::bail!("queue.max_attempts must be positive");
        }
        if let Some(cap) = self.queue.hard_cap {
            if cap < self.queue.batch_max {
                anyhow::bail!(
                    "queue.hard_cap ({}) must be at least batch_max ({})",
                    cap,
                    self.queue.batch_max
                );
            }
        }

        if self.price_api.requests_per_second == 0 {
            anyhow::bail!("price_api.requests_per_second must be positive");
        }
        if self.analyzer.batch_size == 0 {
            anyhow::bail!("analyzer.batch_size must be positive");
        }

        for relay in &self.sessions.relays {
            url::Url::parse(&relay.relay_url)
                .with_context(|| format!("Invalid relay_url for session {}", relay.name))?;
        }

        Ok(())
    }

    /// Get masked configuration for display (hide secrets)
    pub fn masked_display(&self) -> String {
        format!(
            r#"Configuration:
  Sessions:
    relays: {}
    probe_interval: {}s
  Store:
    uri: {}
  Price API:
    base_url: {}
    api_key: {}
    timeout: {}s
    budget: {} req/s
  Detection defaults:
    min_wallets: {}
    window_minutes: {}
  Queue:
    batch_max: {}
    workers: {}
    warn_pending: {}
  Sweeper:
    interval: {}s
    retention: {}h
"#,
            self.sessions.relays.len(),
            self.sessions.probe_interval_secs,
            self.store.uri,
            self.price_api.base_url,
            if self.price_api.api_key.is_empty() {
                "(not set)"
            } else {
                "***"
            },
            self.price_api.request_timeout_secs,
            self.price_api.requests_per_second,
            self.detection.default_min_wallets,
            self.detection.default_window_minutes,
            self.queue.batch_max,
            self.queue.workers,
            self.queue.warn_pending,
            self.sweeper.interval_secs,
            self.sweeper.retention_hours,
        )
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            sessions: SessionsConfig::default(),
            store: StoreConfig::default(),
            price_api: PriceApiConfig::default(),
            detection: DetectionConfig::default(),
            queue: QueueConfig::default(),
            directory: DirectoryConfig::default(),
            sweeper: SweeperConfig::default(),
            analyzer: AnalyzerConfig::default(),
            recap: RecapConfig::default(),
        }
    }
}
