//! Price-history query contract and the HTTP client behind it

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, warn};

use crate::config::PriceApiConfig;
use crate::error::{Error, Result};

/// One price sample
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PricePoint {
    #[serde(rename = "unixTime")]
    pub unix_time: i64,
    pub value: f64,
}

/// Candle resolution accepted by the price API
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    M5,
    M15,
    M30,
    H1,
}

impl Resolution {
    pub fn as_str(&self) -> &'static str {
        match self {
            Resolution::M5 => "5m",
            Resolution::M15 => "15m",
            Resolution::M30 => "30m",
            Resolution::H1 => "1h",
        }
    }

    pub fn seconds(&self) -> i64 {
        match self {
            Resolution::M5 => 300,
            Resolution::M15 => 900,
            Resolution::M30 => 1800,
            Resolution::H1 => 3600,
        }
    }
}

impl std::fmt::Display for Resolution {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Source of historical prices. The analyzer owns chunking, retries, and the
/// rate budget; implementations only answer single-range queries.
#[async_trait]
pub trait PriceHistorySource: Send + Sync {
    async fn price_history(
        &self,
        token_address: &str,
        time_from: DateTime<Utc>,
        time_to: DateTime<Utc>,
        resolution: Resolution,
    ) -> Result<Vec<PricePoint>>;
}

#[derive(Debug, Deserialize)]
struct HistoryEnvelope {
    #[serde(default)]
    data: Option<HistoryData>,
    #[serde(default)]
    success: bool,
}

#[derive(Debug, Deserialize)]
struct HistoryData {
    #[serde(default)]
    items: Vec<PricePoint>,
}

/// HTTP client for the external price-history API
pub struct HttpPriceHistoryClient {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl HttpPriceHistoryClient {
    pub fn new(config: &PriceApiConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .unwrap_or_default();
        Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
        }
    }
}

#[async_trait]
impl PriceHistorySource for HttpPriceHistoryClient {
    async fn price_history(
        &self,
        token_address: &str,
        time_from: DateTime<Utc>,
        time_to: DateTime<Utc>,
        resolution: Resolution,
    ) -> Result<Vec<PricePoint>> {
        let url = format!("{}/defi/history_price", self.base_url);
        let response = self
            .client
            .get(&url)
            .header("X-API-KEY", &self.api_key)
            .query(&[
                ("address", token_address),
                ("address_type", "token"),
                ("type", resolution.as_str()),
                ("time_from", &time_from.timestamp().to_string()),
                ("time_to", &time_to.timestamp().to_string()),
            ])
            .send()
            .await?;

        let status = response.status();
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(Error::AnalyzerRateLimited);
        }
        if status.is_client_error() {
            // Unknown or malformed token; the analyzer will not retry this
            return Err(Error::AnalyzerUnknownToken(token_address.to_string()));
        }
        if !status.is_success() {
            return Err(Error::PriceApi {
                status: status.as_u16(),
                message: format!("history query failed for {token_address}"),
            });
        }

        let envelope: HistoryEnvelope = response.json().await?;
        if !envelope.success {
            warn!(token = token_address, "price API reported failure envelope");
        }
        let mut items = envelope.data.map(|d| d.items).unwrap_or_default();
        items.sort_by_key(|p| p.unix_time);
        debug!(
            token = token_address,
            points = items.len(),
            %resolution,
            "price history fetched"
        );
        Ok(items)
    }
}
