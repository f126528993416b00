//! Outbound alert contract
//!
//! The sink is injected as a trait object so the queue engine never depends
//! on a concrete transport. Rendered alerts begin with the glyph header
//! below; the fan-in router uses the same constant to suppress echoes of our
//! own messages coming back through a tracker channel.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{Error, Result};
use crate::model::{Confluence, ConfluenceWallet, TenantId};

/// First characters of every rendered confluence alert
pub const ALERT_HEADER: &str = "🚨 CONFLUENCE";

/// Structured alert payload handed to the sink
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfluenceAlert {
    pub tenant: TenantId,
    pub kind: String,
    pub coin: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub coin_address: Option<String>,
    pub wallets: Vec<ConfluenceWallet>,
    pub detection_timestamp: DateTime<Utc>,
    pub market_cap: f64,
}

impl ConfluenceAlert {
    pub fn from_confluence(confluence: &Confluence) -> Self {
        Self {
            tenant: confluence.tenant,
            kind: "CONFLUENCE".to_string(),
            coin: confluence.token_symbol.clone(),
            coin_address: confluence.token_address.clone(),
            wallets: confluence.wallets.clone(),
            detection_timestamp: confluence.detection_timestamp,
            market_cap: confluence.detection_market_cap,
        }
    }

    /// Render the outbound text. Must begin with [`ALERT_HEADER`] so the
    /// router can recognize echoes.
    pub fn render(&self) -> String {
        let mut out = format!(
            "{ALERT_HEADER} — {} wallets on {}\n",
            self.wallets.len(),
            self.coin
        );
        if let Some(addr) = &self.coin_address {
            out.push_str(&format!("{addr}\n"));
        }
        if self.market_cap > 0.0 {
            out.push_str(&format!("MC at detection: ${:.0}\n", self.market_cap));
        }
        for w in &self.wallets {
            out.push_str(&format!(
                "  {} {} {:.2} @ {}\n",
                w.label,
                w.side,
                w.quote_amount,
                w.timestamp.format("%H:%M:%S")
            ));
        }
        out.push_str(&format!(
            "detected {}",
            self.detection_timestamp.format("%Y-%m-%d %H:%M:%S UTC")
        ));
        out
    }

    /// Whether a piece of inbound text is an echo of one of our alerts
    pub fn is_echo(text: &str) -> bool {
        text.trim_start().starts_with(ALERT_HEADER)
    }
}

/// Destination for detection alerts
#[async_trait]
pub trait AlertSink: Send + Sync {
    async fn send(&self, alert: &ConfluenceAlert) -> Result<()>;
}

/// Sink that announces alerts on the log; the default for dry runs
#[derive(Default)]
pub struct LogAlertSink;

#[async_trait]
impl AlertSink for LogAlertSink {
    async fn send(&self, alert: &ConfluenceAlert) -> Result<()> {
        info!(
            tenant = %alert.tenant,
            coin = %alert.coin,
            wallets = alert.wallets.len(),
            "\n{}",
            alert.render()
        );
        Ok(())
    }
}

/// Sink that forwards alerts into a channel; used by tests and by outbound
/// transports that consume from their own task
pub struct ChannelAlertSink {
    tx: async_channel::Sender<ConfluenceAlert>,
}

impl ChannelAlertSink {
    pub fn new() -> (Self, async_channel::Receiver<ConfluenceAlert>) {
        let (tx, rx) = async_channel::unbounded();
        (Self { tx }, rx)
    }
}

#[async_trait]
impl AlertSink for ChannelAlertSink {
    async fn send(&self, alert: &ConfluenceAlert) -> Result<()> {
        self.tx
            .send(alert.clone())
            .await
            .map_err(|e| Error::AlertSend(e.to_string()))
    }
}
