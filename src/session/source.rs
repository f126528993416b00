//! Inbound message contract shared by upstream sessions and the router
//!
//! URL entities are preserved verbatim from the upstream payload. The parsers
//! depend on them: a chart link carries the token address more reliably than
//! the visible text does.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Kind of an embedded message entity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    /// Hidden hyperlink; `url` carries the target
    TextLink,
    /// The covered text itself is a URL
    Url,
    /// Monospace inline segment
    Code,
    /// Monospace block
    Pre,
    /// Anything else the upstream annotates
    Other,
}

/// An annotation over a span of the message text
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageEntity {
    pub kind: EntityKind,
    /// Offset in characters into the message text
    pub offset: usize,
    /// Length in characters
    pub length: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

impl MessageEntity {
    pub fn text_link(offset: usize, length: usize, url: impl Into<String>) -> Self {
        Self {
            kind: EntityKind::TextLink,
            offset,
            length,
            url: Some(url.into()),
        }
    }

    pub fn code(offset: usize, length: usize) -> Self {
        Self {
            kind: EntityKind::Code,
            offset,
            length,
            url: None,
        }
    }
}

/// A raw message surfaced by an upstream session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundMessage {
    pub text: String,
    #[serde(default)]
    pub entities: Vec<MessageEntity>,
    pub sender_id: i64,
    #[serde(default)]
    pub sender_handle: String,
    /// True when the message was sent by our own identity
    #[serde(default)]
    pub outbound: bool,
    pub timestamp: DateTime<Utc>,
    /// Originating-session stamp, set by the session that observed it
    #[serde(default)]
    pub session_id: String,
}

impl InboundMessage {
    /// Slice the text covered by an entity (character offsets)
    pub fn entity_text(&self, entity: &MessageEntity) -> Option<String> {
        let chars: Vec<char> = self.text.chars().collect();
        if entity.offset + entity.length > chars.len() {
            return None;
        }
        Some(
            chars[entity.offset..entity.offset + entity.length]
                .iter()
                .collect(),
        )
    }

    /// All URLs carried by entities, in message order
    pub fn entity_urls(&self) -> Vec<String> {
        self.entities
            .iter()
            .filter_map(|e| match e.kind {
                EntityKind::TextLink => e.url.clone(),
                EntityKind::Url => self.entity_text(e),
                _ => None,
            })
            .collect()
    }

    /// All monospace segments, in message order
    pub fn code_segments(&self) -> Vec<String> {
        self.entities
            .iter()
            .filter(|e| matches!(e.kind, EntityKind::Code | EntityKind::Pre))
            .filter_map(|e| self.entity_text(e))
            .collect()
    }

    /// Whether the message is worth routing at all
    pub fn is_routable(&self) -> bool {
        !self.outbound && !self.text.trim().is_empty()
    }
}

/// Events surfaced by an upstream session to the manager
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// A message observed on the upstream source
    Message(InboundMessage),
    /// Session established its connection
    Connected { session_id: String },
    /// Session lost its connection
    Disconnected { session_id: String },
}

/// An upstream source of inbound messages
///
/// Implementations run their own long-lived connection and push events into
/// the shared channel handed to `run`.
#[async_trait]
pub trait UpdateSource: Send + Sync {
    /// Stable identifier of this session
    fn session_id(&self) -> &str;

    /// Drive the connection until shutdown or a terminal failure.
    /// Reconnects internally; returns only when giving up.
    async fn run(&self, events: async_channel::Sender<SessionEvent>) -> Result<()>;

    /// Lightweight liveness probe
    async fn probe(&self) -> bool;
}
