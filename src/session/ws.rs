//! WebSocket relay session
//!
//! Each session holds one long-lived connection to an upstream relay that
//! forwards tracker-channel messages as JSON frames matching the inbound
//! contract. Reconnects with bounded attempts and jitter; liveness is
//! tracked for the manager's probe loop.

use futures_util::{SinkExt, StreamExt};
use rand::Rng;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::time::Duration;
use tokio::time::sleep;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error, info, warn};

use super::source::{InboundMessage, SessionEvent, UpdateSource};
use crate::config::{SessionCredential, SessionsConfig};
use crate::error::{Error, Result};

/// Authentication frame sent right after connecting
#[derive(Debug, Serialize)]
struct AuthFrame<'a> {
    method: &'a str,
    credential: &'a str,
}

/// One upstream relay connection
pub struct RelaySession {
    name: String,
    relay_url: String,
    credential: String,
    reconnect_delay_ms: u64,
    max_reconnect_attempts: u32,
    ping_interval_secs: u64,
    connected: AtomicBool,
    last_inbound_unix: AtomicI64,
}

impl RelaySession {
    pub fn new(credential: &SessionCredential, config: &SessionsConfig) -> Self {
        Self {
            name: credential.name.clone(),
            relay_url: credential.relay_url.clone(),
            credential: credential.credential.clone(),
            reconnect_delay_ms: config.reconnect_delay_ms,
            max_reconnect_attempts: config.max_reconnect_attempts,
            ping_interval_secs: config.ping_interval_secs,
            connected: AtomicBool::new(false),
            last_inbound_unix: AtomicI64::new(0),
        }
    }

    /// Seconds since the last inbound frame, or None before the first
    pub fn idle_seconds(&self) -> Option<i64> {
        let last = self.last_inbound_unix.load(Ordering::Relaxed);
        if last == 0 {
            return None;
        }
        Some(chrono::Utc::now().timestamp() - last)
    }

    async fn connect_and_stream(
        &self,
        events: &async_channel::Sender<SessionEvent>,
    ) -> Result<()> {
        info!(session = %self.name, url = %self.relay_url, "connecting to relay");

        let (ws, _) = connect_async(self.relay_url.as_str())
            .await
            .map_err(|e| Error::SessionConnection(e.to_string()))?;
        let (mut writer, mut reader) = ws.split();

        if !self.credential.is_empty() {
            let auth = serde_json::to_string(&AuthFrame {
                method: "authenticate",
                credential: &self.credential,
            })?;
            writer
                .send(Message::Text(auth))
                .await
                .map_err(|e| Error::SessionConnection(e.to_string()))?;
        }

        self.connected.store(true, Ordering::Release);
        let _ = events
            .send(SessionEvent::Connected {
                session_id: self.name.clone(),
            })
            .await;

        let mut ping = tokio::time::interval(Duration::from_secs(self.ping_interval_secs));
        ping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ping.tick() => {
                    if let Err(e) = writer.send(Message::Ping(vec![])).await {
                        self.connected.store(false, Ordering::Release);
                        return Err(Error::SessionConnection(format!("ping failed: {e}")));
                    }
                }
                frame = reader.next() => {
                    match frame {
                        Some(Ok(Message::Text(text))) => {
                            self.last_inbound_unix
                                .store(chrono::Utc::now().timestamp(), Ordering::Relaxed);
                            match serde_json::from_str::<InboundMessage>(&text) {
                                Ok(mut msg) => {
                                    msg.session_id = self.name.clone();
                                    let _ = events.send(SessionEvent::Message(msg)).await;
                                }
                                Err(e) => {
                                    debug!(session = %self.name, error = %e, "undecodable frame dropped");
                                }
                            }
                        }
                        Some(Ok(Message::Ping(data))) => {
                            let _ = writer.send(Message::Pong(data)).await;
                        }
                        Some(Ok(Message::Pong(_))) => {
                            self.last_inbound_unix
                                .store(chrono::Utc::now().timestamp(), Ordering::Relaxed);
                        }
                        Some(Ok(Message::Close(_))) | None => {
                            self.connected.store(false, Ordering::Release);
                            return Err(Error::SessionDown(self.name.clone()));
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            self.connected.store(false, Ordering::Release);
                            return Err(Error::SessionConnection(e.to_string()));
                        }
                    }
                }
            }
        }
    }
}

#[async_trait::async_trait]
impl UpdateSource for RelaySession {
    fn session_id(&self) -> &str {
        &self.name
    }

    async fn run(&self, events: async_channel::Sender<SessionEvent>) -> Result<()> {
        let mut reconnect_attempts = 0u32;

        loop {
            match self.connect_and_stream(&events).await {
                Ok(()) => {
                    reconnect_attempts = 0;
                }
                Err(e) => {
                    error!(session = %self.name, error = %e, "relay session error");
                    let _ = events
                        .send(SessionEvent::Disconnected {
                            session_id: self.name.clone(),
                        })
                        .await;
                    reconnect_attempts += 1;

                    if self.max_reconnect_attempts > 0
                        && reconnect_attempts >= self.max_reconnect_attempts
                    {
                        warn!(
                            session = %self.name,
                            attempts = reconnect_attempts,
                            "max reconnect attempts reached, session giving up"
                        );
                        return Err(Error::SessionDown(self.name.clone()));
                    }
                }
            }

            let jitter = rand::thread_rng().gen_range(0..self.reconnect_delay_ms / 2 + 1);
            sleep(Duration::from_millis(self.reconnect_delay_ms + jitter)).await;
        }
    }

    async fn probe(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session() -> RelaySession {
        RelaySession::new(
            &SessionCredential {
                name: "s1".into(),
                relay_url: "wss://relay.example.com/feed".into(),
                credential: "token".into(),
            },
            &SessionsConfig::default(),
        )
    }

    #[tokio::test]
    async fn test_probe_false_before_connect() {
        let s = session();
        assert!(!s.probe().await);
        assert_eq!(s.idle_seconds(), None);
    }

    #[test]
    fn test_auth_frame_shape() {
        let frame = serde_json::to_string(&AuthFrame {
            method: "authenticate",
            credential: "abc",
        })
        .unwrap();
        assert!(frame.contains("\"method\":\"authenticate\""));
        assert!(frame.contains("\"credential\":\"abc\""));
    }
}
