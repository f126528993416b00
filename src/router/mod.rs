//! Fan-in router: attribute inbound messages to trackers and fan out per
//! subscriber
//!
//! Attribution is lazy: the first message from a handle in the active
//! tracker set binds that sender's numeric id. The cheap filters (echo,
//! own identity, outbound, empty) run before any parse cost. Each
//! subscriber gets its own parse under its recorded tracker type: the same
//! text may parse under different formats for different tenants.

use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::alert::ConfluenceAlert;
use crate::directory::TrackerDirectory;
use crate::model::TrackerIdentity;
use crate::parser;
use crate::queue::{IngestJob, QueueEngine};
use crate::session::{InboundMessage, SessionEvent};

/// Router throughput counters
#[derive(Debug, Default)]
pub struct RouterStats {
    pub routed: AtomicU64,
    pub ignored: AtomicU64,
    pub parsed: AtomicU64,
}

/// Dispatches inbound messages into per-tenant queues
pub struct FanInRouter {
    directory: Arc<TrackerDirectory>,
    queue: Arc<QueueEngine>,
    /// Lazily established sender bindings, keyed by lowercased handle
    bindings: DashMap<String, TrackerIdentity>,
    /// Our own outbound identity; its messages are never parsed
    self_handle: Option<String>,
    pub stats: RouterStats,
}

impl FanInRouter {
    pub fn new(
        directory: Arc<TrackerDirectory>,
        queue: Arc<QueueEngine>,
        self_handle: Option<String>,
    ) -> Self {
        Self {
            directory,
            queue,
            bindings: DashMap::new(),
            self_handle,
            stats: RouterStats::default(),
        }
    }

    /// Consume session events until the channel closes or cancellation
    pub async fn run(
        &self,
        events: async_channel::Receiver<SessionEvent>,
        cancel: CancellationToken,
    ) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("router stopped");
                    return;
                }
                event = events.recv() => {
                    match event {
                        Ok(SessionEvent::Message(msg)) => self.handle_inbound(msg).await,
                        Ok(SessionEvent::Connected { session_id }) => {
                            debug!(session = %session_id, "session connected");
                        }
                        Ok(SessionEvent::Disconnected { session_id }) => {
                            debug!(session = %session_id, "session disconnected");
                        }
                        Err(_) => {
                            debug!("session event channel closed");
                            return;
                        }
                    }
                }
            }
        }
    }

    /// Route one inbound message
    pub async fn handle_inbound(&self, msg: InboundMessage) {
        // Cheap filters before any parse cost
        if !msg.is_routable() {
            self.stats.ignored.fetch_add(1, Ordering::Relaxed);
            return;
        }
        if ConfluenceAlert::is_echo(&msg.text) {
            trace!(session = %msg.session_id, "own alert echo suppressed");
            self.stats.ignored.fetch_add(1, Ordering::Relaxed);
            return;
        }
        if let Some(own) = &self.self_handle {
            if msg.sender_handle.eq_ignore_ascii_case(own) {
                self.stats.ignored.fetch_add(1, Ordering::Relaxed);
                return;
            }
        }

        let Some(tracker) = self.resolve_tracker(&msg).await else {
            self.stats.ignored.fetch_add(1, Ordering::Relaxed);
            return;
        };

        self.process_message(&tracker, &msg).await;
    }

    /// Match the sender against the bound set, binding lazily on the first
    /// observation of an active tracker handle
    async fn resolve_tracker(&self, msg: &InboundMessage) -> Option<String> {
        for entry in self.bindings.iter() {
            if entry.value().matches_sender(msg.sender_id, &msg.sender_handle) {
                return Some(entry.value().name.clone());
            }
        }

        let snapshot = self.directory.snapshot().await;
        let active = snapshot.active_trackers();

        let handle = msg.sender_handle.to_ascii_lowercase();
        let name = if !handle.is_empty() && active.contains(&handle) {
            handle
        } else if active.contains(&msg.sender_id.to_string()) {
            msg.sender_id.to_string()
        } else {
            return None;
        };

        let identity = TrackerIdentity::with_id(name.clone(), msg.sender_id);
        debug!(
            tracker = %name,
            sender_id = msg.sender_id,
            "tracker bound to sender"
        );
        self.bindings.insert(name.clone(), identity);
        Some(name)
    }

    /// Fan out to every subscriber with its recorded tracker type
    async fn process_message(&self, tracker: &str, msg: &InboundMessage) {
        let snapshot = self.directory.snapshot().await;
        let subscribers = snapshot.subscribers(tracker);
        if subscribers.is_empty() {
            self.stats.ignored.fetch_add(1, Ordering::Relaxed);
            return;
        }

        self.stats.routed.fetch_add(1, Ordering::Relaxed);
        for (tenant, tracker_type) in subscribers {
            if let Some(tx) = parser::parse(msg, tracker_type) {
                self.stats.parsed.fetch_add(1, Ordering::Relaxed);
                trace!(
                    %tenant,
                    tracker,
                    token = %tx.token_symbol,
                    wallet = %tx.wallet_label,
                    "transaction enqueued"
                );
                self.queue.enqueue(IngestJob::new(tenant, tracker, tx)).await;
            }
        }
    }

    /// Drop the sender binding for a tracker (unsubscribe path)
    pub fn unbind(&self, tracker: &str) {
        self.bindings.remove(&tracker.to_ascii_lowercase());
    }
}
