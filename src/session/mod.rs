//! Upstream session management
//!
//! The system runs one or more parallel sessions against the upstream
//! source. The manager spawns each session's run loop, probes the pool on an
//! interval, withdraws sessions that fail their probe, and re-establishes
//! everything when the pool runs empty.

pub mod source;
mod ws;

pub use source::{EntityKind, InboundMessage, MessageEntity, SessionEvent, UpdateSource};
pub use ws::RelaySession;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::SessionsConfig;

struct SessionHandle {
    source: Arc<dyn UpdateSource>,
    task: JoinHandle<()>,
}

/// Owns the session pool and its health policy
pub struct SessionManager {
    sources: Vec<Arc<dyn UpdateSource>>,
    events: async_channel::Sender<SessionEvent>,
    pool: Mutex<HashMap<String, SessionHandle>>,
    probe_interval: Duration,
}

impl SessionManager {
    /// Build the manager and the receiving end of the event pipeline
    pub fn new(
        sources: Vec<Arc<dyn UpdateSource>>,
        config: &SessionsConfig,
    ) -> (Self, async_channel::Receiver<SessionEvent>) {
        let (tx, rx) = async_channel::unbounded();
        (
            Self {
                sources,
                events: tx,
                pool: Mutex::new(HashMap::new()),
                probe_interval: Duration::from_secs(config.probe_interval_secs),
            },
            rx,
        )
    }

    /// Spawn every configured session into the pool
    pub async fn start_all(&self) {
        let mut pool = self.pool.lock().await;
        for source in &self.sources {
            let id = source.session_id().to_string();
            if pool.contains_key(&id) {
                continue;
            }
            pool.insert(id.clone(), self.spawn(source.clone()));
            info!(session = %id, "session started");
        }
    }

    fn spawn(&self, source: Arc<dyn UpdateSource>) -> SessionHandle {
        let events = self.events.clone();
        let run_source = source.clone();
        let task = tokio::spawn(async move {
            if let Err(e) = run_source.run(events).await {
                warn!(session = %run_source.session_id(), error = %e, "session terminated");
            }
        });
        SessionHandle { source, task }
    }

    /// One probe pass: withdraw dead sessions; rebuild the pool when empty
    pub async fn probe_once(&self) {
        let mut withdrawn = Vec::new();
        {
            let mut pool = self.pool.lock().await;
            let mut dead = Vec::new();
            for (id, handle) in pool.iter() {
                let alive = !handle.task.is_finished() && handle.source.probe().await;
                if !alive {
                    dead.push(id.clone());
                }
            }
            for id in dead {
                if let Some(handle) = pool.remove(&id) {
                    handle.task.abort();
                    withdrawn.push(id);
                }
            }
        }

        for id in &withdrawn {
            warn!(session = %id, "session withdrawn from pool");
        }

        let empty = self.pool.lock().await.is_empty();
        if empty && !self.sources.is_empty() {
            warn!("session pool empty, re-establishing all sessions");
            self.start_all().await;
        }
    }

    /// Number of sessions currently in the pool
    pub async fn pool_size(&self) -> usize {
        self.pool.lock().await.len()
    }

    /// Periodic probe loop; runs until cancelled
    pub async fn run_probe_loop(&self, cancel: CancellationToken) {
        let mut interval = tokio::time::interval(self.probe_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The immediate first tick would probe before sessions settle
        interval.tick().await;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("probe loop stopped");
                    return;
                }
                _ = interval.tick() => {
                    self.probe_once().await;
                }
            }
        }
    }

    /// Abort every session task
    pub async fn shutdown(&self) {
        let mut pool = self.pool.lock().await;
        for (id, handle) in pool.drain() {
            handle.task.abort();
            debug!(session = %id, "session stopped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Result;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

    /// Source whose liveness is flipped from the test
    struct FakeSource {
        id: String,
        alive: AtomicBool,
        runs: AtomicU32,
    }

    #[async_trait]
    impl UpdateSource for FakeSource {
        fn session_id(&self) -> &str {
            &self.id
        }

        async fn run(&self, _events: async_channel::Sender<SessionEvent>) -> Result<()> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            // Stay "connected" until aborted
            loop {
                tokio::time::sleep(Duration::from_secs(3600)).await;
            }
        }

        async fn probe(&self) -> bool {
            self.alive.load(Ordering::SeqCst)
        }
    }

    fn fake(id: &str, alive: bool) -> Arc<FakeSource> {
        Arc::new(FakeSource {
            id: id.into(),
            alive: AtomicBool::new(alive),
            runs: AtomicU32::new(0),
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_all_fills_pool() {
        let (manager, _rx) = SessionManager::new(
            vec![fake("a", true), fake("b", true)],
            &SessionsConfig::default(),
        );
        manager.start_all().await;
        assert_eq!(manager.pool_size().await, 2);
        manager.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_probe_withdraws_failing_session() {
        let healthy = fake("healthy", true);
        let sick = fake("sick", false);
        let (manager, _rx) = SessionManager::new(
            vec![healthy.clone(), sick.clone()],
            &SessionsConfig::default(),
        );
        manager.start_all().await;
        tokio::time::sleep(Duration::from_millis(10)).await;

        manager.probe_once().await;
        assert_eq!(manager.pool_size().await, 1);
        manager.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_pool_triggers_full_restart() {
        let a = fake("a", false);
        let b = fake("b", false);
        let (manager, _rx) =
            SessionManager::new(vec![a.clone(), b.clone()], &SessionsConfig::default());
        manager.start_all().await;
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(a.runs.load(Ordering::SeqCst), 1);

        // Both fail their probe; the pool empties and everything respawns
        manager.probe_once().await;
        assert_eq!(manager.pool_size().await, 2);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(a.runs.load(Ordering::SeqCst), 2);
        assert_eq!(b.runs.load(Ordering::SeqCst), 2);
        manager.shutdown().await;
    }
}
