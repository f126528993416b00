//! Per-tenant ingestion queue engine
//!
//! Each tenant owns an isolated FIFO; at most one batch is in flight per
//! tenant while batches across tenants run in parallel under a bounded
//! worker pool. The scheduler rotates through tenants with pending work,
//! draining up to `batch_max` jobs before yielding the slot.
//!
//! Failures wear a reap-on-process retry envelope: the failed job goes back
//! to the front with a not-before instant, and the scheduler simply skips
//! the tenant until the delay elapses. No timers accumulate.

mod job;

pub use job::{IngestJob, JobMeta, TenantStats};

use dashmap::DashMap;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration as StdDuration;
use tokio::sync::{Mutex, Notify, Semaphore};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::alert::{AlertSink, ConfluenceAlert};
use crate::config::QueueConfig;
use crate::engine::ConfluenceEngine;
use crate::error::{Error, Result};
use crate::model::TenantId;
use crate::store::Store;

struct TenantQueue {
    jobs: Mutex<VecDeque<IngestJob>>,
    in_flight: AtomicBool,
    cancel: CancellationToken,
    stats: Mutex<TenantStats>,
}

impl TenantQueue {
    fn new() -> Self {
        Self {
            jobs: Mutex::new(VecDeque::new()),
            in_flight: AtomicBool::new(false),
            cancel: CancellationToken::new(),
            stats: Mutex::new(TenantStats::default()),
        }
    }
}

/// Fair multi-tenant job processor
pub struct QueueEngine {
    config: QueueConfig,
    store: Arc<dyn Store>,
    engine: Arc<ConfluenceEngine>,
    alerts: Arc<dyn AlertSink>,
    queues: DashMap<TenantId, Arc<TenantQueue>>,
    workers: Arc<Semaphore>,
    wakeup: Arc<Notify>,
    cursor: AtomicUsize,
}

impl QueueEngine {
    pub fn new(
        config: QueueConfig,
        store: Arc<dyn Store>,
        engine: Arc<ConfluenceEngine>,
        alerts: Arc<dyn AlertSink>,
    ) -> Arc<Self> {
        let workers = Arc::new(Semaphore::new(config.workers));
        Arc::new(Self {
            config,
            store,
            engine,
            alerts,
            queues: DashMap::new(),
            workers,
            wakeup: Arc::new(Notify::new()),
            cursor: AtomicUsize::new(0),
        })
    }

    /// Append a job to its tenant's queue
    pub async fn enqueue(&self, job: IngestJob) {
        let tenant = job.tenant;
        let queue = Arc::clone(
            self.queues
                .entry(tenant)
                .or_insert_with(|| Arc::new(TenantQueue::new()))
                .value(),
        );

        let pending = {
            let mut jobs = queue.jobs.lock().await;
            if let Some(cap) = self.config.hard_cap {
                while jobs.len() >= cap {
                    jobs.pop_front();
                    queue.stats.lock().await.dropped += 1;
                    warn!(%tenant, cap, "queue hard cap hit, oldest job dropped");
                }
            }
            jobs.push_back(job);
            jobs.len()
        };

        if pending == self.config.warn_pending {
            warn!(%tenant, pending, "tenant queue backlog at warn threshold");
        }
        self.wakeup.notify_waiters();
    }

    /// Cancel all pending work for a tenant; the in-flight job (if any) runs
    /// to completion and discards its output
    pub async fn cancel_tenant(&self, tenant: TenantId) {
        if let Some((_, queue)) = self.queues.remove(&tenant) {
            queue.cancel.cancel();
            let dropped = {
                let mut jobs = queue.jobs.lock().await;
                let n = jobs.len();
                jobs.clear();
                n
            };
            info!(%tenant, dropped, "tenant queue cancelled");
        }
    }

    /// Stats snapshot for one tenant
    pub async fn stats(&self, tenant: TenantId) -> Option<TenantStats> {
        let queue = self.queues.get(&tenant).map(|q| Arc::clone(q.value()))?;
        let mut stats = queue.stats.lock().await.clone();
        stats.pending = queue.jobs.lock().await.len();
        Some(stats)
    }

    /// Stats for every known tenant
    pub async fn all_stats(&self) -> Vec<(TenantId, TenantStats)> {
        let tenants: Vec<TenantId> = self.queues.iter().map(|e| *e.key()).collect();
        let mut out = Vec::with_capacity(tenants.len());
        for tenant in tenants {
            if let Some(stats) = self.stats(tenant).await {
                out.push((tenant, stats));
            }
        }
        out
    }

    /// Run the scheduler until cancelled
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        info!(
            workers = self.config.workers,
            batch_max = self.config.batch_max,
            "queue engine started"
        );
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("queue engine stopped");
                    return;
                }
                _ = self.wakeup.notified() => {}
                // Periodic re-check for retry envelopes coming due
                _ = tokio::time::sleep(StdDuration::from_millis(100)) => {}
            }
            self.schedule_pass().await;
        }
    }

    /// One fair pass: each eligible tenant gets at most one batch
    async fn schedule_pass(self: &Arc<Self>) {
        let mut tenants: Vec<TenantId> = self.queues.iter().map(|e| *e.key()).collect();
        if tenants.is_empty() {
            return;
        }
        tenants.sort();
        let start = self.cursor.fetch_add(1, Ordering::Relaxed) % tenants.len();

        for i in 0..tenants.len() {
            let tenant = tenants[(start + i) % tenants.len()];
            let Some(queue) = self.queues.get(&tenant).map(|q| Arc::clone(q.value())) else {
                continue;
            };
            if queue.cancel.is_cancelled() {
                continue;
            }
            {
                let jobs = queue.jobs.lock().await;
                match jobs.front() {
                    Some(head) if head.is_ready(Instant::now()) => {}
                    _ => continue,
                }
            }
            // One batch per tenant at a time
            if queue.in_flight.swap(true, Ordering::AcqRel) {
                continue;
            }
            let Ok(permit) = self.workers.clone().try_acquire_owned() else {
                queue.in_flight.store(false, Ordering::Release);
                // Pool exhausted; the rest of the pass would not get a slot
                return;
            };

            let this = self.clone();
            tokio::spawn(async move {
                this.process_batch(tenant, queue.clone()).await;
                queue.in_flight.store(false, Ordering::Release);
                drop(permit);
                this.wakeup.notify_waiters();
            });
        }
    }

    /// Drain up to `batch_max` jobs from one tenant, stopping early on a
    /// retry envelope or cancellation
    async fn process_batch(&self, tenant: TenantId, queue: Arc<TenantQueue>) {
        for _ in 0..self.config.batch_max {
            if queue.cancel.is_cancelled() {
                queue.jobs.lock().await.clear();
                return;
            }

            let job = {
                let mut jobs = queue.jobs.lock().await;
                match jobs.front() {
                    Some(head) if head.is_ready(Instant::now()) => jobs.pop_front(),
                    _ => None,
                }
            };
            let Some(mut job) = job else {
                return;
            };

            let started = Instant::now();
            match self.process_job(&job, &queue.cancel).await {
                Ok(()) => {
                    let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;
                    queue.stats.lock().await.record_processed(elapsed_ms);
                }
                Err(e) if e.is_retryable() && job.attempts < self.config.max_attempts => {
                    job.attempts += 1;
                    let delay = StdDuration::from_secs(1 << job.attempts);
                    job.not_before = Some(Instant::now() + delay);
                    warn!(
                        %tenant,
                        job = %job.id,
                        attempts = job.attempts,
                        delay_s = delay.as_secs(),
                        error = %e,
                        "job failed, re-enqueued at front"
                    );
                    queue.jobs.lock().await.push_front(job);
                    return;
                }
                Err(e) => {
                    let mut stats = queue.stats.lock().await;
                    stats.errors += 1;
                    warn!(
                        %tenant,
                        job = %job.id,
                        attempts = job.attempts,
                        error = %e,
                        "job abandoned"
                    );
                }
            }
        }
    }

    /// Persist, ingest, and emit token-scoped alerts for one job
    async fn process_job(&self, job: &IngestJob, cancel: &CancellationToken) -> Result<()> {
        self.store
            .store_transaction(job.tenant, &job.payload)
            .await?;

        let confluences = self.engine.ingest(job.tenant, job.payload.clone()).await?;

        // Tenant removed while we were processing: discard the output
        if cancel.is_cancelled() {
            debug!(tenant = %job.tenant, "tenant cancelled mid-job, output discarded");
            return Ok(());
        }

        for confluence in confluences.iter().filter(|c| job.matches_alert(c)) {
            let alert = ConfluenceAlert::from_confluence(confluence);
            self.send_with_retry(&alert).await?;
        }
        Ok(())
    }

    /// Alert send retried inside the job; a final failure surfaces as a
    /// retryable job error
    async fn send_with_retry(&self, alert: &ConfluenceAlert) -> Result<()> {
        let policy = backoff::ExponentialBackoff {
            initial_interval: StdDuration::from_millis(250),
            max_interval: StdDuration::from_secs(2),
            max_elapsed_time: Some(StdDuration::from_secs(5)),
            ..Default::default()
        };
        backoff::future::retry(policy, || async {
            self.alerts.send(alert).await.map_err(|e| {
                if e.is_retryable() {
                    backoff::Error::transient(e)
                } else {
                    backoff::Error::permanent(e)
                }
            })
        })
        .await
        .map_err(|e| Error::AlertSend(e.to_string()))
    }
}
