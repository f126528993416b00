//! ATH / early-drop analyzer
//!
//! Phased adaptive-resolution scan over post-detection price history. The
//! early window is volatile and gets fine resolution; later windows are
//! coarse to keep the API budget bounded. The scan consumes samples in time
//! order and terminates outright at the first sample at or below half the
//! initial price.

mod price_api;
mod rate_limit;

pub use price_api::{HttpPriceHistoryClient, PriceHistorySource, PricePoint, Resolution};
pub use rate_limit::RateLimiter;

use chrono::{DateTime, Duration, TimeZone, Utc};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration as StdDuration;
use tracing::{debug, warn};

use crate::config::{AnalyzerConfig, PriceApiConfig};
use crate::error::{Error, Result};
use crate::model::{AthResult, EarlyDrop, SIMULATED_PREFIX};

/// Early-drop thresholds, percent below the initial price
const DROP_THRESHOLDS: [u32; 4] = [20, 30, 40, 50];

/// Maximum span of a single history request before client-side chunking
const MAX_REQUEST_SPAN: Duration = Duration::days(7);

/// Delay between chunked sub-requests
const INTER_CHUNK_DELAY: StdDuration = StdDuration::from_millis(200);

/// One analysis request
#[derive(Debug, Clone)]
pub struct ScanRequest {
    pub token_address: String,
    pub detection_time: DateTime<Utc>,
    pub initial_market_cap: f64,
    pub end_time: DateTime<Utc>,
}

/// Outcome of one scan; `result()` flattens to the optional payload
#[derive(Debug, Clone)]
pub enum ScanOutcome {
    Complete(AthResult),
    /// Phase 1 had no usable samples
    NoData,
    /// The API rejected the token (4xx)
    UnknownToken,
    RateLimited,
    /// Transient failure with nothing accumulated
    Failed,
}

impl ScanOutcome {
    pub fn result(self) -> Option<AthResult> {
        match self {
            ScanOutcome::Complete(r) => Some(r),
            _ => None,
        }
    }

    pub fn reason(&self) -> &'static str {
        match self {
            ScanOutcome::Complete(_) => "ok",
            ScanOutcome::NoData => "no data",
            ScanOutcome::UnknownToken => "unknown token",
            ScanOutcome::RateLimited => "rate limit",
            ScanOutcome::Failed => "api failure",
        }
    }
}

/// Failure counters exposed on the status surface
#[derive(Debug, Default)]
pub struct AnalyzerCounters {
    pub completed: AtomicU64,
    pub no_data: AtomicU64,
    pub unknown_tokens: AtomicU64,
    pub rate_limited: AtomicU64,
    pub failures: AtomicU64,
}

struct Phase {
    start_min: i64,
    end_min: i64,
    resolution: Resolution,
}

/// Post-detection price scanner
pub struct AthAnalyzer {
    source: Arc<dyn PriceHistorySource>,
    limiter: Arc<RateLimiter>,
    config: AnalyzerConfig,
    request_timeout: StdDuration,
    pub counters: AnalyzerCounters,
}

impl AthAnalyzer {
    pub fn new(
        source: Arc<dyn PriceHistorySource>,
        price_config: &PriceApiConfig,
        config: AnalyzerConfig,
    ) -> Self {
        let limiter = Arc::new(RateLimiter::new(
            price_config.requests_per_second,
            price_config.inter_request_delay_ms,
        ));
        Self {
            source,
            limiter,
            config,
            request_timeout: StdDuration::from_secs(price_config.request_timeout_secs),
            counters: AnalyzerCounters::default(),
        }
    }

    fn phases(&self) -> Vec<Phase> {
        let span_min = (self.config.scan_span_hours as i64 * 60).max(120);
        vec![
            Phase {
                start_min: 0,
                end_min: 30,
                resolution: Resolution::M5,
            },
            Phase {
                start_min: 30,
                end_min: 120,
                resolution: Resolution::M15,
            },
            Phase {
                start_min: 120,
                end_min: span_min,
                resolution: Resolution::M30,
            },
        ]
    }

    /// Convenience wrapper returning just the optional result
    pub async fn analyze(&self, request: &ScanRequest) -> Option<AthResult> {
        self.scan(request).await.result()
    }

    /// Run the phased scan. Never returns an error: failures are counted and
    /// collapse into the outcome.
    pub async fn scan(&self, request: &ScanRequest) -> ScanOutcome {
        if request.token_address.starts_with(SIMULATED_PREFIX)
            || !crate::model::is_valid_address(&request.token_address)
        {
            debug!(token = %request.token_address, "rejected without network call");
            self.counters.unknown_tokens.fetch_add(1, Ordering::Relaxed);
            return ScanOutcome::UnknownToken;
        }

        let mut state: Option<ScanState> = None;

        'phases: for phase in self.phases() {
            let phase_start = request.detection_time + Duration::minutes(phase.start_min);
            let phase_end =
                (request.detection_time + Duration::minutes(phase.end_min)).min(request.end_time);
            if phase_start >= phase_end {
                continue;
            }

            let points = match self
                .fetch_range(
                    &request.token_address,
                    phase_start,
                    phase_end,
                    phase.resolution,
                )
                .await
            {
                Ok(points) => points,
                Err(e) => {
                    warn!(
                        token = %request.token_address,
                        error = %e,
                        partial = state.is_some(),
                        "phase fetch failed"
                    );
                    if state.is_some() {
                        // Yield whatever has been accumulated
                        break 'phases;
                    }
                    return match &e {
                        Error::AnalyzerRateLimited => {
                            self.counters.rate_limited.fetch_add(1, Ordering::Relaxed);
                            ScanOutcome::RateLimited
                        }
                        e if e.is_unknown_token() => {
                            self.counters.unknown_tokens.fetch_add(1, Ordering::Relaxed);
                            ScanOutcome::UnknownToken
                        }
                        _ => {
                            self.counters.failures.fetch_add(1, Ordering::Relaxed);
                            ScanOutcome::Failed
                        }
                    };
                }
            };

            if state.is_none() {
                // Phase 1 establishes the initial price
                let usable = points.first().map(|p| p.value > 0.0).unwrap_or(false);
                if !usable {
                    self.counters.no_data.fetch_add(1, Ordering::Relaxed);
                    return ScanOutcome::NoData;
                }
                let first = points[0];
                state = Some(ScanState::new(first.value, first.unix_time));
            }
            let scan = state.as_mut().expect("state initialized above");

            for point in points {
                if !scan.consume(point, request.detection_time) {
                    // 50% drop: terminate the entire scan
                    break 'phases;
                }
            }
        }

        match state {
            Some(state) => {
                self.counters.completed.fetch_add(1, Ordering::Relaxed);
                ScanOutcome::Complete(state.finish(request))
            }
            None => {
                self.counters.no_data.fetch_add(1, Ordering::Relaxed);
                ScanOutcome::NoData
            }
        }
    }

    /// Fetch one phase range, chunked to the 7-day request ceiling, with one
    /// retry on a transient failure
    async fn fetch_range(
        &self,
        token: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        resolution: Resolution,
    ) -> Result<Vec<PricePoint>> {
        let mut all = Vec::new();
        let mut chunk_start = from;
        let mut first_chunk = true;

        while chunk_start < to {
            let chunk_end = (chunk_start + MAX_REQUEST_SPAN).min(to);
            if !first_chunk {
                tokio::time::sleep(INTER_CHUNK_DELAY).await;
            }
            first_chunk = false;

            let points = self
                .request_once_retried(token, chunk_start, chunk_end, resolution)
                .await?;
            all.extend(points);
            chunk_start = chunk_end;
        }
        Ok(all)
    }

    async fn request_once_retried(
        &self,
        token: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        resolution: Resolution,
    ) -> Result<Vec<PricePoint>> {
        match self.request_once(token, from, to, resolution).await {
            Ok(points) => Ok(points),
            // 4xx is permanent; everything transient gets one more try
            Err(e) if e.is_retryable() => {
                tokio::time::sleep(StdDuration::from_secs(1)).await;
                self.request_once(token, from, to, resolution).await
            }
            Err(e) => Err(e),
        }
    }

    async fn request_once(
        &self,
        token: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        resolution: Resolution,
    ) -> Result<Vec<PricePoint>> {
        self.limiter.acquire().await;
        match tokio::time::timeout(
            self.request_timeout,
            self.source.price_history(token, from, to, resolution),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(Error::PriceApiTimeout(
                self.request_timeout.as_millis() as u64
            )),
        }
    }

    /// Batch orchestrator: fixed-size groups with an inter-group delay.
    /// Tokens run sequentially inside a group so the rate budget stays
    /// predictable.
    pub async fn analyze_batch(&self, requests: &[ScanRequest]) -> Vec<ScanOutcome> {
        let far_deadline = tokio::time::Instant::now() + StdDuration::from_secs(60 * 60 * 24);
        self.analyze_batch_until(requests, far_deadline).await
    }

    /// Deadline-aware batch: stops issuing work once the deadline passes and
    /// returns the outcomes gathered so far (possibly fewer than requested)
    pub async fn analyze_batch_until(
        &self,
        requests: &[ScanRequest],
        deadline: tokio::time::Instant,
    ) -> Vec<ScanOutcome> {
        let mut outcomes = Vec::with_capacity(requests.len());
        for (group_idx, group) in requests.chunks(self.config.batch_size.max(1)).enumerate() {
            if tokio::time::Instant::now() >= deadline {
                warn!(
                    analyzed = outcomes.len(),
                    total = requests.len(),
                    "batch deadline reached, returning partial outcomes"
                );
                break;
            }
            if group_idx > 0 {
                tokio::time::sleep(StdDuration::from_millis(self.config.inter_batch_delay_ms))
                    .await;
            }
            for request in group {
                outcomes.push(self.scan(request).await);
            }
        }
        outcomes
    }
}

/// Accumulated scan state across phases
struct ScanState {
    initial_price: f64,
    max_price: f64,
    max_ts: i64,
    min_before_ath: f64,
    min_before_ath_ts: i64,
    min_price: f64,
    early_drops: Vec<EarlyDrop>,
    drop_50: Option<i64>,
    history: Vec<PricePoint>,
    last_ts: i64,
}

impl ScanState {
    fn new(initial_price: f64, first_ts: i64) -> Self {
        Self {
            initial_price,
            max_price: f64::MIN,
            max_ts: first_ts,
            min_before_ath: initial_price,
            min_before_ath_ts: first_ts,
            min_price: f64::MAX,
            early_drops: Vec::new(),
            drop_50: None,
            history: Vec::new(),
            last_ts: i64::MIN,
        }
    }

    /// Consume one sample; false when the scan must terminate (50% drop)
    fn consume(&mut self, point: PricePoint, detection: DateTime<Utc>) -> bool {
        // Phase boundaries may repeat a sample
        if point.unix_time <= self.last_ts {
            return true;
        }
        self.last_ts = point.unix_time;

        if point.value > self.max_price {
            self.max_price = point.value;
            self.max_ts = point.unix_time;
            // New peak: recompute the minimum strictly before it
            self.min_before_ath = self.initial_price;
            self.min_before_ath_ts = self
                .history
                .first()
                .map(|p| p.unix_time)
                .unwrap_or(point.unix_time);
            for prior in &self.history {
                if prior.value < self.min_before_ath {
                    self.min_before_ath = prior.value;
                    self.min_before_ath_ts = prior.unix_time;
                }
            }
        }
        if point.value < self.min_price {
            self.min_price = point.value;
        }

        let minutes = (point.unix_time - detection.timestamp()) / 60;
        for threshold in DROP_THRESHOLDS {
            let floor = self.initial_price * (1.0 - threshold as f64 / 100.0);
            if point.value <= floor
                && !self
                    .early_drops
                    .iter()
                    .any(|d| d.threshold_pct == threshold)
            {
                self.early_drops.push(EarlyDrop {
                    threshold_pct: threshold,
                    minutes_from_detection: minutes,
                });
            }
        }

        self.history.push(point);

        if point.value <= 0.5 * self.initial_price {
            self.drop_50 = Some(point.unix_time);
            return false;
        }
        true
    }

    fn finish(self, request: &ScanRequest) -> AthResult {
        let detection_ts = request.detection_time.timestamp();
        let ath_price = self.max_price.max(self.initial_price);
        AthResult {
            token_address: request.token_address.clone(),
            initial_price: self.initial_price,
            ath_price,
            ath_timestamp: Utc
                .timestamp_opt(self.max_ts, 0)
                .single()
                .unwrap_or(request.detection_time),
            percentage_gain: if self.initial_price > 0.0 {
                (ath_price / self.initial_price - 1.0) * 100.0
            } else {
                0.0
            },
            minutes_to_ath: (self.max_ts - detection_ts) / 60,
            min_price_before_ath: self.min_before_ath,
            minutes_to_min_before_ath: (self.min_before_ath_ts - detection_ts) / 60,
            early_drops: self.early_drops,
            drop_50pct_detected: self.drop_50.is_some(),
            drop_50pct_timestamp: self
                .drop_50
                .and_then(|ts| Utc.timestamp_opt(ts, 0).single()),
            data_points: self.history.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::TimeZone;
    use tokio::sync::Mutex;

    const ADDR: &str = "7xKXtg2CW87d97TXJSDpbD5jBkheTqA83TZRuJosgAsU";

    fn detection() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap()
    }

    fn point(minute: i64, value: f64) -> PricePoint {
        PricePoint {
            unix_time: detection().timestamp() + minute * 60,
            value,
        }
    }

    /// Source that answers from a fixed series and records every request
    struct ScriptedSource {
        points: Vec<PricePoint>,
        requests: Mutex<Vec<(i64, i64, Resolution)>>,
        fail_phases: Vec<Resolution>,
        error: fn() -> Error,
    }

    impl ScriptedSource {
        fn new(points: Vec<PricePoint>) -> Self {
            Self {
                points,
                requests: Mutex::new(Vec::new()),
                fail_phases: Vec::new(),
                error: || Error::PriceApi {
                    status: 503,
                    message: "scripted".into(),
                },
            }
        }
    }

    #[async_trait]
    impl PriceHistorySource for ScriptedSource {
        async fn price_history(
            &self,
            _token: &str,
            from: DateTime<Utc>,
            to: DateTime<Utc>,
            resolution: Resolution,
        ) -> Result<Vec<PricePoint>> {
            self.requests
                .lock()
                .await
                .push((from.timestamp(), to.timestamp(), resolution));
            if self.fail_phases.contains(&resolution) {
                return Err((self.error)());
            }
            Ok(self
                .points
                .iter()
                .filter(|p| p.unix_time >= from.timestamp() && p.unix_time <= to.timestamp())
                .copied()
                .collect())
        }
    }

    fn analyzer(source: Arc<ScriptedSource>) -> AthAnalyzer {
        AthAnalyzer::new(
            source,
            &PriceApiConfig::default(),
            AnalyzerConfig::default(),
        )
    }

    fn request() -> ScanRequest {
        ScanRequest {
            token_address: ADDR.into(),
            detection_time: detection(),
            initial_market_cap: 50_000.0,
            end_time: detection() + Duration::hours(48),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_phased_scan_with_50pct_termination() {
        // Phase 1 monotone +200%, phase 2 flat, phase 3 crosses half the
        // initial price at minute 170
        let mut points = Vec::new();
        for i in 0..=6i64 {
            points.push(point(i * 5, 1.0 + 2.0 * (i as f64 / 6.0)));
        }
        for minute in [45, 60, 75, 90, 105, 120] {
            points.push(point(minute, 3.0));
        }
        points.push(point(150, 1.2));
        points.push(point(170, 0.45));
        points.push(point(200, 0.40));

        let source = Arc::new(ScriptedSource::new(points));
        let a = analyzer(source.clone());
        let result = a.analyze(&request()).await.unwrap();

        assert_eq!(result.initial_price, 1.0);
        assert_eq!(result.ath_price, 3.0);
        assert!((result.percentage_gain - 200.0).abs() < 1e-9);
        assert_eq!(result.minutes_to_ath, 30);
        assert!(result.drop_50pct_detected);
        assert_eq!(
            result.drop_50pct_timestamp.unwrap(),
            detection() + Duration::minutes(170)
        );
        // The minute-200 sample past the termination point is not consumed
        assert_eq!(result.data_points, 15);

        // Three phase requests were issued, none starting past the drop
        let requests = source.requests.lock().await;
        assert_eq!(requests.len(), 3);
        let drop_ts = (detection() + Duration::minutes(170)).timestamp();
        assert!(requests.iter().all(|(from, _, _)| *from <= drop_ts));
    }

    #[tokio::test(start_paused = true)]
    async fn test_phase1_only_monotone_rise() {
        let points: Vec<PricePoint> = (0..=6i64).map(|i| point(i * 5, 1.0 + i as f64)).collect();
        let a = analyzer(Arc::new(ScriptedSource::new(points)));
        let result = a.analyze(&request()).await.unwrap();

        assert_eq!(result.ath_price, 7.0);
        assert_eq!(result.minutes_to_ath, 30);
        assert!(result.early_drops.is_empty());
        assert!(!result.drop_50pct_detected);
        assert_eq!(result.data_points, 7);
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_phase1_is_none() {
        let a = analyzer(Arc::new(ScriptedSource::new(vec![])));
        assert!(a.analyze(&request()).await.is_none());
        assert_eq!(a.counters.no_data.load(Ordering::Relaxed), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_initial_price_is_none() {
        let a = analyzer(Arc::new(ScriptedSource::new(vec![
            point(0, 0.0),
            point(5, 1.0),
        ])));
        assert!(a.analyze(&request()).await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_simulated_prefix_rejected_without_request() {
        let source = Arc::new(ScriptedSource::new(vec![point(0, 1.0)]));
        let a = analyzer(source.clone());
        let mut req = request();
        req.token_address = format!("{SIMULATED_PREFIX}abc");
        assert!(matches!(a.scan(&req).await, ScanOutcome::UnknownToken));
        assert!(source.requests.lock().await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_early_drop_thresholds() {
        let points = vec![
            point(0, 1.0),
            point(5, 0.78),  // crosses 20%
            point(10, 0.65), // crosses 30%
            point(15, 0.55), // crosses 40%
            point(20, 0.50), // crosses 50% and terminates
            point(25, 0.45),
        ];
        let a = analyzer(Arc::new(ScriptedSource::new(points)));
        let result = a.analyze(&request()).await.unwrap();

        let thresholds: Vec<u32> = result.early_drops.iter().map(|d| d.threshold_pct).collect();
        assert_eq!(thresholds, vec![20, 30, 40, 50]);
        assert_eq!(result.early_drops[0].minutes_from_detection, 5);
        assert!(result.drop_50pct_detected);
        assert_eq!(result.data_points, 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_min_before_ath_rescan() {
        let points = vec![
            point(0, 1.0),
            point(5, 0.8),
            point(10, 2.0),
            point(15, 1.5),
            point(20, 3.0), // new peak; minimum strictly before is still 0.8
        ];
        let a = analyzer(Arc::new(ScriptedSource::new(points)));
        let result = a.analyze(&request()).await.unwrap();
        assert_eq!(result.ath_price, 3.0);
        assert_eq!(result.min_price_before_ath, 0.8);
        assert_eq!(result.minutes_to_min_before_ath, 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_4xx_mid_scan_returns_partial() {
        let points: Vec<PricePoint> = (0..=6i64).map(|i| point(i * 5, 1.0 + i as f64)).collect();
        let source = Arc::new(ScriptedSource {
            points,
            requests: Mutex::new(Vec::new()),
            fail_phases: vec![Resolution::M15],
            error: || Error::AnalyzerUnknownToken(ADDR.into()),
        });
        let a = analyzer(source.clone());
        let result = a.analyze(&request()).await.unwrap();
        // Accumulated phase-1 data survives the phase-2 4xx
        assert_eq!(result.ath_price, 7.0);

        // The 4xx was not retried
        let requests = source.requests.lock().await;
        let m15_attempts = requests
            .iter()
            .filter(|(_, _, r)| *r == Resolution::M15)
            .count();
        assert_eq!(m15_attempts, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_4xx_on_phase1_is_unknown_token() {
        let source = Arc::new(ScriptedSource {
            points: vec![],
            requests: Mutex::new(Vec::new()),
            fail_phases: vec![Resolution::M5],
            error: || Error::AnalyzerUnknownToken(ADDR.into()),
        });
        let a = analyzer(source);
        assert!(matches!(a.scan(&request()).await, ScanOutcome::UnknownToken));
        assert_eq!(a.counters.unknown_tokens.load(Ordering::Relaxed), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_5xx_retried_once_then_partial() {
        let points: Vec<PricePoint> = (0..=6i64).map(|i| point(i * 5, 1.0 + i as f64)).collect();
        let source = Arc::new(ScriptedSource {
            points,
            requests: Mutex::new(Vec::new()),
            fail_phases: vec![Resolution::M15],
            error: || Error::PriceApi {
                status: 503,
                message: "down".into(),
            },
        });
        let a = analyzer(source.clone());
        let result = a.analyze(&request()).await.unwrap();
        assert_eq!(result.ath_price, 7.0);

        // Original attempt plus exactly one retry for the failing phase
        let requests = source.requests.lock().await;
        let m15_attempts = requests
            .iter()
            .filter(|(_, _, r)| *r == Resolution::M15)
            .count();
        assert_eq!(m15_attempts, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_requests_after_termination() {
        let points = vec![point(0, 1.0), point(5, 0.4)];
        let source = Arc::new(ScriptedSource::new(points));
        let a = analyzer(source.clone());
        let result = a.analyze(&request()).await.unwrap();
        assert!(result.drop_50pct_detected);

        // Only the phase-1 request was issued
        let requests = source.requests.lock().await;
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].2, Resolution::M5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_long_range_is_chunked() {
        let points = vec![point(0, 1.0), point(5, 1.1)];
        let source = Arc::new(ScriptedSource::new(points));
        let config = AnalyzerConfig {
            scan_span_hours: 24 * 10, // ten days forces chunking in phase 3
            ..Default::default()
        };
        let a = AthAnalyzer::new(source.clone(), &PriceApiConfig::default(), config);
        let mut req = request();
        req.end_time = detection() + Duration::days(10);
        a.analyze(&req).await.unwrap();

        let requests = source.requests.lock().await;
        let m30_chunks: Vec<_> = requests
            .iter()
            .filter(|(_, _, r)| *r == Resolution::M30)
            .collect();
        assert_eq!(m30_chunks.len(), 2);
        let seven_days = 7 * 24 * 3600;
        assert_eq!(m30_chunks[0].1 - m30_chunks[0].0, seven_days);
        assert_eq!(m30_chunks[1].0, m30_chunks[0].1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_batch_orchestrator_paces_groups() {
        let points = vec![point(0, 1.0), point(5, 1.1)];
        let a = analyzer(Arc::new(ScriptedSource::new(points)));
        let requests: Vec<ScanRequest> = (0..7).map(|_| request()).collect();

        let started = tokio::time::Instant::now();
        let outcomes = a.analyze_batch(&requests).await;
        assert_eq!(outcomes.len(), 7);
        // Seven tokens in groups of three: two inter-group delays of 1 s
        assert!(started.elapsed() >= StdDuration::from_secs(2));
    }
}
