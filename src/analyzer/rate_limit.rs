//! Process-wide request budget for the price-history API
//!
//! Token bucket plus a minimum inter-request gap. The gap alone bounds the
//! rolling 1-second window: with a 200 ms floor no more than five requests
//! can start in any one-second span.

use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

struct State {
    tokens: f64,
    last_refill: Instant,
    last_acquire: Option<Instant>,
}

/// Shared token-bucket limiter
pub struct RateLimiter {
    capacity: f64,
    refill_per_sec: f64,
    min_gap: Duration,
    state: Mutex<State>,
}

impl RateLimiter {
    pub fn new(requests_per_second: u32, min_gap_ms: u64) -> Self {
        let capacity = requests_per_second as f64;
        Self {
            capacity,
            refill_per_sec: capacity,
            min_gap: Duration::from_millis(min_gap_ms),
            state: Mutex::new(State {
                tokens: capacity,
                last_refill: Instant::now(),
                last_acquire: None,
            }),
        }
    }

    /// Wait until a request may start
    pub async fn acquire(&self) {
        loop {
            let wait = {
                let mut state = self.state.lock().await;
                let now = Instant::now();

                let elapsed = now.duration_since(state.last_refill).as_secs_f64();
                state.tokens = (state.tokens + elapsed * self.refill_per_sec).min(self.capacity);
                state.last_refill = now;

                let gap_wait = state
                    .last_acquire
                    .map(|last| (last + self.min_gap).saturating_duration_since(now))
                    .unwrap_or(Duration::ZERO);

                if state.tokens >= 1.0 && gap_wait.is_zero() {
                    state.tokens -= 1.0;
                    state.last_acquire = Some(now);
                    return;
                }

                let token_wait = if state.tokens >= 1.0 {
                    Duration::ZERO
                } else {
                    Duration::from_secs_f64((1.0 - state.tokens) / self.refill_per_sec)
                };
                token_wait.max(gap_wait)
            };
            tokio::time::sleep(wait.max(Duration::from_millis(1))).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_min_gap_paces_requests() {
        let limiter = RateLimiter::new(5, 200);
        let start = Instant::now();
        for _ in 0..10 {
            limiter.acquire().await;
        }
        // Nine gaps of at least 200 ms between ten request starts
        assert!(start.elapsed() >= Duration::from_millis(1800));
    }

    #[tokio::test(start_paused = true)]
    async fn test_rolling_window_budget() {
        let limiter = RateLimiter::new(5, 200);
        let mut starts = Vec::new();
        for _ in 0..12 {
            limiter.acquire().await;
            starts.push(Instant::now());
        }
        // No more than five starts in any rolling one-second window
        for (i, t) in starts.iter().enumerate() {
            let in_window = starts[i..]
                .iter()
                .take_while(|s| s.duration_since(*t) < Duration::from_secs(1))
                .count();
            assert!(in_window <= 5, "window starting at {i} held {in_window}");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_acquire_is_immediate() {
        let limiter = RateLimiter::new(5, 200);
        let start = Instant::now();
        limiter.acquire().await;
        assert!(start.elapsed() < Duration::from_millis(50));
    }
}
