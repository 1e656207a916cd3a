use crate::error::PipelineError;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

/// Token bucket state. Lives behind the limiter's mutex and is never
/// shared by value.
#[derive(Debug)]
struct RateBudget {
    tokens: f64,
    capacity: f64,
    refill_per_sec: f64,
    last_refill: Instant,
}

impl RateBudget {
    /// Credit tokens for the time elapsed since the last refill.
    fn refill(&mut self, now: Instant) {
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        if elapsed > 0.0 {
            self.tokens = (self.tokens + elapsed * self.refill_per_sec).min(self.capacity);
            self.last_refill = now;
        }
    }

    /// Time until one whole token will be available, assuming no other taker.
    fn time_to_next_token(&self) -> Duration {
        let deficit = 1.0 - self.tokens;
        if deficit <= 0.0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64(deficit / self.refill_per_sec)
        }
    }
}

/// Counters exposed for observability. `granted + rejected` always equals
/// the number of `acquire` calls that have returned.
#[derive(Debug, Clone, Copy, Default, serde::Serialize, utoipa::ToSchema)]
pub struct RateLimiterMetrics {
    pub granted: u64,
    pub rejected: u64,
    pub total_wait_ms: u64,
}

impl RateLimiterMetrics {
    pub fn average_wait_ms(&self) -> f64 {
        let total = self.granted + self.rejected;
        if total == 0 {
            0.0
        } else {
            self.total_wait_ms as f64 / total as f64
        }
    }
}

/// Token-bucket admission control shared by every AI call in the process.
///
/// `acquire` never blocks indefinitely: a caller-supplied timeout turns an
/// unavailable token into `RateLimitExceeded` instead of a silent hang.
/// All sleeping happens outside the bucket lock.
pub struct RateLimiter {
    budget: Mutex<RateBudget>,
    granted: AtomicU64,
    rejected: AtomicU64,
    total_wait_ms: AtomicU64,
}

impl RateLimiter {
    /// `capacity` tokens maximum, refilled at `refill_per_minute` tokens
    /// per minute. A fresh limiter starts full.
    pub fn new(capacity: u32, refill_per_minute: f64) -> Self {
        Self {
            budget: Mutex::new(RateBudget {
                tokens: capacity as f64,
                capacity: capacity as f64,
                refill_per_sec: refill_per_minute / 60.0,
                last_refill: Instant::now(),
            }),
            granted: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
            total_wait_ms: AtomicU64::new(0),
        }
    }

    /// Take one token, waiting up to `timeout` for the bucket to refill.
    #[tracing::instrument(skip(self), level = "debug")]
    pub async fn acquire(&self, timeout: Duration) -> Result<(), PipelineError> {
        let started = Instant::now();
        let deadline = started + timeout;

        loop {
            let wait = {
                let mut budget = self.budget.lock().await;
                let now = Instant::now();
                budget.refill(now);
                if budget.tokens >= 1.0 {
                    budget.tokens -= 1.0;
                    drop(budget);
                    let waited = started.elapsed();
                    self.granted.fetch_add(1, Ordering::Relaxed);
                    self.total_wait_ms
                        .fetch_add(waited.as_millis() as u64, Ordering::Relaxed);
                    return Ok(());
                }
                budget.time_to_next_token()
            };

            // The earliest possible token is past our deadline: reject now
            // rather than sleep out the timeout for nothing.
            let now = Instant::now();
            if now + wait > deadline {
                let waited = started.elapsed();
                self.rejected.fetch_add(1, Ordering::Relaxed);
                self.total_wait_ms
                    .fetch_add(waited.as_millis() as u64, Ordering::Relaxed);
                tracing::debug!(waited_ms = waited.as_millis() as u64, "rate token unavailable");
                return Err(PipelineError::RateLimitExceeded {
                    waited_ms: waited.as_millis() as u64,
                });
            }

            // Sleep outside the lock; another task may snatch the token, in
            // which case the loop re-evaluates.
            tokio::time::sleep_until(now + wait).await;
        }
    }

    pub fn metrics(&self) -> RateLimiterMetrics {
        RateLimiterMetrics {
            granted: self.granted.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            total_wait_ms: self.total_wait_ms.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn grants_up_to_capacity_without_waiting() {
        let limiter = RateLimiter::new(3, 60.0);
        for _ in 0..3 {
            limiter
                .acquire(Duration::from_millis(10))
                .await
                .expect("token within capacity");
        }
        let metrics = limiter.metrics();
        assert_eq!(metrics.granted, 3);
        assert_eq!(metrics.rejected, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn rejects_when_refill_is_past_timeout() {
        // 1 token per minute: after draining, the next token is ~60s away.
        let limiter = RateLimiter::new(1, 1.0);
        limiter.acquire(Duration::from_millis(10)).await.unwrap();

        let started = Instant::now();
        let err = limiter
            .acquire(Duration::from_secs(1))
            .await
            .expect_err("no token within 1s");
        assert!(matches!(err, PipelineError::RateLimitExceeded { .. }));
        // Early rejection, not a full timeout sleep.
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn waits_for_refill_within_timeout() {
        // 60 per minute = one per second.
        let limiter = RateLimiter::new(1, 60.0);
        limiter.acquire(Duration::from_millis(10)).await.unwrap();

        limiter
            .acquire(Duration::from_secs(2))
            .await
            .expect("token refills after ~1s");
        let metrics = limiter.metrics();
        assert_eq!(metrics.granted, 2);
        assert!(metrics.total_wait_ms >= 900);
    }

    #[tokio::test(start_paused = true)]
    async fn accounting_adds_up_under_contention() {
        use std::sync::Arc;

        let limiter = Arc::new(RateLimiter::new(2, 1.0));
        let mut handles = Vec::new();
        for _ in 0..6 {
            let limiter = Arc::clone(&limiter);
            handles.push(tokio::spawn(async move {
                limiter.acquire(Duration::from_millis(50)).await.is_ok()
            }));
        }
        let mut granted = 0;
        for handle in handles {
            if handle.await.unwrap() {
                granted += 1;
            }
        }
        let metrics = limiter.metrics();
        assert_eq!(metrics.granted, granted);
        assert_eq!(metrics.granted + metrics.rejected, 6);
        assert_eq!(metrics.granted, 2);
    }
}
