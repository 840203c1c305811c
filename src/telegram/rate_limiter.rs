//! Per-account pacing between invite calls.
//!
//! Telegram tolerates a slow, irregular invite rhythm; a fixed cadence is
//! itself a detection signal. The limiter therefore enforces a minimum
//! interval plus a fresh random jitter on every acquisition.

use std::time::{Duration, Instant};

use rand::Rng;
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Rate limiter that enforces a jittered minimum interval between operations.
#[derive(Debug)]
pub struct RateLimiter {
    /// Minimum duration between allowed operations.
    min_interval: Duration,

    /// Upper bound of the random extra delay added per operation.
    jitter: Duration,

    /// Last time an operation was performed.
    last_operation: Mutex<Option<Instant>>,
}

impl RateLimiter {
    /// Creates a new rate limiter with the given base interval and jitter.
    #[must_use]
    pub fn new(min_interval: Duration, jitter: Duration) -> Self {
        Self {
            min_interval,
            jitter,
            last_operation: Mutex::new(None),
        }
    }

    /// Creates a rate limiter from whole seconds.
    #[must_use]
    pub fn from_secs(interval_secs: u64, jitter_secs: u64) -> Self {
        Self::new(
            Duration::from_secs(interval_secs),
            Duration::from_secs(jitter_secs),
        )
    }

    /// Waits until an operation is allowed, then marks it performed.
    ///
    /// Returns the duration waited (zero when no wait was needed). The first
    /// acquisition never waits.
    pub async fn wait_and_acquire(&self) -> Duration {
        let mut last = self.last_operation.lock().await;

        let wait_duration = if let Some(last_time) = *last {
            let required = self.min_interval + self.sample_jitter();
            let elapsed = last_time.elapsed();
            if elapsed < required {
                required - elapsed
            } else {
                Duration::ZERO
            }
        } else {
            Duration::ZERO
        };

        if !wait_duration.is_zero() {
            debug!(
                "Rate limiter: waiting {:?} before next operation",
                wait_duration
            );
            tokio::time::sleep(wait_duration).await;
        }

        *last = Some(Instant::now());
        wait_duration
    }

    /// Honors a provider flood wait, then restarts the pacing window.
    pub async fn handle_flood_wait(&self, wait_seconds: u32) {
        warn!(
            "Received flood wait from Telegram: {} seconds",
            wait_seconds
        );
        tokio::time::sleep(Duration::from_secs(u64::from(wait_seconds))).await;

        let mut last = self.last_operation.lock().await;
        *last = Some(Instant::now());
    }

    fn sample_jitter(&self) -> Duration {
        if self.jitter.is_zero() {
            return Duration::ZERO;
        }
        let max_ms = u64::try_from(self.jitter.as_millis()).unwrap_or(u64::MAX);
        Duration::from_millis(rand::rng().random_range(0..=max_ms))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_first_operation_is_free() {
        let limiter = RateLimiter::from_secs(60, 30);
        let waited = limiter.wait_and_acquire().await;
        assert_eq!(waited, Duration::ZERO);
    }

    #[tokio::test]
    async fn test_subsequent_operation_waits() {
        let limiter = RateLimiter::new(Duration::from_millis(50), Duration::ZERO);

        limiter.wait_and_acquire().await;
        let waited = limiter.wait_and_acquire().await;
        assert!(waited > Duration::ZERO);
    }

    #[test]
    fn test_jitter_stays_within_bounds() {
        let limiter = RateLimiter::new(Duration::from_secs(60), Duration::from_secs(30));
        for _ in 0..200 {
            assert!(limiter.sample_jitter() <= Duration::from_secs(30));
        }

        let no_jitter = RateLimiter::new(Duration::from_secs(60), Duration::ZERO);
        assert_eq!(no_jitter.sample_jitter(), Duration::ZERO);
    }
}
