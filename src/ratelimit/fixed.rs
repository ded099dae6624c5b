use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use super::{RateLimitDecision, RateLimitStrategy};
use crate::clock::SharedClock;
use crate::store::{CounterStore, StoreError};

/// Fixed-window counter: `bucket = floor(now / window)`.
#[derive(Clone)]
pub struct FixedWindow {
    store: Arc<dyn CounterStore>,
    clock: SharedClock,
    max: u64,
    window_secs: i64,
}

impl std::fmt::Debug for FixedWindow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FixedWindow")
            .field("max", &self.max)
            .field("window_secs", &self.window_secs)
            .finish()
    }
}

impl FixedWindow {
    pub fn new(
        store: Arc<dyn CounterStore>,
        clock: SharedClock,
        max: u64,
        window: Duration,
    ) -> Self {
        Self {
            store,
            clock,
            max,
            window_secs: i64::try_from(window.as_secs()).unwrap_or(i64::MAX).max(1),
        }
    }
}

#[async_trait]
impl RateLimitStrategy for FixedWindow {
    async fn check_and_record(&self, key: &str) -> Result<RateLimitDecision, StoreError> {
        let now = self.clock.now_secs();
        let bucket = now.div_euclid(self.window_secs);
        let bucket_end = (bucket + 1).saturating_mul(self.window_secs);

        let count = self
            .store
            .increment(
                &format!("rl:fixed:{key}:{bucket}"),
                Duration::from_secs(self.window_secs.unsigned_abs()),
            )
            .await?;

        Ok(RateLimitDecision::from_count(count, self.max, || {
            (bucket_end - now).unsigned_abs()
        }))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::store::MemoryStore;

    fn limiter(max: u64, window_secs: u64) -> (Arc<ManualClock>, FixedWindow) {
        // Aligned to a window boundary
        let clock = Arc::new(ManualClock::at_secs(1_700_000_040));
        let store = Arc::new(MemoryStore::new(clock.clone()));
        let limiter = FixedWindow::new(store, clock.clone(), max, Duration::from_secs(window_secs));
        (clock, limiter)
    }

    #[tokio::test]
    async fn test_fixed_window_limits_after_max() {
        let (clock, limiter) = limiter(3, 60);

        for expected_remaining in [2, 1, 0] {
            let d = limiter.check_and_record("client").await.unwrap();
            assert!(!d.limited);
            assert_eq!(d.remaining, expected_remaining);
        }

        clock.advance_secs(15);
        let d = limiter.check_and_record("client").await.unwrap();
        assert!(d.limited);
        assert_eq!(d.retry_after_secs, 45);
        assert!(d.retry_after_secs <= 60);

        clock.advance_secs(45);
        let d = limiter.check_and_record("client").await.unwrap();
        assert!(!d.limited);
    }

    #[tokio::test]
    async fn test_keys_are_independent() {
        let (_, limiter) = limiter(1, 60);

        assert!(!limiter.check_and_record("a").await.unwrap().limited);
        assert!(!limiter.check_and_record("b").await.unwrap().limited);
        assert!(limiter.check_and_record("a").await.unwrap().limited);
    }

    #[tokio::test]
    async fn test_boundary_burst_is_allowed() {
        let (clock, limiter) = limiter(2, 60);

        clock.advance_secs(59);
        assert!(!limiter.check_and_record("k").await.unwrap().limited);
        assert!(!limiter.check_and_record("k").await.unwrap().limited);

        clock.advance_secs(1);
        assert!(!limiter.check_and_record("k").await.unwrap().limited);
        assert!(!limiter.check_and_record("k").await.unwrap().limited);
        assert!(limiter.check_and_record("k").await.unwrap().limited);
    }

    #[tokio::test]
    async fn test_concurrent_callers_admit_exactly_max() {
        let (_, limiter) = limiter(10, 60);
        let limiter = Arc::new(limiter);

        let mut handles = Vec::new();
        for _ in 0..50 {
            let limiter = limiter.clone();
            handles.push(tokio::spawn(async move {
                limiter.check_and_record("shared").await.unwrap().limited
            }));
        }

        let mut admitted = 0;
        for handle in handles {
            if !handle.await.unwrap() {
                admitted += 1;
            }
        }
        assert_eq!(admitted, 10);
    }
}
