use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use super::{RateLimitDecision, RateLimitStrategy};
use crate::clock::SharedClock;
use crate::store::{CounterStore, StoreError};

/// Sliding-window log.
///
/// Each check prunes events at or before `now - window`, appends `now`, and
/// counts, in one atomic store operation. Rejected requests are logged too, so
/// a caller that keeps hammering stays limited until it backs off.
#[derive(Clone)]
pub struct SlidingWindow {
    store: Arc<dyn CounterStore>,
    clock: SharedClock,
    max: u64,
    window: Duration,
}

impl std::fmt::Debug for SlidingWindow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SlidingWindow")
            .field("max", &self.max)
            .field("window", &self.window)
            .finish()
    }
}

impl SlidingWindow {
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
            window,
        }
    }
}

#[async_trait]
impl RateLimitStrategy for SlidingWindow {
    async fn check_and_record(&self, key: &str) -> Result<RateLimitDecision, StoreError> {
        let now_ms = self.clock.now_millis();
        let window_ms = i64::try_from(self.window.as_millis()).unwrap_or(i64::MAX);

        let hit = self
            .store
            .record_event(
                &format!("rl:sliding:{key}"),
                now_ms,
                self.window,
                self.max.saturating_add(1),
            )
            .await?;

        Ok(RateLimitDecision::from_count(hit.count, self.max, || {
            // Oldest event leaves the window at oldest + window
            let wait_ms = hit.oldest_ms.saturating_add(window_ms).saturating_sub(now_ms);
            wait_ms.max(0).unsigned_abs().div_ceil(1000)
        }))
    }
}
