//! Request rate limiting over the shared counter store.
//!
//! # Strategies
//!
//! - [`FixedWindow`]: one counter per `(key, floor(now / window))`. A caller
//!   can burst up to `2 * max` across a window boundary (`max` at the end of
//!   one window, `max` at the start of the next). That is accepted behaviour
//!   of the strategy; select [`SlidingWindow`] when it matters.
//! - [`SlidingWindow`]: an ordered log of event timestamps per key. Exact, at
//!   the cost of one entry per request in the window.
//!
//! Both strategies record every checked request, admitted or not, with a
//! single atomic store operation, so two concurrent callers can never both
//! observe `max - 1` and both be admitted.

mod fixed;
mod policy;
mod sliding;

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::clock::SharedClock;
use crate::store::{CounterStore, StoreError};

pub use fixed::FixedWindow;
pub use policy::{LimitOutcome, RateLimitPolicy, RateLimiter, RuleMatcher};
pub use sliding::SlidingWindow;

/// Outcome of one rate-limit check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitDecision {
    pub limited: bool,
    /// Seconds until a request for this key may succeed. Zero when admitted.
    pub retry_after_secs: u64,
    /// Configured maximum for the window.
    pub limit: u64,
    /// Requests left in the current window after this one.
    pub remaining: u64,
}

impl RateLimitDecision {
    fn from_count(count: u64, max: u64, retry_after_secs: impl FnOnce() -> u64) -> Self {
        if count > max {
            Self {
                limited: true,
                retry_after_secs: retry_after_secs().max(1),
                limit: max,
                remaining: 0,
            }
        } else {
            Self {
                limited: false,
                retry_after_secs: 0,
                limit: max,
                remaining: max - count,
            }
        }
    }
}

/// A rate-limiting algorithm.
#[async_trait]
pub trait RateLimitStrategy: Send + Sync + fmt::Debug {
    /// Record a request for `key` and decide whether it is over the limit.
    async fn check_and_record(&self, key: &str) -> Result<RateLimitDecision, StoreError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StrategyKind {
    #[default]
    Fixed,
    Sliding,
}

impl FromStr for StrategyKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "fixed" => Ok(StrategyKind::Fixed),
            "sliding" => Ok(StrategyKind::Sliding),
            other => Err(format!(
                "unknown rate limit strategy '{other}' (expected fixed|sliding)"
            )),
        }
    }
}

impl fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StrategyKind::Fixed => f.write_str("fixed"),
            StrategyKind::Sliding => f.write_str("sliding"),
        }
    }
}

/// Limit for one rule: at most `max` requests per `window`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitRule {
    pub max: u64,
    pub window: Duration,
    pub strategy: StrategyKind,
}

impl RateLimitRule {
    pub fn new(max: u64, window: Duration, strategy: StrategyKind) -> Self {
        Self {
            max,
            window,
            strategy,
        }
    }

    /// Parse `"<max>/<window_secs>[/<strategy>]"`.
    pub fn parse(spec: &str) -> Result<Self, String> {
        let mut parts = spec.trim().split('/');
        let max = parts
            .next()
            .ok_or_else(|| format!("rate limit '{spec}' is missing max"))?
            .trim()
            .parse::<u64>()
            .map_err(|e| format!("rate limit '{spec}' has invalid max: {e}"))?;
        let window_secs = parts
            .next()
            .ok_or_else(|| format!("rate limit '{spec}' is missing window"))?
            .trim()
            .parse::<u64>()
            .map_err(|e| format!("rate limit '{spec}' has invalid window: {e}"))?;
        if window_secs == 0 {
            return Err(format!("rate limit '{spec}' has a zero window"));
        }
        let strategy = match parts.next() {
            Some(s) => s.parse()?,
            None => StrategyKind::default(),
        };
        if parts.next().is_some() {
            return Err(format!("rate limit '{spec}' has trailing fields"));
        }

        Ok(Self::new(max, Duration::from_secs(window_secs), strategy))
    }

    /// `max == 0` disables the rule.
    pub fn is_enabled(&self) -> bool {
        self.max > 0
    }

    /// Instantiate this rule's strategy over `store`.
    pub fn build(
        &self,
        store: Arc<dyn CounterStore>,
        clock: SharedClock,
    ) -> Arc<dyn RateLimitStrategy> {
        match self.strategy {
            StrategyKind::Fixed => Arc::new(FixedWindow::new(store, clock, self.max, self.window)),
            StrategyKind::Sliding => {
                Arc::new(SlidingWindow::new(store, clock, self.max, self.window))
            }
        }
    }
}

impl fmt::Display for RateLimitRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}",
            self.max,
            self.window.as_secs(),
            self.strategy
        )
    }
}
