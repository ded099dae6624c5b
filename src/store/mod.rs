//! Shared state backing token revocation and rate limiting.
//!
//! Two operations in the security core need coordination across concurrent
//! requests and, in multi-instance deployments, across processes:
//!
//! - revocation lookup/insert ([`RevocationStore`])
//! - rate-limit counter read-modify-write ([`CounterStore`])
//!
//! Both are expressed as single atomic primitives ("insert-if-absent with
//! TTL", "increment-and-return", "prune-append-count") so callers never do a
//! read-then-write against the store.
//!
//! ## Backends
//!
//! | Backend  | Scope            | Atomicity                          |
//! |----------|------------------|------------------------------------|
//! | `memory` | single process   | DashMap entry locks                |
//! | `redis`  | multi-instance   | `SET NX EX`, `MULTI`, Lua script   |

pub mod memory;
pub mod redis;

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::clock::SharedClock;
use crate::config::Config;
use crate::error::AppError;

pub use memory::MemoryStore;
pub use redis::RedisStore;

/// Failure talking to the backing store.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("store connection failed: {0}")]
    Connection(String),

    #[error("store command failed: {0}")]
    Command(String),

    #[error("store operation timed out after {0:?}")]
    Timeout(Duration),
}

impl From<StoreError> for AppError {
    fn from(err: StoreError) -> Self {
        AppError::StoreUnavailable(err.to_string())
    }
}

/// Set of revoked token ids, each kept only until the token's own expiry.
#[async_trait]
pub trait RevocationStore: Send + Sync {
    /// Insert `jti` if absent, expiring after `ttl`.
    ///
    /// Returns `true` when this call created the record and `false` when the
    /// id was already present. Refresh rotation relies on this to guarantee a
    /// refresh token is spent at most once.
    async fn insert(&self, jti: &str, ttl: Duration) -> Result<bool, StoreError>;

    async fn contains(&self, jti: &str) -> Result<bool, StoreError>;
}

/// Result of recording one event in a sliding window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowHit {
    /// Events in the window, including the one just recorded.
    pub count: u64,
    /// Timestamp (ms) of the oldest event still in the window.
    pub oldest_ms: i64,
}

/// Counters for the rate limiter.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Atomically increment `key`, creating it with `ttl` if missing, and
    /// return the new value.
    async fn increment(&self, key: &str, ttl: Duration) -> Result<u64, StoreError>;

    /// Atomically prune events at or before `now_ms - window`, append
    /// `now_ms`, drop all but the newest `max_events`, and return the
    /// resulting count.
    ///
    /// A limiter allowing `max` events only needs the newest `max + 1` to
    /// decide, so the log for a flooding key stays bounded.
    async fn record_event(
        &self,
        key: &str,
        now_ms: i64,
        window: Duration,
        max_events: u64,
    ) -> Result<WindowHit, StoreError>;
}

/// Which backend holds revocation and counter state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StoreBackend {
    #[default]
    Memory,
    Redis,
}

impl FromStr for StoreBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "memory" => Ok(StoreBackend::Memory),
            "redis" => Ok(StoreBackend::Redis),
            other => Err(format!("unknown store backend '{other}' (expected memory|redis)")),
        }
    }
}

impl fmt::Display for StoreBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreBackend::Memory => f.write_str("memory"),
            StoreBackend::Redis => f.write_str("redis"),
        }
    }
}

/// What the pipeline does when the store cannot be reached.
///
/// - `FailClosed`: reject the request with 503. Nothing that depends on
///   revocation or rate-limit state is admitted while the store is down.
/// - `FailOpen`: admit the request and log at `error!` on every occurrence.
///   Revoked tokens are accepted and limits are not enforced for the
///   duration of the outage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StoreFailurePolicy {
    #[default]
    FailClosed,
    FailOpen,
}

impl FromStr for StoreFailurePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "fail_closed" | "closed" => Ok(StoreFailurePolicy::FailClosed),
            "fail_open" | "open" => Ok(StoreFailurePolicy::FailOpen),
            other => Err(format!(
                "unknown store failure policy '{other}' (expected fail_closed|fail_open)"
            )),
        }
    }
}

impl fmt::Display for StoreFailurePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreFailurePolicy::FailClosed => f.write_str("fail_closed"),
            StoreFailurePolicy::FailOpen => f.write_str("fail_open"),
        }
    }
}

/// Handle to the configured backend, cheap to clone.
#[derive(Clone)]
pub enum StoreHandle {
    /// Single-instance: in-process maps
    Memory(Arc<MemoryStore>),

    /// Multi-instance: shared Redis
    Redis(RedisStore),
}

impl StoreHandle {
    pub fn memory(clock: SharedClock) -> Self {
        StoreHandle::Memory(Arc::new(MemoryStore::new(clock)))
    }

    /// Build the backend selected in `config`.
    ///
    /// Unlike a cache, this store carries security state, so a Redis backend
    /// that cannot be reached at startup is an error rather than a silent
    /// fallback to per-process memory.
    pub async fn from_config(config: &Config, clock: SharedClock) -> Result<Self, StoreError> {
        match config.store_backend {
            StoreBackend::Memory => {
                tracing::info!("Using in-memory revocation and rate-limit store");
                Ok(Self::memory(clock))
            }
            StoreBackend::Redis => {
                tracing::info!(url = %config.redis_url, "Connecting to Redis store");
                let store = RedisStore::connect(
                    &config.redis_url,
                    config.redis_pool_size,
                    config.redis_timeout,
                )?;
                store.ping().await?;
                tracing::info!("Connected to Redis store");
                Ok(StoreHandle::Redis(store))
            }
        }
    }

    pub fn backend(&self) -> StoreBackend {
        match self {
            StoreHandle::Memory(_) => StoreBackend::Memory,
            StoreHandle::Redis(_) => StoreBackend::Redis,
        }
    }

    /// Round-trip to the backend, for readiness checks.
    pub async fn ping(&self) -> Result<(), StoreError> {
        match self {
            StoreHandle::Memory(_) => Ok(()),
            StoreHandle::Redis(store) => store.ping().await,
        }
    }

    /// Drop expired entries. Redis expires keys itself, so this is a no-op
    /// there.
    pub fn sweep(&self) -> usize {
        match self {
            StoreHandle::Memory(store) => store.sweep(),
            StoreHandle::Redis(_) => 0,
        }
    }
}

#[async_trait]
impl RevocationStore for StoreHandle {
    async fn insert(&self, jti: &str, ttl: Duration) -> Result<bool, StoreError> {
        match self {
            StoreHandle::Memory(store) => store.insert(jti, ttl).await,
            StoreHandle::Redis(store) => store.insert(jti, ttl).await,
        }
    }

    async fn contains(&self, jti: &str) -> Result<bool, StoreError> {
        match self {
            StoreHandle::Memory(store) => store.contains(jti).await,
            StoreHandle::Redis(store) => store.contains(jti).await,
        }
    }
}

#[async_trait]
impl CounterStore for StoreHandle {
    async fn increment(&self, key: &str, ttl: Duration) -> Result<u64, StoreError> {
        match self {
            StoreHandle::Memory(store) => store.increment(key, ttl).await,
            StoreHandle::Redis(store) => store.increment(key, ttl).await,
        }
    }

    async fn record_event(
        &self,
        key: &str,
        now_ms: i64,
        window: Duration,
        max_events: u64,
    ) -> Result<WindowHit, StoreError> {
        match self {
            StoreHandle::Memory(store) => store.record_event(key, now_ms, window, max_events).await,
            StoreHandle::Redis(store) => store.record_event(key, now_ms, window, max_events).await,
        }
    }
}

/// A store whose every call fails, for exercising [`StoreFailurePolicy`].
#[cfg(test)]
#[derive(Debug, Default)]
pub(crate) struct UnreachableStore;

#[cfg(test)]
impl UnreachableStore {
    fn error() -> StoreError {
        StoreError::Connection("connection refused".to_string())
    }
}

#[cfg(test)]
#[async_trait]
impl RevocationStore for UnreachableStore {
    async fn insert(&self, _jti: &str, _ttl: Duration) -> Result<bool, StoreError> {
        Err(Self::error())
    }

    async fn contains(&self, _jti: &str) -> Result<bool, StoreError> {
        Err(Self::error())
    }
}

#[cfg(test)]
#[async_trait]
impl CounterStore for UnreachableStore {
    async fn increment(&self, _key: &str, _ttl: Duration) -> Result<u64, StoreError> {
        Err(Self::error())
    }

    async fn record_event(
        &self,
        _key: &str,
        _now_ms: i64,
        _window: Duration,
        _max_events: u64,
    ) -> Result<WindowHit, StoreError> {
        Err(Self::error())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_store_backend() {
        assert_eq!("memory".parse::<StoreBackend>().unwrap(), StoreBackend::Memory);
        assert_eq!("REDIS".parse::<StoreBackend>().unwrap(), StoreBackend::Redis);
        assert!("postgres".parse::<StoreBackend>().is_err());
    }

    #[test]
    fn test_parse_failure_policy() {
        assert_eq!(
            "fail_closed".parse::<StoreFailurePolicy>().unwrap(),
            StoreFailurePolicy::FailClosed
        );
        assert_eq!(
            "fail_open".parse::<StoreFailurePolicy>().unwrap(),
            StoreFailurePolicy::FailOpen
        );
        assert!("maybe".parse::<StoreFailurePolicy>().is_err());
        assert_eq!(StoreFailurePolicy::default(), StoreFailurePolicy::FailClosed);
    }

    #[test]
    fn test_store_error_maps_to_unavailable() {
        let err: AppError = StoreError::Connection("refused".into()).into();
        assert!(matches!(err, AppError::StoreUnavailable(_)));
    }
}
