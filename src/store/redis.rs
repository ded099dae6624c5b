//! Redis-backed store for multi-instance deployments.
//!
//! | Operation      | Redis primitive                                    |
//! |----------------|----------------------------------------------------|
//! | revoke insert  | `SET revoked:<jti> 1 NX EX <ttl>`                  |
//! | revoke lookup  | `EXISTS revoked:<jti>`                             |
//! | fixed window   | `MULTI; INCR; EXPIRE; EXEC`                        |
//! | sliding window | Lua: `ZREMRANGEBYSCORE`, `ZADD`, `ZREMRANGEBYRANK`, `PEXPIRE`, `ZCARD` |
//!
//! Each call checks a connection out of the pool for exactly one command (or
//! one atomic script) and is bounded by the configured timeout.

use std::future::Future;
use std::sync::LazyLock;
use std::time::Duration;

use async_trait::async_trait;
use deadpool_redis::{Connection, Pool, PoolConfig, Runtime};
use redis::AsyncCommands;

use super::{CounterStore, RevocationStore, StoreError, WindowHit};

const REVOKED_PREFIX: &str = "revoked:";

/// Prune, append, refresh expiry and count in one server-side step.
///
/// KEYS[1] = window key
/// ARGV[1] = now (ms), ARGV[2] = window (ms), ARGV[3] = unique member,
/// ARGV[4] = newest events to keep
static SLIDING_WINDOW_SCRIPT: LazyLock<redis::Script> = LazyLock::new(|| {
    redis::Script::new(
        r"
local key = KEYS[1]
local now = tonumber(ARGV[1])
local window = tonumber(ARGV[2])
redis.call('ZREMRANGEBYSCORE', key, '-inf', now - window)
redis.call('ZADD', key, now, ARGV[3])
redis.call('ZREMRANGEBYRANK', key, 0, -(tonumber(ARGV[4]) + 1))
redis.call('PEXPIRE', key, window)
local count = redis.call('ZCARD', key)
local oldest = redis.call('ZRANGE', key, 0, 0, 'WITHSCORES')
return {count, tonumber(oldest[2])}
",
    )
});

/// Shared store on a deadpool-managed Redis connection pool.
#[derive(Clone)]
pub struct RedisStore {
    pool: Pool,
    timeout: Duration,
}

impl std::fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStore")
            .field("pool_status", &self.pool.status())
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl RedisStore {
    /// Create a pool for `url`. No connection is opened until first use.
    pub fn connect(url: &str, pool_size: usize, timeout: Duration) -> Result<Self, StoreError> {
        let mut redis_config = deadpool_redis::Config::from_url(url);
        let mut pool_config = PoolConfig::new(pool_size);
        pool_config.timeouts.wait = Some(timeout);
        pool_config.timeouts.create = Some(timeout);
        pool_config.timeouts.recycle = Some(timeout);
        redis_config.pool = Some(pool_config);

        let pool = redis_config
            .create_pool(Some(Runtime::Tokio1))
            .map_err(|e| StoreError::Connection(e.to_string()))?;

        Ok(Self { pool, timeout })
    }

    pub async fn ping(&self) -> Result<(), StoreError> {
        self.run(|mut conn| async move {
            redis::cmd("PING")
                .query_async::<String>(&mut conn)
                .await
                .map(|_| ())
        })
        .await
    }

    /// Check out a connection, run one command, and release it, all within
    /// the configured timeout.
    async fn run<T, F, Fut>(&self, op: F) -> Result<T, StoreError>
    where
        F: FnOnce(Connection) -> Fut,
        Fut: Future<Output = redis::RedisResult<T>>,
    {
        let attempt = async {
            let conn = self
                .pool
                .get()
                .await
                .map_err(|e| StoreError::Connection(e.to_string()))?;
            op(conn)
                .await
                .map_err(|e| StoreError::Command(e.to_string()))
        };

        tokio::time::timeout(self.timeout, attempt)
            .await
            .map_err(|_| StoreError::Timeout(self.timeout))?
    }
}

fn ttl_secs(ttl: Duration) -> u64 {
    // EX 0 is rejected by Redis
    ttl.as_secs().max(1)
}

#[async_trait]
impl RevocationStore for RedisStore {
    async fn insert(&self, jti: &str, ttl: Duration) -> Result<bool, StoreError> {
        let key = format!("{REVOKED_PREFIX}{jti}");
        let ttl = ttl_secs(ttl);

        let reply: Option<String> = self
            .run(|mut conn| async move {
                redis::cmd("SET")
                    .arg(&key)
                    .arg(1)
                    .arg("NX")
                    .arg("EX")
                    .arg(ttl)
                    .query_async(&mut conn)
                    .await
            })
            .await?;

        Ok(reply.is_some())
    }

    async fn contains(&self, jti: &str) -> Result<bool, StoreError> {
        let key = format!("{REVOKED_PREFIX}{jti}");
        self.run(|mut conn| async move { conn.exists::<_, bool>(&key).await })
            .await
    }
}

#[async_trait]
impl CounterStore for RedisStore {
    async fn increment(&self, key: &str, ttl: Duration) -> Result<u64, StoreError> {
        let key = key.to_string();
        let ttl = i64::try_from(ttl_secs(ttl)).unwrap_or(i64::MAX);

        let (count,): (u64,) = self
            .run(|mut conn| async move {
                redis::pipe()
                    .atomic()
                    .incr(&key, 1u64)
                    .expire(&key, ttl)
                    .ignore()
                    .query_async(&mut conn)
                    .await
            })
            .await?;

        Ok(count)
    }

    async fn record_event(
        &self,
        key: &str,
        now_ms: i64,
        window: Duration,
        max_events: u64,
    ) -> Result<WindowHit, StoreError> {
        let key = key.to_string();
        let max_events = max_events.max(1);
        let window_ms = i64::try_from(window.as_millis()).unwrap_or(i64::MAX);
        // Members must be unique or simultaneous events collapse into one
        let member = format!("{now_ms}-{}", uuid::Uuid::new_v4().simple());

        let (count, oldest_ms): (u64, i64) = self
            .run(|mut conn| async move {
                SLIDING_WINDOW_SCRIPT
                    .key(&key)
                    .arg(now_ms)
                    .arg(window_ms)
                    .arg(&member)
                    .arg(max_events)
                    .invoke_async(&mut conn)
                    .await
            })
            .await?;

        Ok(WindowHit { count, oldest_ms })
    }
}
