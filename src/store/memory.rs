//! In-process store for single-instance deployments.
//!
//! Every operation runs under the DashMap shard lock for its key, which is
//! what makes insert-if-absent and increment atomic with respect to other
//! requests in the same process. Expiry is evaluated lazily on access and
//! eagerly by [`MemoryStore::sweep`], driven from a background task.

use std::collections::VecDeque;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;

use super::{CounterStore, RevocationStore, StoreError, WindowHit};
use crate::clock::SharedClock;

#[derive(Debug, Clone, Copy)]
struct Counter {
    value: u64,
    expires_at_ms: i64,
}

#[derive(Debug, Default)]
struct EventLog {
    events: VecDeque<i64>,
    expires_at_ms: i64,
}

/// DashMap-backed revocation set and rate-limit counters.
#[derive(Debug)]
pub struct MemoryStore {
    clock: SharedClock,
    revoked: DashMap<String, i64>,
    counters: DashMap<String, Counter>,
    windows: DashMap<String, EventLog>,
}

fn ttl_millis(ttl: Duration) -> i64 {
    i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX)
}

impl MemoryStore {
    pub fn new(clock: SharedClock) -> Self {
        Self {
            clock,
            revoked: DashMap::new(),
            counters: DashMap::new(),
            windows: DashMap::new(),
        }
    }

    /// Number of live revocation records.
    pub fn revocation_count(&self) -> usize {
        let now = self.clock.now_millis();
        self.revoked.iter().filter(|r| *r.value() > now).count()
    }

    /// Remove every expired entry and return how many were dropped.
    pub fn sweep(&self) -> usize {
        let now = self.clock.now_millis();
        let before = self.revoked.len() + self.counters.len() + self.windows.len();

        self.revoked.retain(|_, expires_at| *expires_at > now);
        self.counters.retain(|_, c| c.expires_at_ms > now);
        self.windows.retain(|_, log| log.expires_at_ms > now);

        let after = self.revoked.len() + self.counters.len() + self.windows.len();
        before.saturating_sub(after)
    }

    /// Total entries across all maps, expired or not.
    pub fn len(&self) -> usize {
        self.revoked.len() + self.counters.len() + self.windows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl RevocationStore for MemoryStore {
    async fn insert(&self, jti: &str, ttl: Duration) -> Result<bool, StoreError> {
        let now = self.clock.now_millis();
        let expires_at = now.saturating_add(ttl_millis(ttl));

        match self.revoked.entry(jti.to_string()) {
            Entry::Occupied(mut existing) => {
                if *existing.get() > now {
                    return Ok(false);
                }
                // Expired record for a reused id behaves as absent
                existing.insert(expires_at);
                Ok(true)
            }
            Entry::Vacant(slot) => {
                slot.insert(expires_at);
                Ok(true)
            }
        }
    }

    async fn contains(&self, jti: &str) -> Result<bool, StoreError> {
        let now = self.clock.now_millis();
        let live = self.revoked.get(jti).map(|expires_at| *expires_at > now);

        match live {
            Some(true) => Ok(true),
            Some(false) => {
                self.revoked.remove_if(jti, |_, expires_at| *expires_at <= now);
                Ok(false)
            }
            None => Ok(false),
        }
    }
}

#[async_trait]
impl CounterStore for MemoryStore {
    async fn increment(&self, key: &str, ttl: Duration) -> Result<u64, StoreError> {
        let now = self.clock.now_millis();
        let expires_at = now.saturating_add(ttl_millis(ttl));

        let mut counter = self.counters.entry(key.to_string()).or_insert(Counter {
            value: 0,
            expires_at_ms: expires_at,
        });
        if counter.expires_at_ms <= now {
            counter.value = 0;
            counter.expires_at_ms = expires_at;
        }
        counter.value = counter.value.saturating_add(1);
        Ok(counter.value)
    }

    async fn record_event(
        &self,
        key: &str,
        now_ms: i64,
        window: Duration,
        max_events: u64,
    ) -> Result<WindowHit, StoreError> {
        let window_ms = ttl_millis(window);
        let max_events = usize::try_from(max_events).unwrap_or(usize::MAX).max(1);
        let cutoff = now_ms.saturating_sub(window_ms);

        let mut log = self.windows.entry(key.to_string()).or_default();
        while log.events.front().is_some_and(|&ts| ts <= cutoff) {
            log.events.pop_front();
        }
        log.events.push_back(now_ms);
        while log.events.len() > max_events {
            log.events.pop_front();
        }
        log.expires_at_ms = now_ms.saturating_add(window_ms);

        Ok(WindowHit {
            count: log.events.len() as u64,
            oldest_ms: log.events.front().copied().unwrap_or(now_ms),
        })
    }
}
