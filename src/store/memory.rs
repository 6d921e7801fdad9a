//! In-process rate-limit store.
//!
//! A single mutex serializes every operation, which makes each call atomic
//! per key (and in fact across keys). Entries carry the same TTL the Redis
//! store would apply; expired entries are treated as absent and dropped on
//! access so idle keys are reclaimed.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;

use crate::clock::Clock;
use crate::error::GatewayResult;

use super::{bucket_ttl_ms, RateStore};

#[derive(Debug)]
struct Bucket {
    /// Fractional tokens currently available. `0 <= tokens <= capacity`.
    tokens: f64,
    /// Last refill time in epoch milliseconds.
    last_refill: u64,
    /// Entry TTL deadline in epoch milliseconds.
    expires_at: u64,
}

#[derive(Debug)]
struct Window {
    /// Event timestamps in ascending order.
    events: VecDeque<u64>,
    expires_at: u64,
}

#[derive(Debug, Default)]
struct State {
    buckets: HashMap<String, Bucket>,
    windows: HashMap<String, Window>,
}

/// Mutex-protected in-memory [`RateStore`].
pub struct MemoryStore {
    state: Mutex<State>,
    clock: Arc<dyn Clock>,
}

impl MemoryStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            state: Mutex::new(State::default()),
            clock,
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Number of live bucket entries (test hook).
    #[cfg(test)]
    fn bucket_count(&self) -> usize {
        self.lock().buckets.len()
    }
}

#[async_trait]
impl RateStore for MemoryStore {
    async fn token_bucket(
        &self,
        key: &str,
        capacity: i64,
        refill_rate: f64,
        requested: i64,
    ) -> GatewayResult<(bool, i64)> {
        let now = self.clock.now_ms();
        let mut state = self.lock();

        // Absent or past its TTL: lazily (re)create a full bucket.
        let stale = !state
            .buckets
            .get(key)
            .is_some_and(|b| b.expires_at > now);
        if stale {
            state.buckets.insert(
                key.to_string(),
                Bucket {
                    tokens: capacity as f64,
                    last_refill: now,
                    expires_at: 0,
                },
            );
        }
        let entry = state
            .buckets
            .get_mut(key)
            .expect("entry ensured present above");

        // Clamp a clock that went backwards to zero refill.
        let delta_s = now.saturating_sub(entry.last_refill) as f64 / 1000.0;
        let mut tokens = (entry.tokens + delta_s * refill_rate).min(capacity as f64);

        let allowed = tokens >= requested as f64;
        if allowed {
            tokens -= requested as f64;
        }

        entry.tokens = tokens;
        entry.last_refill = now;
        entry.expires_at = now + bucket_ttl_ms(capacity, refill_rate);

        Ok((allowed, tokens.floor() as i64))
    }

    async fn sliding_window(&self, key: &str, window_ms: u64) -> GatewayResult<i64> {
        let now = self.clock.now_ms();
        let mut state = self.lock();

        let stale = !state
            .windows
            .get(key)
            .is_some_and(|w| w.expires_at > now);
        if stale {
            state.windows.insert(
                key.to_string(),
                Window {
                    events: VecDeque::new(),
                    expires_at: 0,
                },
            );
        }
        let window = state
            .windows
            .get_mut(key)
            .expect("entry ensured present above");

        window.events.push_back(now);
        let cutoff = now.saturating_sub(window_ms);
        while window.events.front().is_some_and(|&ts| ts <= cutoff) {
            window.events.pop_front();
        }
        window.expires_at = now + 2 * window_ms;

        Ok(window.events.len() as i64)
    }
}
