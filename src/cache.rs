//! Bounded TTL cache for proxied HTTP responses.
//!
//! Only GET requests are looked up, and only 200/404 responses whose
//! `Cache-Control` permits it are stored. At capacity the entry with the
//! fewest hits is evicted; a background sweeper (spawned by the application
//! state) clears expired entries every 30 seconds.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::body::Bytes;
use axum::http::{HeaderMap, StatusCode};

use crate::clock::Clock;
use crate::sync::SharedMap;

/// How often the background sweeper runs.
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(30);

/// TTL applied when the response carries no usable `max-age`.
pub const DEFAULT_TTL: Duration = Duration::from_secs(300);

/// One cached response.
#[derive(Debug)]
pub struct CacheEntry {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
    /// Expiry deadline in epoch milliseconds. Always after `created_at`.
    pub expires_at: u64,
    pub created_at: u64,
    hit_count: AtomicU64,
}

impl CacheEntry {
    pub fn new(
        status: StatusCode,
        headers: HeaderMap,
        body: Bytes,
        created_at: u64,
        ttl: Duration,
    ) -> Self {
        Self {
            status,
            headers,
            body,
            expires_at: created_at + ttl.as_millis().max(1) as u64,
            created_at,
            hit_count: AtomicU64::new(0),
        }
    }

    pub fn is_expired(&self, now_ms: u64) -> bool {
        now_ms >= self.expires_at
    }

    pub fn hit_count(&self) -> u64 {
        self.hit_count.load(Ordering::Relaxed)
    }
}

/// Bounded keyed store of HTTP responses.
pub struct ResponseCache {
    entries: SharedMap<String, Arc<CacheEntry>>,
    max_entries: usize,
    max_entry_bytes: usize,
    clock: Arc<dyn Clock>,
}

impl ResponseCache {
    pub fn new(max_entries: usize, max_entry_bytes: usize, clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: SharedMap::new(),
            max_entries,
            max_entry_bytes,
            clock,
        }
    }

    /// Look up a fresh entry, bumping its hit counter.
    ///
    /// Expired entries are deleted lazily here rather than waiting for the
    /// sweeper. Hit-counter increments may be observed out of order by
    /// concurrent readers; the counter is monotonic.
    pub fn get(&self, key: &str) -> Option<Arc<CacheEntry>> {
        let entry = self.entries.get(&key.to_string())?;
        if entry.is_expired(self.clock.now_ms()) {
            self.entries.remove(&key.to_string());
            return None;
        }
        entry.hit_count.fetch_add(1, Ordering::Relaxed);
        Some(entry)
    }

    /// Store an entry, evicting the least-hit entry when at capacity.
    ///
    /// Returns false when the body exceeds the per-entry size limit.
    pub fn set(&self, key: String, entry: CacheEntry) -> bool {
        if entry.body.len() > self.max_entry_bytes {
            tracing::debug!(
                key = %key,
                size = entry.body.len(),
                max = self.max_entry_bytes,
                "response too large to cache"
            );
            return false;
        }

        let replacing = self.entries.get(&key).is_some();
        if !replacing && self.entries.len() >= self.max_entries {
            self.evict_least_hit();
        }
        self.entries.insert(key, Arc::new(entry));
        true
    }

    /// Drop the entry with the fewest hits (ties broken arbitrarily).
    fn evict_least_hit(&self) {
        let victim = self
            .entries
            .snapshot()
            .into_iter()
            .min_by_key(|(_, e)| e.hit_count())
            .map(|(k, _)| k);
        if let Some(key) = victim {
            tracing::debug!(key = %key, "evicting least-hit cache entry");
            self.entries.remove(&key);
        }
    }

    /// Remove every expired entry. Called by the background sweeper.
    pub fn remove_expired(&self) {
        let now = self.clock.now_ms();
        self.entries.retain(|_, e| !e.is_expired(now));
    }

    /// Current number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Cache key: hex MD5 over `method:path:raw_query`.
///
/// The key identifies an idempotent request/response pair; it is unrelated
/// to the rate-limit fingerprint, which identifies a quota holder.
pub fn cache_key(method: &str, path: &str, raw_query: &str) -> String {
    let digest = md5::compute(format!("{method}:{path}:{raw_query}"));
    format!("{digest:x}")
}

/// Whether a response may be stored at all.
///
/// Only 200 and 404 qualify, and `Cache-Control: no-cache` / `no-store`
/// opt out. 5xx responses are never cached.
pub fn is_cacheable(status: StatusCode, headers: &HeaderMap) -> bool {
    if status != StatusCode::OK && status != StatusCode::NOT_FOUND {
        return false;
    }
    match cache_control(headers) {
        Some(cc) => !cc.contains("no-cache") && !cc.contains("no-store"),
        None => true,
    }
}

/// TTL for a cacheable response: `max-age` when present, else the default.
pub fn response_ttl(headers: &HeaderMap) -> Duration {
    let Some(cc) = cache_control(headers) else {
        return DEFAULT_TTL;
    };
    for directive in cc.split(',') {
        if let Some(value) = directive.trim().strip_prefix("max-age=") {
            if let Ok(secs) = value.trim().parse::<u64>() {
                if secs > 0 {
                    return Duration::from_secs(secs);
                }
            }
        }
    }
    DEFAULT_TTL
}

fn cache_control(headers: &HeaderMap) -> Option<String> {
    headers
        .get("cache-control")
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_ascii_lowercase())
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn cache_with_clock(max_entries: usize) -> (ResponseCache, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(1_000_000));
        let cache = ResponseCache::new(max_entries, 1024, clock.clone());
        (cache, clock)
    }

    fn entry_at(now: u64, body: &str, ttl: Duration) -> CacheEntry {
        CacheEntry::new(
            StatusCode::OK,
            HeaderMap::new(),
            Bytes::copy_from_slice(body.as_bytes()),
            now,
            ttl,
        )
    }

    #[test]
    fn test_round_trip() {
        let (cache, clock) = cache_with_clock(10);
        let entry = entry_at(clock.now_ms(), "hello", Duration::from_secs(60));
        assert!(cache.set("k".into(), entry));

        let got = cache.get("k").unwrap();
        assert_eq!(got.status, StatusCode::OK);
        assert_eq!(got.body.as_ref(), b"hello");
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_expired_entry_is_dropped_on_get() {
        let (cache, clock) = cache_with_clock(10);
        cache.set(
            "k".into(),
            entry_at(clock.now_ms(), "x", Duration::from_secs(1)),
        );

        clock.advance(1_500);
        assert!(cache.get("k").is_none());
        assert_eq!(cache.len(), 0);
    }

    #[test]
    fn test_oversize_body_rejected() {
        let (cache, clock) = cache_with_clock(10);
        let big = "x".repeat(2048);
        let entry = entry_at(clock.now_ms(), &big, Duration::from_secs(60));
        assert!(!cache.set("k".into(), entry));
        assert_eq!(cache.len(), 0);
    }

    #[test]
    fn test_eviction_keeps_capacity() {
        let (cache, clock) = cache_with_clock(3);
        for i in 0..4 {
            cache.set(
                format!("k{i}"),
                entry_at(clock.now_ms(), "b", Duration::from_secs(60)),
            );
        }
        assert_eq!(cache.len(), 3);
    }

    #[test]
    fn test_eviction_prefers_least_hit() {
        let (cache, clock) = cache_with_clock(2);
        cache.set(
            "hot".into(),
            entry_at(clock.now_ms(), "a", Duration::from_secs(60)),
        );
        cache.set(
            "cold".into(),
            entry_at(clock.now_ms(), "b", Duration::from_secs(60)),
        );
        cache.get("hot");
        cache.get("hot");

        cache.set(
            "new".into(),
            entry_at(clock.now_ms(), "c", Duration::from_secs(60)),
        );

        assert_eq!(cache.len(), 2);
        assert!(cache.get("hot").is_some());
        assert!(cache.get("cold").is_none());
    }

    #[test]
    fn test_replacing_existing_key_does_not_evict() {
        let (cache, clock) = cache_with_clock(2);
        cache.set(
            "a".into(),
            entry_at(clock.now_ms(), "1", Duration::from_secs(60)),
        );
        cache.set(
            "b".into(),
            entry_at(clock.now_ms(), "2", Duration::from_secs(60)),
        );
        cache.set(
            "a".into(),
            entry_at(clock.now_ms(), "3", Duration::from_secs(60)),
        );
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.get("a").unwrap().body.as_ref(), b"3");
    }

    #[test]
    fn test_sweeper_removes_expired() {
        let (cache, clock) = cache_with_clock(10);
        cache.set(
            "short".into(),
            entry_at(clock.now_ms(), "s", Duration::from_secs(1)),
        );
        cache.set(
            "long".into(),
            entry_at(clock.now_ms(), "l", Duration::from_secs(600)),
        );

        clock.advance(5_000);
        cache.remove_expired();
        assert_eq!(cache.len(), 1);
        assert!(cache.get("long").is_some());
    }

    #[test]
    fn test_cache_key_is_stable_and_distinct() {
        let a = cache_key("GET", "/api/users", "");
        let b = cache_key("GET", "/api/users", "");
        let c = cache_key("GET", "/api/users", "page=2");
        let d = cache_key("POST", "/api/users", "");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_ne!(a, d);
        assert_eq!(a.len(), 32); // hex md5
    }

    #[test]
    fn test_cacheability_rules() {
        let plain = HeaderMap::new();
        assert!(is_cacheable(StatusCode::OK, &plain));
        assert!(is_cacheable(StatusCode::NOT_FOUND, &plain));
        assert!(!is_cacheable(StatusCode::INTERNAL_SERVER_ERROR, &plain));
        assert!(!is_cacheable(StatusCode::CREATED, &plain));

        let mut no_store = HeaderMap::new();
        no_store.insert("cache-control", "no-store".parse().unwrap());
        assert!(!is_cacheable(StatusCode::OK, &no_store));

        let mut no_cache = HeaderMap::new();
        no_cache.insert("cache-control", "private, no-cache".parse().unwrap());
        assert!(!is_cacheable(StatusCode::OK, &no_cache));
    }

    #[test]
    fn test_ttl_extraction() {
        let mut headers = HeaderMap::new();
        headers.insert("cache-control", "public, max-age=120".parse().unwrap());
        assert_eq!(response_ttl(&headers), Duration::from_secs(120));

        let empty = HeaderMap::new();
        assert_eq!(response_ttl(&empty), DEFAULT_TTL);

        let mut zero = HeaderMap::new();
        zero.insert("cache-control", "max-age=0".parse().unwrap());
        assert_eq!(response_ttl(&zero), DEFAULT_TTL);
    }
}
