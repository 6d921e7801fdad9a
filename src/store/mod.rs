//! Atomic rate-limit state store.
//!
//! The limiter treats the in-memory and Redis-backed stores uniformly
//! through [`RateStore`]. Both operations are atomic with respect to
//! concurrent callers on the same key: in process via a mutex, on Redis via
//! server-side scripting and transactions.

use async_trait::async_trait;

use crate::error::GatewayResult;

mod memory;
mod redis_store;

pub use memory::MemoryStore;
pub use redis_store::RedisStore;

/// TTL applied to a bucket key, in milliseconds: `2 × ceil(capacity/rate)`
/// seconds, twice the time a fully drained bucket takes to refill. Shared
/// by both store implementations so idle-key reclamation is identical
/// whichever backend serves a deployment.
pub(crate) fn bucket_ttl_ms(capacity: i64, rate_per_s: f64) -> u64 {
    if rate_per_s <= 0.0 {
        // The limiter rejects zero rates before they reach a store; if one
        // slips through, keep the entry around for an hour rather than
        // dividing by zero.
        return 3_600_000;
    }
    let secs = (capacity as f64 / rate_per_s).ceil() * 2.0;
    (secs * 1000.0) as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bucket_ttl_ceils_seconds_before_scaling() {
        // capacity 5 at 2/s drains-to-full in 2.5 s: ceil to 3 s, then
        // double, then scale to ms.
        assert_eq!(bucket_ttl_ms(5, 2.0), 6_000);
        assert_eq!(bucket_ttl_ms(100, 100.0), 2_000);
        assert_eq!(bucket_ttl_ms(10, 3.0), 8_000);
        assert_eq!(bucket_ttl_ms(10, 0.0), 3_600_000);
    }
}

/// Atomic primitives used by the rate-limit algorithms.
///
/// Implementations must behave identically whether backed by an in-process
/// lock or a remote store; transport failures return an error and leave the
/// stored state unchanged.
#[async_trait]
pub trait RateStore: Send + Sync {
    /// Refill the bucket for `key` and try to take `requested` tokens.
    ///
    /// Returns `(allowed, remaining)` where `remaining` is the whole-token
    /// floor of the bucket after the call. Tokens are left untouched on
    /// deny. `refill_rate` is in tokens per second.
    async fn token_bucket(
        &self,
        key: &str,
        capacity: i64,
        refill_rate: f64,
        requested: i64,
    ) -> GatewayResult<(bool, i64)>;

    /// Record an event now and return the number of events within the
    /// trailing window, after expiring anything older than
    /// `now - window_ms`.
    async fn sliding_window(&self, key: &str, window_ms: u64) -> GatewayResult<i64>;
}
