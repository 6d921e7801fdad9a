//! Policy evaluation on top of the rate-limit store.
//!
//! The limiter is stateless: it translates a [`Policy`] into the matching
//! store operation and shapes the result. Correctness under concurrency
//! comes entirely from the store's per-key atomicity.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::{GatewayError, GatewayResult};
use crate::store::RateStore;

/// Rate-limit algorithm selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Algorithm {
    #[serde(rename = "tokenbucket")]
    TokenBucket,
    #[serde(rename = "slidingwindow")]
    SlidingWindow,
}

/// Rate-limit policy for one fingerprint.
///
/// A policy is valid iff the fields its algorithm requires are positive;
/// the other fields are ignored.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Policy {
    pub algorithm: Algorithm,
    /// Bucket size (token bucket only).
    #[serde(default)]
    pub capacity: i64,
    /// Refill rate in tokens per second (token bucket only).
    #[serde(default)]
    pub rate: f64,
    /// Window length in milliseconds (sliding window only).
    #[serde(default)]
    pub window_ms: u64,
    /// Maximum events per window (sliding window only).
    #[serde(default)]
    pub limit: i64,
}

impl Policy {
    /// Token-bucket policy with the given capacity and per-second rate.
    pub fn token_bucket(capacity: i64, rate: f64) -> Self {
        Self {
            algorithm: Algorithm::TokenBucket,
            capacity,
            rate,
            window_ms: 0,
            limit: 0,
        }
    }

    /// Sliding-window policy with the given window and event limit.
    pub fn sliding_window(window_ms: u64, limit: i64) -> Self {
        Self {
            algorithm: Algorithm::SlidingWindow,
            capacity: 0,
            rate: 0.0,
            window_ms,
            limit,
        }
    }

    /// The value advertised in `X-RateLimit-Limit`.
    pub fn advertised_limit(&self) -> i64 {
        match self.algorithm {
            Algorithm::TokenBucket => self.capacity,
            Algorithm::SlidingWindow => self.limit,
        }
    }
}

/// Outcome of a limiter evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Decision {
    pub allowed: bool,
    /// Remaining quota after this call (whole units, never negative).
    pub remaining: i64,
}

/// Stateless policy evaluator.
pub struct Limiter {
    store: Arc<dyn RateStore>,
}

impl Limiter {
    pub fn new(store: Arc<dyn RateStore>) -> Self {
        Self { store }
    }

    /// Evaluate whether the event identified by `fingerprint` is allowed
    /// under `policy`.
    ///
    /// Malformed policies fail closed: the caller must reject the request.
    pub async fn allow(&self, fingerprint: &str, policy: &Policy) -> GatewayResult<Decision> {
        match policy.algorithm {
            Algorithm::TokenBucket => {
                if policy.capacity <= 0 || policy.rate <= 0.0 {
                    return Err(GatewayError::Config(format!(
                        "token bucket policy requires positive capacity and rate, \
                         got capacity={} rate={}",
                        policy.capacity, policy.rate
                    )));
                }
                let key = format!("tb:{fingerprint}");
                let (allowed, remaining) = self
                    .store
                    .token_bucket(&key, policy.capacity, policy.rate, 1)
                    .await?;
                Ok(Decision { allowed, remaining })
            }
            Algorithm::SlidingWindow => {
                if policy.window_ms == 0 || policy.limit <= 0 {
                    return Err(GatewayError::Config(format!(
                        "sliding window policy requires positive window and limit, \
                         got window_ms={} limit={}",
                        policy.window_ms, policy.limit
                    )));
                }
                let key = format!("sw:{fingerprint}");
                let count = self.store.sliding_window(&key, policy.window_ms).await?;
                Ok(Decision {
                    allowed: count <= policy.limit,
                    remaining: (policy.limit - count).max(0),
                })
            }
        }
    }
}
