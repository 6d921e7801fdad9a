//! Per-target circuit breakers guarding downstream calls.
//!
//! # States
//!
//! - **Closed**: calls pass; consecutive failures up to the threshold open
//!   the circuit.
//! - **Open**: calls are rejected immediately; after the open timeout the
//!   next call transitions to half-open.
//! - **Half-open**: a bounded number of concurrent probes are admitted. Any
//!   failure reopens the circuit; enough successes close it.
//!
//! Admission hands out a [`CallPermit`]; the permit's drop releases the
//! in-flight slot on every exit path, including panics, so a crashed probe
//! can never wedge the half-open admission budget. Time is read through the
//! injectable [`Clock`], so the open-timeout transition is testable with a
//! virtual clock.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde::Serialize;

use crate::clock::Clock;
use crate::error::{GatewayError, GatewayResult};
use crate::sync::SharedMap;

/// Circuit breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CircuitState {
    #[serde(rename = "closed")]
    Closed,
    #[serde(rename = "open")]
    Open,
    #[serde(rename = "half-open")]
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half-open"),
        }
    }
}

/// Breaker tuning parameters.
#[derive(Debug, Clone)]
pub struct BreakerConfig {
    /// Consecutive failures in closed state before opening.
    pub failure_threshold: u32,
    /// Successes in half-open state before closing.
    pub success_threshold: u32,
    /// How long the circuit stays open before probing.
    pub open_timeout: Duration,
    /// Concurrent probes admitted while half-open.
    pub max_half_open: u32,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            success_threshold: 2,
            open_timeout: Duration::from_secs(30),
            max_half_open: 100,
        }
    }
}

impl BreakerConfig {
    pub fn new(failure_threshold: u32, success_threshold: u32, open_timeout: Duration) -> Self {
        Self {
            failure_threshold,
            success_threshold,
            open_timeout,
            ..Self::default()
        }
    }
}

#[derive(Debug)]
struct Inner {
    state: CircuitState,
    failure_count: u32,
    success_count: u32,
    /// Epoch ms of the most recent recorded failure.
    last_failure_ms: Option<u64>,
    in_flight: u32,
}

/// Point-in-time view of one breaker, reported on the admin surface.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct BreakerSnapshot {
    pub state: CircuitState,
    pub failure_count: u32,
    pub success_count: u32,
    pub in_flight: u32,
}

/// Three-state circuit breaker for a single target.
///
/// All transitions happen under one mutex, so they are serialized per
/// target; this struct is the sole mutator of its state.
pub struct CircuitBreaker {
    target: String,
    config: BreakerConfig,
    clock: Arc<dyn Clock>,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(target: impl Into<String>, config: BreakerConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            target: target.into(),
            config,
            clock,
            inner: Mutex::new(Inner {
                state: CircuitState::Closed,
                failure_count: 0,
                success_count: 0,
                last_failure_ms: None,
                in_flight: 0,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Admit a call, or reject with `CircuitOpen`.
    ///
    /// An open circuit whose timeout has elapsed transitions to half-open
    /// here, on the admitting call. The returned permit must be consumed
    /// with [`CallPermit::succeed`] or [`CallPermit::fail`]; dropping it
    /// without an outcome only releases the in-flight slot.
    pub fn try_acquire(self: &Arc<Self>) -> GatewayResult<CallPermit> {
        let mut inner = self.lock();

        if inner.state == CircuitState::Open {
            let now = self.clock.now_ms();
            let elapsed_ms = inner
                .last_failure_ms
                .map(|t| now.saturating_sub(t))
                .unwrap_or(u64::MAX);
            if elapsed_ms > self.config.open_timeout.as_millis() as u64 {
                inner.state = CircuitState::HalfOpen;
                inner.success_count = 0;
                tracing::info!(breaker = %self.target, "circuit breaker half-open, probing");
            } else {
                crate::metrics::record_breaker_rejection(&self.target);
                return Err(GatewayError::CircuitOpen(self.target.clone()));
            }
        }

        if inner.state == CircuitState::HalfOpen && inner.in_flight >= self.config.max_half_open {
            crate::metrics::record_breaker_rejection(&self.target);
            return Err(GatewayError::CircuitOpen(self.target.clone()));
        }

        inner.in_flight += 1;
        Ok(CallPermit {
            breaker: Arc::clone(self),
        })
    }

    /// Run `fut` under the breaker, recording its outcome.
    ///
    /// Returns `Err(CircuitOpen)` without polling the future when the call
    /// is rejected; otherwise the future's own result is passed through.
    pub async fn call<T, E, Fut>(self: &Arc<Self>, fut: Fut) -> GatewayResult<Result<T, E>>
    where
        Fut: std::future::Future<Output = Result<T, E>>,
    {
        let permit = self.try_acquire()?;
        let result = fut.await;
        match &result {
            Ok(_) => permit.succeed(),
            Err(_) => permit.fail(),
        }
        Ok(result)
    }

    fn on_success(&self) {
        let mut inner = self.lock();
        match inner.state {
            CircuitState::Closed => {
                inner.failure_count = 0;
                inner.success_count += 1;
            }
            CircuitState::HalfOpen => {
                inner.success_count += 1;
                if inner.success_count >= self.config.success_threshold {
                    inner.state = CircuitState::Closed;
                    inner.failure_count = 0;
                    inner.success_count = 0;
                    inner.last_failure_ms = None;
                    tracing::info!(breaker = %self.target, "circuit breaker closed after recovery");
                }
            }
            CircuitState::Open => {
                tracing::warn!(breaker = %self.target, "success recorded while open");
            }
        }
    }

    fn on_failure(&self) {
        let now = self.clock.now_ms();
        let mut inner = self.lock();
        match inner.state {
            CircuitState::Closed => {
                inner.failure_count += 1;
                inner.success_count = 0;
                inner.last_failure_ms = Some(now);
                if inner.failure_count >= self.config.failure_threshold {
                    inner.state = CircuitState::Open;
                    crate::metrics::record_breaker_open(&self.target);
                    tracing::warn!(
                        breaker = %self.target,
                        failures = inner.failure_count,
                        "circuit breaker opened"
                    );
                }
            }
            CircuitState::HalfOpen => {
                inner.state = CircuitState::Open;
                inner.success_count = 0;
                inner.last_failure_ms = Some(now);
                crate::metrics::record_breaker_open(&self.target);
                tracing::warn!(breaker = %self.target, "circuit breaker reopened by failed probe");
            }
            CircuitState::Open => {
                // Stragglers admitted before the trip keep the timer fresh.
                inner.last_failure_ms = Some(now);
            }
        }
    }

    fn release(&self) {
        let mut inner = self.lock();
        inner.in_flight = inner.in_flight.saturating_sub(1);
    }

    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        let inner = self.lock();
        BreakerSnapshot {
            state: inner.state,
            failure_count: inner.failure_count,
            success_count: inner.success_count,
            in_flight: inner.in_flight,
        }
    }

    /// Force the circuit closed with zeroed counters (admin action).
    pub fn reset(&self) {
        let mut inner = self.lock();
        inner.state = CircuitState::Closed;
        inner.failure_count = 0;
        inner.success_count = 0;
        inner.last_failure_ms = None;
        tracing::info!(breaker = %self.target, "circuit breaker reset");
    }
}

/// Admission token for one guarded call.
///
/// Dropping the permit releases the in-flight slot; this runs on unwinds
/// too, so the slot can never leak.
pub struct CallPermit {
    breaker: Arc<CircuitBreaker>,
}

impl CallPermit {
    /// Record a successful call.
    pub fn succeed(self) {
        self.breaker.on_success();
    }

    /// Record a failed call.
    pub fn fail(self) {
        self.breaker.on_failure();
    }
}

impl Drop for CallPermit {
    fn drop(&mut self) {
        self.breaker.release();
    }
}

/// Lazily populated collection of breakers, one per downstream target.
pub struct BreakerPool {
    breakers: SharedMap<String, Arc<CircuitBreaker>>,
    config: BreakerConfig,
    clock: Arc<dyn Clock>,
}

impl BreakerPool {
    pub fn new(config: BreakerConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            breakers: SharedMap::new(),
            config,
            clock,
        }
    }

    /// Breaker for `target`, created on first use.
    pub fn get(&self, target: &str) -> Arc<CircuitBreaker> {
        let config = self.config.clone();
        let clock = self.clock.clone();
        self.breakers
            .get_or_insert_with(target.to_string(), || {
                Arc::new(CircuitBreaker::new(target, config, clock))
            })
    }

    /// Reset one breaker. Returns false when the target is unknown.
    pub fn reset(&self, target: &str) -> bool {
        match self.breakers.get(&target.to_string()) {
            Some(breaker) => {
                breaker.reset();
                true
            }
            None => false,
        }
    }

    /// Reset every breaker.
    pub fn reset_all(&self) {
        for breaker in self.breakers.snapshot().into_values() {
            breaker.reset();
        }
    }

    /// Snapshot of every breaker, keyed by target.
    pub fn snapshot_all(&self) -> HashMap<String, BreakerSnapshot> {
        self.breakers
            .snapshot()
            .into_iter()
            .map(|(target, breaker)| (target, breaker.snapshot()))
            .collect()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn breaker(
        failures: u32,
        successes: u32,
        timeout_ms: u64,
    ) -> (Arc<CircuitBreaker>, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(1_000_000));
        let cb = Arc::new(CircuitBreaker::new(
            "test",
            BreakerConfig::new(failures, successes, Duration::from_millis(timeout_ms)),
            clock.clone(),
        ));
        (cb, clock)
    }

    async fn failing_call(cb: &Arc<CircuitBreaker>) -> GatewayResult<Result<(), ()>> {
        cb.call(async { Err::<(), ()>(()) }).await
    }

    async fn succeeding_call(cb: &Arc<CircuitBreaker>) -> GatewayResult<Result<(), ()>> {
        cb.call(async { Ok::<(), ()>(()) }).await
    }

    #[tokio::test]
    async fn test_starts_closed() {
        let (cb, _clock) = breaker(3, 2, 100);
        assert_eq!(cb.state(), CircuitState::Closed);
        assert!(succeeding_call(&cb).await.is_ok());
    }

    #[tokio::test]
    async fn test_opens_on_failure_threshold() {
        let (cb, _clock) = breaker(3, 2, 100);

        for _ in 0..2 {
            failing_call(&cb).await.unwrap().unwrap_err();
            assert_eq!(cb.state(), CircuitState::Closed);
        }
        failing_call(&cb).await.unwrap().unwrap_err();
        assert_eq!(cb.state(), CircuitState::Open);

        // The next call is rejected without invoking the target.
        let mut invoked = false;
        let result = cb
            .call(async {
                invoked = true;
                Ok::<(), ()>(())
            })
            .await;
        assert!(matches!(result, Err(GatewayError::CircuitOpen(_))));
        assert!(!invoked);
    }

    #[tokio::test]
    async fn test_success_resets_failure_count() {
        let (cb, _clock) = breaker(3, 2, 100);

        failing_call(&cb).await.unwrap().unwrap_err();
        failing_call(&cb).await.unwrap().unwrap_err();
        succeeding_call(&cb).await.unwrap().unwrap();

        failing_call(&cb).await.unwrap().unwrap_err();
        failing_call(&cb).await.unwrap().unwrap_err();
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_full_recovery_cycle() {
        let (cb, clock) = breaker(3, 2, 100);

        for _ in 0..3 {
            failing_call(&cb).await.unwrap().unwrap_err();
        }
        assert_eq!(cb.state(), CircuitState::Open);

        // Rejected before the timeout elapses.
        clock.advance(50);
        assert!(matches!(
            succeeding_call(&cb).await,
            Err(GatewayError::CircuitOpen(_))
        ));

        // First probe after the timeout transitions to half-open.
        clock.advance(100);
        succeeding_call(&cb).await.unwrap().unwrap();
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        succeeding_call(&cb).await.unwrap().unwrap();
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_half_open_failure_reopens() {
        let (cb, clock) = breaker(1, 2, 50);

        failing_call(&cb).await.unwrap().unwrap_err();
        assert_eq!(cb.state(), CircuitState::Open);

        clock.advance(80);
        failing_call(&cb).await.unwrap().unwrap_err();
        assert_eq!(cb.state(), CircuitState::Open);

        // The failed probe restarted the open timer at the new timestamp.
        clock.advance(30);
        assert!(matches!(
            succeeding_call(&cb).await,
            Err(GatewayError::CircuitOpen(_))
        ));
    }

    #[tokio::test]
    async fn test_half_open_admission_bound() {
        let clock = Arc::new(ManualClock::new(1_000_000));
        let cb = Arc::new(CircuitBreaker::new(
            "test",
            BreakerConfig {
                failure_threshold: 1,
                success_threshold: 10,
                open_timeout: Duration::from_millis(20),
                max_half_open: 2,
            },
            clock.clone(),
        ));

        failing_call(&cb).await.unwrap().unwrap_err();
        clock.advance(50);

        // Hold two probe permits; the third caller is rejected.
        let p1 = cb.try_acquire().unwrap();
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        let p2 = cb.try_acquire().unwrap();
        assert!(matches!(
            cb.try_acquire(),
            Err(GatewayError::CircuitOpen(_))
        ));

        // Releasing a permit frees an admission slot.
        p1.succeed();
        let p3 = cb.try_acquire().unwrap();
        drop(p3);
        drop(p2);
        assert_eq!(cb.snapshot().in_flight, 0);
    }

    #[tokio::test]
    async fn test_in_flight_released_without_outcome() {
        let (cb, _clock) = breaker(3, 2, 100);
        {
            let _permit = cb.try_acquire().unwrap();
            assert_eq!(cb.snapshot().in_flight, 1);
        }
        assert_eq!(cb.snapshot().in_flight, 0);
        // No outcome was recorded, so counters are untouched.
        assert_eq!(cb.snapshot().failure_count, 0);
    }

    #[tokio::test]
    async fn test_reset_forces_closed() {
        let (cb, _clock) = breaker(1, 2, 60_000);
        failing_call(&cb).await.unwrap().unwrap_err();
        assert_eq!(cb.state(), CircuitState::Open);

        cb.reset();
        let snap = cb.snapshot();
        assert_eq!(snap.state, CircuitState::Closed);
        assert_eq!(snap.failure_count, 0);
        assert_eq!(snap.success_count, 0);
        assert!(succeeding_call(&cb).await.is_ok());
    }

    #[tokio::test]
    async fn test_pool_creates_per_target_breakers() {
        let clock = Arc::new(ManualClock::new(1_000_000));
        let pool = BreakerPool::new(
            BreakerConfig::new(1, 1, Duration::from_secs(30)),
            clock.clone(),
        );

        let a = pool.get("origin-a");
        let b = pool.get("origin-b");
        a.call(async { Err::<(), ()>(()) }).await.unwrap().unwrap_err();

        assert_eq!(a.state(), CircuitState::Open);
        assert_eq!(b.state(), CircuitState::Closed);
        // Same target returns the same breaker.
        assert_eq!(pool.get("origin-a").state(), CircuitState::Open);

        let all = pool.snapshot_all();
        assert_eq!(all.len(), 2);
        assert_eq!(all["origin-a"].state, CircuitState::Open);

        assert!(pool.reset("origin-a"));
        assert!(!pool.reset("missing"));
        assert_eq!(pool.get("origin-a").state(), CircuitState::Closed);

        b.call(async { Err::<(), ()>(()) }).await.unwrap().unwrap_err();
        assert_eq!(b.state(), CircuitState::Open);
        pool.reset_all();
        assert!(pool
            .snapshot_all()
            .values()
            .all(|s| s.state == CircuitState::Closed));
    }
}
