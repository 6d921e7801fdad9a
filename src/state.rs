//! Shared application state for handlers and middleware.
//!
//! Cloned per request; every component inside is behind an `Arc` or uses
//! interior mutability. The cache sweeper is the one background task; it is
//! tracked with `TaskTracker` and stopped through a `CancellationToken` so
//! shutdown can drain it within the configured bound.

use std::sync::Arc;
use std::time::Instant;

use metrics_exporter_prometheus::PrometheusHandle;
use tokio::time::interval;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::auth::{ApiKeyStore, JwksCache};
use crate::breaker::{BreakerConfig, BreakerPool};
use crate::cache::{ResponseCache, SWEEP_INTERVAL};
use crate::clock::Clock;
use crate::config::Config;
use crate::limiter::Limiter;
use crate::policy::PolicyTable;
use crate::store::RateStore;

/// Everything a request handler can reach.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub limiter: Arc<Limiter>,
    pub policies: Arc<PolicyTable>,
    pub api_keys: Arc<ApiKeyStore>,
    pub cache: Arc<ResponseCache>,
    pub breakers: Arc<BreakerPool>,
    pub jwks: Option<Arc<JwksCache>>,
    pub http_client: reqwest::Client,
    pub clock: Arc<dyn Clock>,
    pub metrics_handle: Option<PrometheusHandle>,
    started_at: Instant,
    task_tracker: TaskTracker,
    cancellation_token: CancellationToken,
}

impl AppState {
    /// Assemble the state and spawn the cache sweeper.
    pub fn new(
        config: Config,
        store: Arc<dyn RateStore>,
        clock: Arc<dyn Clock>,
        metrics_handle: Option<PrometheusHandle>,
    ) -> Self {
        let http_client = reqwest::Client::new();
        let jwks = config.jwks_url.as_ref().map(|url| {
            Arc::new(JwksCache::new(
                url.clone(),
                config.jwks_ttl,
                http_client.clone(),
                clock.clone(),
            ))
        });
        let breaker_config = BreakerConfig {
            failure_threshold: config.cb_failure_threshold,
            success_threshold: config.cb_success_threshold,
            open_timeout: config.cb_open_timeout,
            ..BreakerConfig::default()
        };

        let state = Self {
            limiter: Arc::new(Limiter::new(store)),
            policies: Arc::new(PolicyTable::with_defaults()),
            api_keys: Arc::new(ApiKeyStore::with_defaults()),
            cache: Arc::new(ResponseCache::new(
                config.cache_max_entries,
                config.cache_max_entry_bytes,
                clock.clone(),
            )),
            breakers: Arc::new(BreakerPool::new(breaker_config, clock.clone())),
            jwks,
            http_client,
            clock,
            metrics_handle,
            config: Arc::new(config),
            started_at: Instant::now(),
            task_tracker: TaskTracker::new(),
            cancellation_token: CancellationToken::new(),
        };

        state.spawn_cache_sweeper();
        state
    }

    /// Periodically clear expired cache entries.
    fn spawn_cache_sweeper(&self) {
        let cache = self.cache.clone();
        let cancel = self.cancellation_token.clone();

        self.task_tracker.spawn(async move {
            let mut ticker = interval(SWEEP_INTERVAL);
            ticker.tick().await; // skip the immediate first tick

            loop {
                tokio::select! {
                    biased;

                    _ = cancel.cancelled() => {
                        debug!("cache sweeper received cancellation signal");
                        break;
                    }
                    _ = ticker.tick() => {
                        cache.remove_expired();
                        debug!(entries = cache.len(), "cache sweep complete");
                    }
                }
            }
        });
    }

    /// Stop background tasks, bounded by the configured shutdown timeout.
    pub async fn shutdown(&self) {
        info!("stopping background tasks");
        self.cancellation_token.cancel();
        self.task_tracker.close();

        if tokio::time::timeout(self.config.graceful_shutdown_timeout, self.task_tracker.wait())
            .await
            .is_err()
        {
            warn!("background tasks did not stop within the shutdown timeout");
        }
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }
}
