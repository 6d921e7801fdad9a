//! # Edge Gateway
//!
//! An HTTP reverse proxy for the edge of a service mesh: rate-limit
//! enforcement, caller authentication and resilience controls in front of
//! a downstream origin.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      Axum HTTP Server                       │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Pipeline (Request ID → Log → Rate limit → Size → Auth)     │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Handlers (proxy, admin, health, metrics)                   │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Resilience (response cache, circuit-breaker pool)          │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Rate-limit store (in-memory, or shared Redis)              │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! The rate-limit engine supports token-bucket and sliding-window
//! policies, selected per fingerprint (API key or client IP, plus path).
//! With `REDIS_ADDR` set, bucket refills and window counts execute as
//! server-side atomic operations so multiple gateway instances share one
//! quota; otherwise a mutex-guarded in-memory store provides the same
//! semantics per instance.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use edge_gateway::{build_router, AppState, Config, MemoryStore};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::from_env()?;
//!     let clock = edge_gateway::clock::system_clock();
//!     let store = Arc::new(MemoryStore::new(clock.clone()));
//!     let state = AppState::new(config, store, clock, None);
//!     let app = build_router(state);
//!     // Serve the router...
//!     Ok(())
//! }
//! ```

pub mod auth;
pub mod breaker;
pub mod cache;
pub mod clock;
pub mod config;
pub mod error;
pub mod handlers;
pub mod limiter;
pub mod metrics;
pub mod middleware;
pub mod policy;
pub mod proxy;
pub mod routes;
pub mod state;
pub mod store;
pub mod sync;
pub mod utils;

// Re-exports for convenience
pub use breaker::{BreakerConfig, BreakerPool, CircuitBreaker, CircuitState};
pub use cache::ResponseCache;
pub use config::Config;
pub use error::{GatewayError, GatewayResult};
pub use limiter::{Algorithm, Limiter, Policy};
pub use policy::PolicyTable;
pub use routes::build_router;
pub use state::AppState;
pub use store::{MemoryStore, RateStore, RedisStore};
