//! HTTP handlers for the reserved surface: admin, health and metrics.

pub mod admin;
pub mod health;

pub use admin::{list_policies, reset_breaker, show_breakers, upsert_policy};
pub use health::{liveness, readiness, status};
