//! Request-processing pipeline stages.
//!
//! Composition order, outermost first: request-id → logging → rate limit →
//! size limit → auth (per route) → RBAC (per route) → handler.
//!
//! The ordering is deliberate: request ids come first so every later log
//! line and error body is correlatable, and rate limiting runs before auth
//! so a flood cannot force expensive credential work — the fingerprint
//! still distinguishes identified callers through the raw `X-API-Key`
//! value. The size check sits after rate limiting so oversize floods still
//! burn their quota.

pub mod logging;
pub mod rate_limit;
pub mod rbac;
pub mod request_id;
pub mod size_limit;

pub use logging::LoggingLayer;
pub use rate_limit::RateLimitLayer;
pub use rbac::RbacLayer;
pub use request_id::RequestIdLayer;
pub use size_limit::SizeLimitLayer;
