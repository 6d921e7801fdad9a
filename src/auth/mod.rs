//! Caller authentication: static API keys and bearer tokens.
//!
//! Three schemes cooperate:
//!
//! - **API keys** (`X-API-Key`): validated against an in-memory table with
//!   per-key path ACLs. Absent header passes through so bearer auth can
//!   take over.
//! - **HMAC JWT** (`Authorization: Bearer`): pre-shared secret, HMAC
//!   algorithms only.
//! - **JWKS JWT**: RS256 with public keys fetched from a JWKS endpoint and
//!   cached.
//!
//! All successful validations inject identity headers
//! (`X-User-ID`, `X-User-Role`) for downstream consumption.

pub mod api_key;
pub mod jwks;
pub mod jwt;

pub use api_key::{ApiKeyAuthLayer, ApiKeyRecord, ApiKeyStore};
pub use jwks::{JwksAuthLayer, JwksCache};
pub use jwt::JwtAuthLayer;

/// Match a request path against an ACL pattern.
///
/// Two forms are supported: an exact path, and a suffix wildcard `/a/*`
/// which matches `/a/` followed by at least one character (but not `/a`
/// itself). No other wildcard syntax exists.
pub fn path_pattern_matches(pattern: &str, path: &str) -> bool {
    if pattern == path {
        return true;
    }
    if let Some(prefix) = pattern.strip_suffix("/*") {
        return path.len() > prefix.len() + 1 && path.starts_with(prefix) &&
            path.as_bytes()[prefix.len()] == b'/';
    }
    false
}
