//! Gateway configuration loaded from environment variables.
//!
//! All settings have development defaults; production deployments configure
//! via environment variables or a `.env` file.
//!
//! # Key Variables
//!
//! - `LISTEN_ADDR`: bind address (default `:8080`)
//! - `DOWNSTREAM_URL`: origin to proxy to (default `http://localhost:8081`)
//! - `REDIS_ADDR`: shared rate-limit store; empty means in-memory
//! - `JWT_SECRET`: enables HMAC JWT auth on admin routes when set
//! - `JWKS_URL`: enables RS256 JWT auth via a remote key set when set

use std::env;
use std::time::Duration;

use crate::error::{GatewayError, GatewayResult};

/// Runtime configuration for one gateway instance.
#[derive(Debug, Clone)]
pub struct Config {
    // =========================================================================
    // Server
    // =========================================================================
    /// Bind address. A bare `:port` is accepted and bound on all interfaces.
    pub listen_addr: String,

    /// Origin URL requests are proxied to.
    pub downstream_url: String,

    /// Redis address for the shared store (empty = in-memory store).
    pub redis_addr: Option<String>,

    /// Bound on the in-flight drain during shutdown.
    pub graceful_shutdown_timeout: Duration,

    // =========================================================================
    // Authentication
    // =========================================================================
    /// HMAC secret for JWT validation (None = HMAC JWT disabled).
    pub jwt_secret: Option<String>,

    /// Expected `iss` claim (None = issuer not checked).
    pub jwt_issuer: Option<String>,

    /// Expected `aud` claim for JWKS-validated tokens.
    pub jwt_audience: Option<String>,

    /// JWKS endpoint for RS256 validation (None = JWKS auth disabled).
    pub jwks_url: Option<String>,

    /// How long fetched JWKS keys stay fresh.
    pub jwks_ttl: Duration,

    /// Whether role-based access control guards the admin surface.
    pub rbac_enabled: bool,

    // =========================================================================
    // Resilience
    // =========================================================================
    /// Consecutive failures before a breaker opens.
    pub cb_failure_threshold: u32,

    /// Consecutive half-open successes before a breaker closes.
    pub cb_success_threshold: u32,

    /// How long a breaker stays open before probing.
    pub cb_open_timeout: Duration,

    /// Maximum number of cached responses.
    pub cache_max_entries: usize,

    /// Maximum size of a single cached body in bytes.
    pub cache_max_entry_bytes: usize,

    // =========================================================================
    // Limits
    // =========================================================================
    /// Maximum accepted request body size in bytes.
    pub max_request_body_size: usize,

    // =========================================================================
    // Ambient
    // =========================================================================
    /// Comma-separated CORS origins; `*` allows any.
    pub cors_allowed_origins: Vec<String>,
}

impl Config {
    /// Load configuration from the environment with defaults.
    ///
    /// # Errors
    ///
    /// Returns `GatewayError::Config` when a variable is present but
    /// unparseable, or when validation fails.
    pub fn from_env() -> GatewayResult<Self> {
        // Load a .env file if present (missing file is fine)
        let _ = dotenvy::dotenv();

        let config = Self {
            listen_addr: env::var("LISTEN_ADDR").unwrap_or_else(|_| ":8080".to_string()),
            downstream_url: env::var("DOWNSTREAM_URL")
                .unwrap_or_else(|_| "http://localhost:8081".to_string()),
            redis_addr: env::var("REDIS_ADDR").ok().filter(|s| !s.is_empty()),
            graceful_shutdown_timeout: Duration::from_secs(Self::parse_env(
                "GRACEFUL_SHUTDOWN_TIMEOUT",
                15,
            )?),

            jwt_secret: env::var("JWT_SECRET").ok().filter(|s| !s.is_empty()),
            jwt_issuer: env::var("JWT_ISS").ok().filter(|s| !s.is_empty()),
            jwt_audience: env::var("JWT_AUD").ok().filter(|s| !s.is_empty()),
            jwks_url: env::var("JWKS_URL").ok().filter(|s| !s.is_empty()),
            jwks_ttl: Duration::from_secs(Self::parse_env("JWKS_TTL_SECS", 300)?),
            rbac_enabled: Self::parse_env("RBAC_ENABLED", false)?,

            cb_failure_threshold: Self::parse_env("CB_FAILURE_THRESHOLD", 3)?,
            cb_success_threshold: Self::parse_env("CB_SUCCESS_THRESHOLD", 2)?,
            cb_open_timeout: Duration::from_millis(Self::parse_env("CB_OPEN_TIMEOUT_MS", 30_000)?),
            cache_max_entries: Self::parse_env("CACHE_MAX_ENTRIES", 1000)?,
            cache_max_entry_bytes: Self::parse_env("CACHE_MAX_ENTRY_BYTES", 1024 * 1024)?,

            max_request_body_size: Self::parse_env("MAX_REQUEST_BODY_SIZE", 10 * 1024 * 1024)?,

            cors_allowed_origins: Self::parse_cors_origins(),
        };

        config.validate()?;
        Ok(config)
    }

    /// Validate cross-field consistency.
    fn validate(&self) -> GatewayResult<()> {
        if self.cb_failure_threshold == 0 {
            return Err(GatewayError::Config(
                "CB_FAILURE_THRESHOLD must be greater than 0".to_string(),
            ));
        }
        if self.cb_success_threshold == 0 {
            return Err(GatewayError::Config(
                "CB_SUCCESS_THRESHOLD must be greater than 0".to_string(),
            ));
        }
        if self.cache_max_entries == 0 {
            return Err(GatewayError::Config(
                "CACHE_MAX_ENTRIES must be greater than 0".to_string(),
            ));
        }
        if self.max_request_body_size == 0 {
            return Err(GatewayError::Config(
                "MAX_REQUEST_BODY_SIZE must be greater than 0".to_string(),
            ));
        }
        if !self.downstream_url.starts_with("http://") && !self.downstream_url.starts_with("https://")
        {
            return Err(GatewayError::Config(format!(
                "DOWNSTREAM_URL must be an http(s) URL, got {}",
                self.downstream_url
            )));
        }
        Ok(())
    }

    /// Bind address in `host:port` form. A leading-colon address binds on
    /// all interfaces.
    pub fn server_addr(&self) -> String {
        if self.listen_addr.starts_with(':') {
            format!("0.0.0.0{}", self.listen_addr)
        } else {
            self.listen_addr.clone()
        }
    }

    /// Whether any bearer-token validation scheme is configured.
    pub fn auth_enabled(&self) -> bool {
        self.jwt_secret.is_some() || self.jwks_url.is_some()
    }

    /// Parse an environment variable into the target type with a default.
    fn parse_env<T>(name: &str, default: T) -> GatewayResult<T>
    where
        T: std::str::FromStr,
        T::Err: std::fmt::Display,
    {
        match env::var(name) {
            Ok(val) => val
                .parse()
                .map_err(|e| GatewayError::Config(format!("invalid {name}: {e}"))),
            Err(_) => Ok(default),
        }
    }

    fn parse_cors_origins() -> Vec<String> {
        env::var("CORS_ALLOWED_ORIGINS")
            .unwrap_or_else(|_| "*".to_string())
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect()
    }
}

/// Development defaults, used directly by tests.
impl Default for Config {
    fn default() -> Self {
        Self {
            listen_addr: ":8080".to_string(),
            downstream_url: "http://localhost:8081".to_string(),
            redis_addr: None,
            graceful_shutdown_timeout: Duration::from_secs(15),
            jwt_secret: None,
            jwt_issuer: None,
            jwt_audience: None,
            jwks_url: None,
            jwks_ttl: Duration::from_secs(300),
            rbac_enabled: false,
            cb_failure_threshold: 3,
            cb_success_threshold: 2,
            cb_open_timeout: Duration::from_secs(30),
            cache_max_entries: 1000,
            cache_max_entry_bytes: 1024 * 1024,
            max_request_body_size: 10 * 1024 * 1024,
            cors_allowed_origins: vec!["*".to_string()],
        }
    }
}
