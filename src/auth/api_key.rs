//! Static API-key table and its authentication middleware.
//!
//! The middleware reads `X-API-Key`. A request without the header passes
//! through untouched (another scheme may authenticate it); a request with
//! one is validated against the table and either rejected with 401 or
//! annotated with identity headers.

use std::sync::Arc;
use std::task::{Context, Poll};

use axum::body::Body;
use axum::http::{HeaderValue, Request, Response, StatusCode};
use tower::{Layer, Service};
use tracing::{debug, warn};

use crate::error::error_response;
use crate::middleware::request_id::request_id_of;
use crate::sync::SharedMap;

use super::path_pattern_matches;

/// Header carrying the API key.
pub const API_KEY_HEADER: &str = "x-api-key";

/// One provisioned API key.
#[derive(Debug, Clone, PartialEq)]
pub struct ApiKeyRecord {
    /// The key itself; unique index of the table.
    pub key: String,
    /// Human-readable name, injected as `X-API-Key-Name`.
    pub name: String,
    /// Role granted to callers holding this key.
    pub role: String,
    pub enabled: bool,
    /// Allowed path patterns; empty means every path.
    pub allowed_paths: Vec<String>,
    /// Advisory requests-per-second budget for this key (0 = unlimited).
    /// Enforcement lives in the policy table, keyed by fingerprint.
    pub rate_limit: i64,
}

/// Why a presented key was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiKeyRejection {
    Unknown,
    Disabled,
    PathDenied,
}

impl ApiKeyRejection {
    pub fn kind(&self) -> &'static str {
        match self {
            ApiKeyRejection::Unknown => "invalid_api_key",
            ApiKeyRejection::Disabled => "api_key_disabled",
            ApiKeyRejection::PathDenied => "api_key_path_denied",
        }
    }

    pub fn message(&self) -> &'static str {
        match self {
            ApiKeyRejection::Unknown => "API key is invalid",
            ApiKeyRejection::Disabled => "API key is disabled",
            ApiKeyRejection::PathDenied => "API key not allowed for this path",
        }
    }
}

/// Thread-safe key → record table.
#[derive(Default)]
pub struct ApiKeyStore {
    keys: SharedMap<String, ApiKeyRecord>,
}

impl ApiKeyStore {
    pub fn new() -> Self {
        Self {
            keys: SharedMap::new(),
        }
    }

    /// Table seeded with the stock development keys.
    pub fn with_defaults() -> Self {
        let store = Self::new();
        store.add(ApiKeyRecord {
            key: "key_admin_prod_123".into(),
            name: "Admin Production Key".into(),
            role: "admin".into(),
            enabled: true,
            allowed_paths: vec!["/admin/*".into(), "/api/*".into(), "/metrics".into()],
            rate_limit: 10_000,
        });
        store.add(ApiKeyRecord {
            key: "key_user_prod_456".into(),
            name: "User Production Key".into(),
            role: "user".into(),
            enabled: true,
            allowed_paths: vec!["/api/*".into()],
            rate_limit: 1_000,
        });
        store.add(ApiKeyRecord {
            key: "key_viewer_prod_789".into(),
            name: "Viewer Key".into(),
            role: "viewer".into(),
            enabled: true,
            allowed_paths: vec!["/metrics".into(), "/health".into()],
            rate_limit: 100,
        });
        store
    }

    pub fn add(&self, record: ApiKeyRecord) {
        self.keys.insert(record.key.clone(), record);
    }

    pub fn remove(&self, key: &str) {
        self.keys.remove(&key.to_string());
    }

    pub fn get(&self, key: &str) -> Option<ApiKeyRecord> {
        self.keys.get(&key.to_string())
    }

    /// Validate a presented key for a request path.
    pub fn validate(&self, key: &str, path: &str) -> Result<ApiKeyRecord, ApiKeyRejection> {
        let record = self.get(key).ok_or(ApiKeyRejection::Unknown)?;
        if !record.enabled {
            return Err(ApiKeyRejection::Disabled);
        }
        if !record.allowed_paths.is_empty()
            && !record
                .allowed_paths
                .iter()
                .any(|p| path_pattern_matches(p, path))
        {
            return Err(ApiKeyRejection::PathDenied);
        }
        Ok(record)
    }
}

/// Tower layer validating `X-API-Key` when present.
#[derive(Clone)]
pub struct ApiKeyAuthLayer {
    store: Arc<ApiKeyStore>,
}

impl ApiKeyAuthLayer {
    pub fn new(store: Arc<ApiKeyStore>) -> Self {
        Self { store }
    }
}

impl<S> Layer<S> for ApiKeyAuthLayer {
    type Service = ApiKeyAuthService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        ApiKeyAuthService {
            inner,
            store: self.store.clone(),
        }
    }
}

#[derive(Clone)]
pub struct ApiKeyAuthService<S> {
    inner: S,
    store: Arc<ApiKeyStore>,
}

impl<S> Service<Request<Body>> for ApiKeyAuthService<S>
where
    S: Service<Request<Body>, Response = Response<Body>> + Clone + Send + 'static,
    S::Future: Send,
{
    type Response = Response<Body>;
    type Error = S::Error;
    type Future = std::pin::Pin<
        Box<dyn std::future::Future<Output = Result<Self::Response, Self::Error>> + Send>,
    >;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, mut req: Request<Body>) -> Self::Future {
        let store = self.store.clone();
        let mut inner = self.inner.clone();

        Box::pin(async move {
            let presented = req
                .headers()
                .get(API_KEY_HEADER)
                .and_then(|v| v.to_str().ok())
                .map(|s| s.to_string());

            // No key presented: pass through for other schemes.
            let Some(key) = presented else {
                return inner.call(req).await;
            };

            let path = req.uri().path().to_string();
            match store.validate(&key, &path) {
                Ok(record) => {
                    debug!(key_name = %record.name, "API key accepted");
                    inject(&mut req, "x-user-role", &record.role);
                    inject(&mut req, "x-api-key-name", &record.name);
                    inject(&mut req, "x-auth-method", "api-key");
                    inner.call(req).await
                }
                Err(rejection) => {
                    warn!(path = %path, reason = rejection.kind(), "API key rejected");
                    Ok(error_response(
                        StatusCode::UNAUTHORIZED,
                        rejection.kind(),
                        rejection.message(),
                        request_id_of(req.headers()),
                    ))
                }
            }
        })
    }
}

fn inject(req: &mut Request<Body>, name: &'static str, value: &str) {
    if let Ok(value) = HeaderValue::from_str(value) {
        req.headers_mut().insert(name, value);
    }
}
