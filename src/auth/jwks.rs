//! RS256 bearer-token validation against a remote JWKS document.
//!
//! Public keys are fetched by `kid` from a JWKS endpoint and cached with a
//! TTL. A miss or an expired cache refreshes the whole set in one atomic
//! map swap, so concurrent callers see either the old keys or the new ones,
//! never a torn map. Refresh failures propagate to the caller as a 401 for
//! the current request; the cache is left as it was.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, Response, StatusCode};
use jsonwebtoken::{decode, decode_header, Algorithm, DecodingKey, Validation};
use serde::Deserialize;
use tower::{Layer, Service};
use tracing::{debug, warn};

use crate::clock::Clock;
use crate::error::{error_response, GatewayError, GatewayResult};
use crate::middleware::request_id::request_id_of;
use crate::sync::SharedMap;

use super::jwt::{bearer_token, inject_identity, Claims};

/// JSON Web Key Set wire format (RSA signature keys only).
#[derive(Debug, Deserialize)]
pub struct Jwks {
    pub keys: Vec<Jwk>,
}

#[derive(Debug, Deserialize)]
pub struct Jwk {
    pub kty: String,
    #[serde(rename = "use", default)]
    pub use_: Option<String>,
    #[serde(default)]
    pub kid: Option<String>,
    #[serde(default)]
    pub n: Option<String>,
    #[serde(default)]
    pub e: Option<String>,
}

/// Cached view of a JWKS endpoint.
pub struct JwksCache {
    endpoint: String,
    ttl: Duration,
    http: reqwest::Client,
    keys: SharedMap<String, DecodingKey>,
    /// Epoch ms of the last successful refresh; 0 = never fetched.
    last_fetch_ms: AtomicU64,
    clock: Arc<dyn Clock>,
}

impl JwksCache {
    pub fn new(
        endpoint: impl Into<String>,
        ttl: Duration,
        http: reqwest::Client,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            endpoint: endpoint.into(),
            ttl,
            http,
            keys: SharedMap::new(),
            last_fetch_ms: AtomicU64::new(0),
            clock,
        }
    }

    fn is_fresh(&self) -> bool {
        let last = self.last_fetch_ms.load(Ordering::Acquire);
        last != 0 && self.clock.now_ms().saturating_sub(last) < self.ttl.as_millis() as u64
    }

    /// Public key for `kid`, refreshing the set on miss or expiry.
    pub async fn key_for(&self, kid: &str) -> GatewayResult<DecodingKey> {
        if self.is_fresh() {
            if let Some(key) = self.keys.get(&kid.to_string()) {
                return Ok(key);
            }
        }

        self.refresh().await?;

        self.keys
            .get(&kid.to_string())
            .ok_or_else(|| GatewayError::Unauthorized(format!("key {kid} not found in JWKS")))
    }

    /// Fetch the endpoint and swap in the whole key set.
    async fn refresh(&self) -> GatewayResult<()> {
        let response = self
            .http
            .get(&self.endpoint)
            .send()
            .await
            .map_err(|e| GatewayError::Unauthorized(format!("JWKS fetch failed: {e}")))?;

        if !response.status().is_success() {
            return Err(GatewayError::Unauthorized(format!(
                "JWKS endpoint returned {}",
                response.status()
            )));
        }

        let document: Jwks = response
            .json()
            .await
            .map_err(|e| GatewayError::Unauthorized(format!("JWKS parse failed: {e}")))?;

        let entries = build_key_map(&document);
        debug!(keys = entries.len(), endpoint = %self.endpoint, "JWKS refreshed");
        self.keys.replace_all(entries);
        self.last_fetch_ms
            .store(self.clock.now_ms(), Ordering::Release);
        Ok(())
    }
}

/// Build the kid → key map, skipping anything that is not a usable RSA
/// signature key.
fn build_key_map(document: &Jwks) -> std::collections::HashMap<String, DecodingKey> {
    let mut entries = std::collections::HashMap::new();
    for jwk in &document.keys {
        if jwk.kty != "RSA" || jwk.use_.as_deref() != Some("sig") {
            continue;
        }
        let (Some(kid), Some(n), Some(e)) = (&jwk.kid, &jwk.n, &jwk.e) else {
            continue;
        };
        match DecodingKey::from_rsa_components(n, e) {
            Ok(key) => {
                entries.insert(kid.clone(), key);
            }
            Err(err) => {
                warn!(kid = %kid, error = %err, "skipping malformed JWK");
            }
        }
    }
    entries
}

/// Validate an RS256 token against the cached key set.
pub async fn validate_rs256(
    token: &str,
    cache: &JwksCache,
    expected_issuer: Option<&str>,
    expected_audience: Option<&str>,
) -> Result<Claims, String> {
    let header = decode_header(token).map_err(|e| format!("invalid token: {e}"))?;
    if header.alg != Algorithm::RS256 {
        return Err(format!("unsupported signing method: {:?}", header.alg));
    }
    let kid = header.kid.ok_or("missing kid in token header")?;

    let key = cache.key_for(&kid).await.map_err(|e| e.to_string())?;

    let mut validation = Validation::new(Algorithm::RS256);
    validation.set_required_spec_claims(&["exp"]);
    if let Some(iss) = expected_issuer {
        validation.set_issuer(&[iss]);
    }
    match expected_audience {
        Some(aud) => validation.set_audience(&[aud]),
        None => validation.validate_aud = false,
    }

    let data =
        decode::<Claims>(token, &key, &validation).map_err(|e| format!("invalid token: {e}"))?;
    Ok(data.claims)
}

/// Tower layer enforcing JWKS-backed RS256 auth on the routes it wraps.
#[derive(Clone)]
pub struct JwksAuthLayer {
    cache: Arc<JwksCache>,
    issuer: Option<Arc<String>>,
    audience: Option<Arc<String>>,
}

impl JwksAuthLayer {
    pub fn new(cache: Arc<JwksCache>, issuer: Option<String>, audience: Option<String>) -> Self {
        Self {
            cache,
            issuer: issuer.map(Arc::new),
            audience: audience.map(Arc::new),
        }
    }
}

impl<S> Layer<S> for JwksAuthLayer {
    type Service = JwksAuthService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        JwksAuthService {
            inner,
            cache: self.cache.clone(),
            issuer: self.issuer.clone(),
            audience: self.audience.clone(),
        }
    }
}

#[derive(Clone)]
pub struct JwksAuthService<S> {
    inner: S,
    cache: Arc<JwksCache>,
    issuer: Option<Arc<String>>,
    audience: Option<Arc<String>>,
}

impl<S> Service<Request<Body>> for JwksAuthService<S>
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
        let cache = self.cache.clone();
        let issuer = self.issuer.clone();
        let audience = self.audience.clone();
        let mut inner = self.inner.clone();

        Box::pin(async move {
            let token = match bearer_token(req.headers()) {
                Ok(token) => token.to_string(),
                Err(reason) => {
                    return Ok(error_response(
                        StatusCode::UNAUTHORIZED,
                        "unauthorized",
                        reason,
                        request_id_of(req.headers()),
                    ));
                }
            };

            let result = validate_rs256(
                &token,
                &cache,
                issuer.as_ref().map(|s| s.as_str()),
                audience.as_ref().map(|s| s.as_str()),
            )
            .await;

            match result {
                Ok(claims) => {
                    inject_identity(&mut req, &claims);
                    inner.call(req).await
                }
                Err(reason) => {
                    warn!(path = %req.uri().path(), reason = %reason, "JWKS token rejected");
                    Ok(error_response(
                        StatusCode::UNAUTHORIZED,
                        "unauthorized",
                        &reason,
                        request_id_of(req.headers()),
                    ))
                }
            }
        })
    }
}
