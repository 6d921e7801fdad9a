//! Bearer-token authentication with a pre-shared HMAC secret.
//!
//! The middleware rejects any token whose `alg` is outside the HMAC family,
//! requires `exp` to be present and in the future, and checks `iss` against
//! the configured issuer when one is set. The JWT library does the
//! cryptographic work; this module owns the claim-validation contract and
//! the identity-header injection.

use std::sync::Arc;
use std::task::{Context, Poll};

use axum::body::Body;
use axum::http::{HeaderMap, HeaderValue, Request, Response, StatusCode};
use jsonwebtoken::{decode, decode_header, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use tower::{Layer, Service};
use tracing::warn;

use crate::error::error_response;
use crate::middleware::request_id::request_id_of;

/// Claims the gateway cares about. Everything else in the token is ignored.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// Caller identity, injected as `X-User-ID`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sub: Option<String>,
    /// Application role, injected as `X-User-Role`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iss: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aud: Option<Vec<String>>,
    /// Expiry, seconds since the epoch. Required.
    pub exp: u64,
}

/// Pull the token out of `Authorization: Bearer <token>`.
///
/// The scheme comparison is case-insensitive. Errors are the exact client
/// messages for the 401 body.
pub fn bearer_token(headers: &HeaderMap) -> Result<&str, &'static str> {
    let Some(value) = headers.get("authorization") else {
        return Err("missing Authorization header");
    };
    let Ok(value) = value.to_str() else {
        return Err("invalid Authorization header format");
    };
    let mut parts = value.split_whitespace();
    match (parts.next(), parts.next(), parts.next()) {
        (Some(scheme), Some(token), None) if scheme.eq_ignore_ascii_case("bearer") => Ok(token),
        _ => Err("invalid Authorization header format"),
    }
}

/// Validate an HMAC-signed token and return its claims.
pub fn validate_hmac(
    token: &str,
    secret: &[u8],
    expected_issuer: Option<&str>,
) -> Result<Claims, String> {
    let header = decode_header(token).map_err(|e| format!("invalid token: {e}"))?;
    if !matches!(
        header.alg,
        Algorithm::HS256 | Algorithm::HS384 | Algorithm::HS512
    ) {
        return Err(format!("unexpected signing method: {:?}", header.alg));
    }

    let mut validation = Validation::new(header.alg);
    validation.set_required_spec_claims(&["exp"]);
    validation.validate_aud = false;
    if let Some(iss) = expected_issuer {
        validation.set_issuer(&[iss]);
    }

    let data = decode::<Claims>(token, &DecodingKey::from_secret(secret), &validation)
        .map_err(|e| format!("invalid token: {e}"))?;
    Ok(data.claims)
}

/// Write the validated identity into request headers for downstream use.
pub(crate) fn inject_identity(req: &mut Request<Body>, claims: &Claims) {
    if let Some(sub) = &claims.sub {
        if let Ok(value) = HeaderValue::from_str(sub) {
            req.headers_mut().insert("x-user-id", value);
        }
    }
    if let Some(role) = &claims.role {
        if let Ok(value) = HeaderValue::from_str(role) {
            req.headers_mut().insert("x-user-role", value);
        }
    }
}

/// Tower layer enforcing HMAC bearer auth on the routes it wraps.
#[derive(Clone)]
pub struct JwtAuthLayer {
    secret: Arc<Vec<u8>>,
    issuer: Option<Arc<String>>,
}

impl JwtAuthLayer {
    pub fn new(secret: impl Into<Vec<u8>>, issuer: Option<String>) -> Self {
        Self {
            secret: Arc::new(secret.into()),
            issuer: issuer.map(Arc::new),
        }
    }
}

impl<S> Layer<S> for JwtAuthLayer {
    type Service = JwtAuthService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        JwtAuthService {
            inner,
            secret: self.secret.clone(),
            issuer: self.issuer.clone(),
        }
    }
}

#[derive(Clone)]
pub struct JwtAuthService<S> {
    inner: S,
    secret: Arc<Vec<u8>>,
    issuer: Option<Arc<String>>,
}

impl<S> Service<Request<Body>> for JwtAuthService<S>
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
        let secret = self.secret.clone();
        let issuer = self.issuer.clone();
        let mut inner = self.inner.clone();

        Box::pin(async move {
            let token = match bearer_token(req.headers()) {
                Ok(token) => token.to_string(),
                Err(reason) => {
                    return Ok(unauthorized(reason, req.headers()));
                }
            };

            match validate_hmac(&token, &secret, issuer.as_ref().map(|s| s.as_str())) {
                Ok(claims) => {
                    inject_identity(&mut req, &claims);
                    inner.call(req).await
                }
                Err(reason) => {
                    warn!(path = %req.uri().path(), reason = %reason, "JWT rejected");
                    Ok(unauthorized(&reason, req.headers()))
                }
            }
        })
    }
}

fn unauthorized(message: &str, headers: &HeaderMap) -> Response<Body> {
    error_response(
        StatusCode::UNAUTHORIZED,
        "unauthorized",
        message,
        request_id_of(headers),
    )
}
