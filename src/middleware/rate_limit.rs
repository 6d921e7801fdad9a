//! Rate-limit enforcement stage.
//!
//! Builds the request fingerprint, looks up its policy, and asks the
//! limiter for a decision inside a 50 ms deadline. Store errors and
//! deadline expiry fail closed with a 500. Every response — allowed or
//! denied — carries the `X-RateLimit-*` headers.

use std::net::SocketAddr;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use axum::body::Body;
use axum::extract::ConnectInfo;
use axum::http::{HeaderValue, Request, Response, StatusCode};
use tower::{Layer, Service};
use tracing::{error, warn};

use crate::clock::Clock;
use crate::error::error_response;
use crate::limiter::{Decision, Limiter, Policy};
use crate::policy::PolicyTable;

use super::request_id::request_id_of;

/// Budget for one policy lookup plus store round trip.
pub const EVALUATION_DEADLINE: Duration = Duration::from_millis(50);

/// Fallback identity when no header or peer address is available.
const UNKNOWN_CLIENT: &str = "unknown";

/// Identity half of the fingerprint: the API key when presented, else the
/// client IP (first `X-Forwarded-For` element, else the peer address).
fn client_identity(req: &Request<Body>) -> String {
    if let Some(key) = req
        .headers()
        .get("x-api-key")
        .and_then(|v| v.to_str().ok())
        .filter(|s| !s.is_empty())
    {
        return key.to_string();
    }

    if let Some(forwarded) = req
        .headers()
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
    {
        let forwarded = forwarded.trim();
        if !forwarded.is_empty() {
            return forwarded.to_string();
        }
    }

    req.extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ci| ci.0.ip().to_string())
        .unwrap_or_else(|| UNKNOWN_CLIENT.to_string())
}

/// `identity ":" path` — the key both the policy table and the store see.
pub fn fingerprint(req: &Request<Body>) -> String {
    format!("{}:{}", client_identity(req), req.uri().path())
}

#[derive(Clone)]
pub struct RateLimitLayer {
    limiter: Arc<Limiter>,
    policies: Arc<PolicyTable>,
    clock: Arc<dyn Clock>,
}

impl RateLimitLayer {
    pub fn new(limiter: Arc<Limiter>, policies: Arc<PolicyTable>, clock: Arc<dyn Clock>) -> Self {
        Self {
            limiter,
            policies,
            clock,
        }
    }
}

impl<S> Layer<S> for RateLimitLayer {
    type Service = RateLimitService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        RateLimitService {
            inner,
            limiter: self.limiter.clone(),
            policies: self.policies.clone(),
            clock: self.clock.clone(),
        }
    }
}

#[derive(Clone)]
pub struct RateLimitService<S> {
    inner: S,
    limiter: Arc<Limiter>,
    policies: Arc<PolicyTable>,
    clock: Arc<dyn Clock>,
}

impl<S> Service<Request<Body>> for RateLimitService<S>
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

    fn call(&mut self, req: Request<Body>) -> Self::Future {
        let limiter = self.limiter.clone();
        let policies = self.policies.clone();
        let clock = self.clock.clone();
        let mut inner = self.inner.clone();

        Box::pin(async move {
            let key = fingerprint(&req);
            let policy = policies.get(&key);
            let request_id = request_id_of(req.headers());

            crate::metrics::record_request();

            let evaluation =
                tokio::time::timeout(EVALUATION_DEADLINE, limiter.allow(&key, &policy)).await;

            let decision = match evaluation {
                Ok(Ok(decision)) => decision,
                Ok(Err(e)) => {
                    // Store or policy failure: deny service instead of
                    // waving traffic through unlimited.
                    error!(fingerprint = %key, error = %e, "rate limit evaluation failed");
                    return Ok(error_response(
                        StatusCode::INTERNAL_SERVER_ERROR,
                        "internal",
                        "internal error",
                        request_id,
                    ));
                }
                Err(_) => {
                    error!(fingerprint = %key, "rate limit evaluation deadline expired");
                    return Ok(error_response(
                        StatusCode::INTERNAL_SERVER_ERROR,
                        "internal",
                        "internal error",
                        request_id,
                    ));
                }
            };

            let reset_epoch_s = clock.now_ms() / 1000 + 1;

            if !decision.allowed {
                crate::metrics::record_rate_limited();
                warn!(fingerprint = %key, "rate limit exceeded");
                let mut response = error_response(
                    StatusCode::TOO_MANY_REQUESTS,
                    "rate_limited",
                    "rate limit exceeded",
                    request_id,
                );
                apply_headers(&mut response, &policy, &decision, reset_epoch_s);
                response
                    .headers_mut()
                    .insert("retry-after", HeaderValue::from_static("1"));
                return Ok(response);
            }

            let mut response = inner.call(req).await?;
            apply_headers(&mut response, &policy, &decision, reset_epoch_s);
            Ok(response)
        })
    }
}

fn apply_headers(
    response: &mut Response<Body>,
    policy: &Policy,
    decision: &Decision,
    reset_epoch_s: u64,
) {
    let headers = response.headers_mut();
    if let Ok(v) = HeaderValue::from_str(&policy.advertised_limit().to_string()) {
        headers.insert("x-ratelimit-limit", v);
    }
    if let Ok(v) = HeaderValue::from_str(&decision.remaining.to_string()) {
        headers.insert("x-ratelimit-remaining", v);
    }
    if let Ok(v) = HeaderValue::from_str(&reset_epoch_s.to_string()) {
        headers.insert("x-ratelimit-reset", v);
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::store::MemoryStore;
    use axum::routing::get;
    use tower::ServiceExt;

    fn app_with_policy(policy: Policy) -> axum::Router {
        let clock = Arc::new(ManualClock::new(1_000_000));
        let store = Arc::new(MemoryStore::new(clock.clone()));
        let limiter = Arc::new(Limiter::new(store));
        let policies = Arc::new(PolicyTable::new());
        // Policies are keyed by fingerprint; cover both callers used below.
        policies.set("alice:/", policy);
        policies.set("10.1.1.1:/", policy);

        axum::Router::new()
            .route("/", get(|| async { "ok" }))
            .layer(RateLimitLayer::new(limiter, policies, clock))
    }

    fn get_with_key(key: &str) -> Request<Body> {
        Request::builder()
            .uri("/")
            .header("x-api-key", key)
            .body(Body::empty())
            .unwrap()
    }

    #[tokio::test]
    async fn test_allows_until_exhausted_then_429() {
        let app = app_with_policy(Policy::token_bucket(2, 2.0));

        for expected_remaining in ["1", "0"] {
            let response = app.clone().oneshot(get_with_key("alice")).await.unwrap();
            assert_eq!(response.status(), StatusCode::OK);
            assert_eq!(
                response.headers().get("x-ratelimit-remaining").unwrap(),
                expected_remaining
            );
            assert_eq!(response.headers().get("x-ratelimit-limit").unwrap(), "2");
            assert!(response.headers().contains_key("x-ratelimit-reset"));
        }

        let response = app.clone().oneshot(get_with_key("alice")).await.unwrap();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers().get("retry-after").unwrap(), "1");
        assert_eq!(
            response.headers().get("x-ratelimit-remaining").unwrap(),
            "0"
        );
    }

    #[tokio::test]
    async fn test_fingerprints_do_not_interfere() {
        let app = app_with_policy(Policy::token_bucket(1, 1.0));

        let ok = app.clone().oneshot(get_with_key("alice")).await.unwrap();
        assert_eq!(ok.status(), StatusCode::OK);
        let denied = app.clone().oneshot(get_with_key("alice")).await.unwrap();
        assert_eq!(denied.status(), StatusCode::TOO_MANY_REQUESTS);

        // A different identity lands on the default policy and passes.
        let other = app.clone().oneshot(get_with_key("bob")).await.unwrap();
        assert_eq!(other.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_forwarded_for_used_without_api_key() {
        let app = app_with_policy(Policy::token_bucket(1, 1.0));

        let request = |ip: &str| {
            Request::builder()
                .uri("/")
                .header("x-forwarded-for", format!("{ip}, 10.0.0.254"))
                .body(Body::empty())
                .unwrap()
        };

        assert_eq!(
            app.clone().oneshot(request("10.1.1.1")).await.unwrap().status(),
            StatusCode::OK
        );
        assert_eq!(
            app.clone().oneshot(request("10.1.1.1")).await.unwrap().status(),
            StatusCode::TOO_MANY_REQUESTS
        );
        assert_eq!(
            app.clone().oneshot(request("10.2.2.2")).await.unwrap().status(),
            StatusCode::OK
        );
    }

    #[tokio::test]
    async fn test_unknown_algorithm_parameters_fail_closed() {
        // A policy with a zero rate cannot be evaluated; the request must
        // be refused, not passed through.
        let app = app_with_policy(Policy::token_bucket(5, 0.0));
        let response = app.oneshot(get_with_key("alice")).await.unwrap();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn test_fingerprint_shape() {
        let req = Request::builder()
            .uri("/api/users?page=2")
            .header("x-api-key", "k1")
            .body(Body::empty())
            .unwrap();
        assert_eq!(fingerprint(&req), "k1:/api/users");

        let req = Request::builder()
            .uri("/api/users")
            .header("x-forwarded-for", "203.0.113.9")
            .body(Body::empty())
            .unwrap();
        assert_eq!(fingerprint(&req), "203.0.113.9:/api/users");

        let req = Request::builder().uri("/p").body(Body::empty()).unwrap();
        assert_eq!(fingerprint(&req), "unknown:/p");
    }
}
