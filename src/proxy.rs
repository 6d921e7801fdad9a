//! Reverse proxy to the configured downstream origin.
//!
//! Forwarding runs inside the origin's circuit breaker; GET requests
//! consult the response cache first, and a cache hit bypasses the breaker
//! entirely. Identity headers injected by the auth stages
//! (`X-User-ID`, `X-User-Role`) and the request id flow through unchanged.

use std::time::Instant;

use axum::body::{Body, Bytes};
use axum::extract::State;
use axum::http::{HeaderMap, HeaderValue, Request, Response, StatusCode};
use tracing::{debug, warn};

use crate::cache::{cache_key, is_cacheable, response_ttl, CacheEntry};
use crate::error::error_response;
use crate::middleware::request_id::request_id_of;
use crate::state::AppState;

/// Breaker pool key for the single configured origin.
pub const DOWNSTREAM_TARGET: &str = "downstream";

/// Headers that must not be forwarded in either direction.
fn is_hop_by_hop(name: &str) -> bool {
    matches!(
        name,
        "connection"
            | "keep-alive"
            | "proxy-authenticate"
            | "proxy-authorization"
            | "te"
            | "trailers"
            | "transfer-encoding"
            | "upgrade"
            | "host"
            | "content-length"
    )
}

fn forwardable_headers(headers: &HeaderMap) -> HeaderMap {
    headers
        .iter()
        .filter(|(name, _)| !is_hop_by_hop(name.as_str()))
        .map(|(name, value)| (name.clone(), value.clone()))
        .collect()
}

/// Catch-all handler: everything outside the reserved prefixes lands here.
pub async fn proxy_handler(State(state): State<AppState>, req: Request<Body>) -> Response<Body> {
    let request_id = request_id_of(req.headers());
    let method = req.method().clone();
    let path_and_query = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| req.uri().path().to_string());
    let is_get = method == axum::http::Method::GET;

    // Served from cache: no origin call, no breaker involvement.
    let key = cache_key(
        method.as_str(),
        req.uri().path(),
        req.uri().query().unwrap_or(""),
    );
    if is_get {
        if let Some(entry) = state.cache.get(&key) {
            crate::metrics::record_cache_hit();
            debug!(path = %path_and_query, "cache hit");
            return cached_response(&entry);
        }
        crate::metrics::record_cache_miss();
    }

    let breaker = state.breakers.get(DOWNSTREAM_TARGET);
    let permit = match breaker.try_acquire() {
        Ok(permit) => permit,
        Err(e) => {
            warn!(path = %path_and_query, "request rejected by open circuit");
            return error_response(
                StatusCode::SERVICE_UNAVAILABLE,
                e.kind(),
                "downstream is unavailable",
                request_id,
            );
        }
    };

    let upstream_headers = forwardable_headers(req.headers());
    let body = match axum::body::to_bytes(req.into_body(), state.config.max_request_body_size).await
    {
        Ok(bytes) => bytes,
        Err(e) => {
            // Permit drops here without an outcome: a client-side body
            // failure says nothing about origin health.
            warn!(error = %e, "failed to read request body");
            return error_response(
                StatusCode::BAD_REQUEST,
                "invalid_request",
                "failed to read request body",
                request_id,
            );
        }
    };

    let url = format!(
        "{}{}",
        state.config.downstream_url.trim_end_matches('/'),
        path_and_query
    );

    let start = Instant::now();
    let upstream = state
        .http_client
        .request(method, &url)
        .headers(upstream_headers)
        .body(body)
        .send()
        .await;
    crate::metrics::record_proxy_duration(start.elapsed().as_secs_f64());

    let upstream = match upstream {
        Ok(response) => response,
        Err(e) => {
            permit.fail();
            crate::metrics::record_upstream_error();
            warn!(url = %url, error = %e, "upstream request failed");
            let (status, kind, message) = if e.is_timeout() {
                (
                    StatusCode::GATEWAY_TIMEOUT,
                    "upstream_timeout",
                    "upstream request timed out",
                )
            } else {
                (
                    StatusCode::BAD_GATEWAY,
                    "upstream_error",
                    "upstream request failed",
                )
            };
            return error_response(status, kind, message, request_id);
        }
    };

    let status = upstream.status();
    let headers = forwardable_headers(upstream.headers());
    let bytes = match upstream.bytes().await {
        Ok(bytes) => bytes,
        Err(e) => {
            permit.fail();
            crate::metrics::record_upstream_error();
            warn!(url = %url, error = %e, "failed to read upstream body");
            return error_response(
                StatusCode::BAD_GATEWAY,
                "upstream_error",
                "upstream request failed",
                request_id,
            );
        }
    };

    // 5xx responses pass through to the client but count against the
    // breaker as origin failures.
    if status.is_server_error() {
        permit.fail();
    } else {
        permit.succeed();
    }

    let mut response = build_response(status, &headers, bytes.clone());
    if is_get && is_cacheable(status, &headers) {
        let entry = CacheEntry::new(
            status,
            headers.clone(),
            bytes,
            state.clock.now_ms(),
            response_ttl(&headers),
        );
        if state.cache.set(key, entry) {
            response
                .headers_mut()
                .insert("x-cache", HeaderValue::from_static("MISS"));
        }
    }

    response
}

fn cached_response(entry: &CacheEntry) -> Response<Body> {
    let mut response = build_response(entry.status, &entry.headers, entry.body.clone());
    response
        .headers_mut()
        .insert("x-cache", HeaderValue::from_static("HIT"));
    response
}

fn build_response(status: StatusCode, headers: &HeaderMap, body: Bytes) -> Response<Body> {
    let mut response = Response::new(Body::from(body));
    *response.status_mut() = status;
    *response.headers_mut() = headers.clone();
    response
}
