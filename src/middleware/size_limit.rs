//! Declared-size rejection for oversize requests.
//!
//! Requests whose `Content-Length` exceeds the limit are refused with 413
//! before any body bytes are read. The streaming cap for requests that lie
//! about (or omit) their length is axum's `DefaultBodyLimit`, applied at
//! the router with the same limit.

use std::task::{Context, Poll};

use axum::body::Body;
use axum::http::{Request, Response, StatusCode};
use tower::{Layer, Service};
use tracing::warn;

use crate::error::error_response;

use super::request_id::request_id_of;

#[derive(Clone)]
pub struct SizeLimitLayer {
    max_bytes: u64,
}

impl SizeLimitLayer {
    pub fn new(max_bytes: usize) -> Self {
        Self {
            max_bytes: max_bytes as u64,
        }
    }
}

impl<S> Layer<S> for SizeLimitLayer {
    type Service = SizeLimitService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        SizeLimitService {
            inner,
            max_bytes: self.max_bytes,
        }
    }
}

#[derive(Clone)]
pub struct SizeLimitService<S> {
    inner: S,
    max_bytes: u64,
}

impl<S> Service<Request<Body>> for SizeLimitService<S>
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
        let declared = req
            .headers()
            .get("content-length")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok());
        let max_bytes = self.max_bytes;
        let mut inner = self.inner.clone();

        Box::pin(async move {
            if let Some(length) = declared {
                if length > max_bytes {
                    warn!(
                        content_length = length,
                        max = max_bytes,
                        "request body too large"
                    );
                    return Ok(error_response(
                        StatusCode::PAYLOAD_TOO_LARGE,
                        "request_too_large",
                        "request body too large",
                        request_id_of(req.headers()),
                    ));
                }
            }
            inner.call(req).await
        })
    }
}
