//! Request-ID assignment and propagation.
//!
//! An incoming `X-Request-ID` is kept; otherwise a UUIDv4 is generated. The
//! id is written into the request headers (so later stages and the proxied
//! origin see it) and echoed on the response.

use std::task::{Context, Poll};

use axum::body::Body;
use axum::http::header::HeaderValue;
use axum::http::{HeaderMap, Request, Response};
use tower::{Layer, Service};
use uuid::Uuid;

/// Header carrying the request id.
pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// Read the already-assigned request id, if any.
///
/// Error paths in later stages use this to stamp their JSON bodies.
pub fn request_id_of(headers: &HeaderMap) -> Option<String> {
    headers
        .get(REQUEST_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
}

#[derive(Clone, Default)]
pub struct RequestIdLayer;

impl RequestIdLayer {
    pub fn new() -> Self {
        Self
    }
}

impl<S> Layer<S> for RequestIdLayer {
    type Service = RequestIdService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        RequestIdService { inner }
    }
}

#[derive(Clone)]
pub struct RequestIdService<S> {
    inner: S,
}

impl<S> Service<Request<Body>> for RequestIdService<S>
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
        let id = request_id_of(req.headers()).unwrap_or_else(|| Uuid::new_v4().to_string());

        let header_value = HeaderValue::from_str(&id)
            .unwrap_or_else(|_| HeaderValue::from_static("unknown"));
        req.headers_mut()
            .insert(REQUEST_ID_HEADER, header_value.clone());

        let mut inner = self.inner.clone();
        Box::pin(async move {
            let mut response = inner.call(req).await?;
            response.headers_mut().insert(REQUEST_ID_HEADER, header_value);
            Ok(response)
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_existing_id_is_kept() {
        let mut headers = HeaderMap::new();
        headers.insert(REQUEST_ID_HEADER, "client-id-7".parse().unwrap());
        assert_eq!(request_id_of(&headers), Some("client-id-7".to_string()));
    }

    #[test]
    fn test_empty_id_counts_as_absent() {
        let mut headers = HeaderMap::new();
        headers.insert(REQUEST_ID_HEADER, "".parse().unwrap());
        assert_eq!(request_id_of(&headers), None);
    }

    #[tokio::test]
    async fn test_layer_assigns_and_echoes_id() {
        use axum::routing::get;
        use tower::ServiceExt;

        let app = axum::Router::new()
            .route("/", get(|| async { "ok" }))
            .layer(RequestIdLayer::new());

        let response = app
            .clone()
            .oneshot(Request::builder().uri("/").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let generated = response.headers().get(REQUEST_ID_HEADER).unwrap();
        assert!(Uuid::parse_str(generated.to_str().unwrap()).is_ok());

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/")
                    .header(REQUEST_ID_HEADER, "mine")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.headers().get(REQUEST_ID_HEADER).unwrap(), "mine");
    }
}
