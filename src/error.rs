use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use thiserror::Error;

/// Gateway-wide error type with the HTTP mapping for each failure kind.
///
/// # Fail-closed posture
///
/// Whenever the gateway cannot make a correctness-preserving decision
/// (store unreachable, unknown algorithm, malformed policy) the error maps
/// to a 5xx and the request is refused rather than passed through
/// unchecked.
#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("invalid request: {0}")]
    BadRequest(String),

    #[error("request body too large")]
    PayloadTooLarge,

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("rate limit exceeded")]
    RateLimited,

    #[error("circuit breaker open for {0}")]
    CircuitOpen(String),

    #[error("upstream request failed: {0}")]
    Upstream(String),

    #[error("upstream request timed out: {0}")]
    UpstreamTimeout(String),

    #[error("store operation failed: {0}")]
    Store(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl From<redis::RedisError> for GatewayError {
    fn from(e: redis::RedisError) -> Self {
        GatewayError::Store(e.to_string())
    }
}

impl From<serde_json::Error> for GatewayError {
    fn from(e: serde_json::Error) -> Self {
        GatewayError::BadRequest(e.to_string())
    }
}

/// JSON error body returned to clients.
#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub error: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
}

/// Build a JSON error response, attaching the request id when one has been
/// assigned. Middleware layers use this directly so the id they read from
/// the request headers ends up in the body.
pub fn error_response(
    status: StatusCode,
    kind: &str,
    message: &str,
    request_id: Option<String>,
) -> Response {
    let body = ErrorBody {
        error: kind.to_string(),
        message: message.to_string(),
        request_id,
    };
    (status, axum::Json(body)).into_response()
}

impl GatewayError {
    /// The machine-readable error kind used in JSON bodies.
    pub fn kind(&self) -> &'static str {
        match self {
            GatewayError::BadRequest(_) => "invalid_request",
            GatewayError::PayloadTooLarge => "request_too_large",
            GatewayError::Unauthorized(_) => "unauthorized",
            GatewayError::Forbidden(_) => "forbidden",
            GatewayError::RateLimited => "rate_limited",
            GatewayError::CircuitOpen(_) => "circuit_open",
            GatewayError::Upstream(_) => "upstream_error",
            GatewayError::UpstreamTimeout(_) => "upstream_timeout",
            GatewayError::Store(_) => "store_error",
            GatewayError::Config(_) => "config_error",
            GatewayError::Internal(_) => "internal",
        }
    }

    /// The HTTP status this error surfaces as.
    pub fn status(&self) -> StatusCode {
        match self {
            GatewayError::BadRequest(_) => StatusCode::BAD_REQUEST,
            GatewayError::PayloadTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            GatewayError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            GatewayError::Forbidden(_) => StatusCode::FORBIDDEN,
            GatewayError::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            GatewayError::CircuitOpen(_) => StatusCode::SERVICE_UNAVAILABLE,
            GatewayError::Upstream(_) => StatusCode::BAD_GATEWAY,
            GatewayError::UpstreamTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
            GatewayError::Store(_) | GatewayError::Config(_) | GatewayError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    /// Client-facing message. Internal failure detail stays in the logs.
    fn public_message(&self) -> String {
        match self {
            GatewayError::BadRequest(msg) => msg.clone(),
            GatewayError::PayloadTooLarge => "request body too large".to_string(),
            GatewayError::Unauthorized(msg) => msg.clone(),
            GatewayError::Forbidden(msg) => msg.clone(),
            GatewayError::RateLimited => "rate limit exceeded".to_string(),
            GatewayError::CircuitOpen(target) => {
                format!("downstream {target} is unavailable")
            }
            GatewayError::Upstream(_) => "upstream request failed".to_string(),
            GatewayError::UpstreamTimeout(_) => "upstream request timed out".to_string(),
            GatewayError::Store(_) | GatewayError::Internal(_) => "internal error".to_string(),
            GatewayError::Config(_) => "service configuration error".to_string(),
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        if self.status().is_server_error() {
            tracing::error!(error = %self, "request failed");
        } else {
            tracing::debug!(error = %self, "request rejected");
        }
        error_response(self.status(), self.kind(), &self.public_message(), None)
    }
}

/// Convenience alias for fallible gateway operations.
pub type GatewayResult<T> = Result<T, GatewayError>;

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            GatewayError::Unauthorized("x".into()).status(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            GatewayError::Forbidden("x".into()).status(),
            StatusCode::FORBIDDEN
        );
        assert_eq!(
            GatewayError::RateLimited.status(),
            StatusCode::TOO_MANY_REQUESTS
        );
        assert_eq!(
            GatewayError::CircuitOpen("origin".into()).status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            GatewayError::Store("down".into()).status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(
            GatewayError::PayloadTooLarge.status(),
            StatusCode::PAYLOAD_TOO_LARGE
        );
    }

    #[test]
    fn test_kind_strings() {
        assert_eq!(GatewayError::RateLimited.kind(), "rate_limited");
        assert_eq!(GatewayError::Store("x".into()).kind(), "store_error");
        assert_eq!(GatewayError::CircuitOpen("x".into()).kind(), "circuit_open");
    }

    #[test]
    fn test_store_error_does_not_leak_detail() {
        let err = GatewayError::Store("redis at 10.0.0.1 refused".into());
        assert_eq!(err.public_message(), "internal error");
    }

    #[test]
    fn test_error_body_serialization() {
        let body = ErrorBody {
            error: "rate_limited".into(),
            message: "rate limit exceeded".into(),
            request_id: Some("req-1".into()),
        };
        let json = serde_json::to_string(&body).unwrap();
        assert!(json.contains("\"request_id\":\"req-1\""));

        let body = ErrorBody {
            error: "unauthorized".into(),
            message: "missing Authorization header".into(),
            request_id: None,
        };
        let json = serde_json::to_string(&body).unwrap();
        assert!(!json.contains("request_id"));
    }
}
