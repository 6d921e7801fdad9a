//! Router assembly: reserved surface, proxy fallback and the middleware
//! pipeline.
//!
//! # Pipeline (outermost first)
//!
//! ```text
//! Request
//!    │
//!    ▼
//! ┌──────────────────┐
//! │   Request ID     │ ← assigns/echoes X-Request-ID
//! └────────┬─────────┘
//!          ▼
//! ┌──────────────────┐
//! │     Logging      │ ← one structured record per request
//! └────────┬─────────┘
//!          ▼
//! ┌──────────────────┐
//! │    Rate limit    │ ← 429 on deny, 500 fail-closed on store error
//! └────────┬─────────┘
//!          ▼
//! ┌──────────────────┐
//! │    Size limit    │ ← 413 over the declared-length cap
//! └────────┬─────────┘
//!          ▼
//! ┌──────────────────┐
//! │   API-key auth   │ ← pass-through when no X-API-Key
//! └────────┬─────────┘
//!          ▼
//! ┌──────────────────┐
//! │ JWT + RBAC       │ ← admin routes only, when configured
//! └────────┬─────────┘
//!          ▼
//!   handler / proxy
//! ```
//!
//! Reserved prefixes (`/health`, `/ready`, `/status`, `/metrics`,
//! `/admin/*`) are routed explicitly; everything else falls through to the
//! reverse proxy.

use axum::extract::{DefaultBodyLimit, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::{Any, CorsLayer};
use tracing::info;

use crate::auth::{ApiKeyAuthLayer, JwksAuthLayer, JwtAuthLayer};
use crate::handlers;
use crate::middleware::{
    LoggingLayer, RateLimitLayer, RbacLayer, RequestIdLayer, SizeLimitLayer,
};
use crate::proxy::proxy_handler;
use crate::state::AppState;

/// Build the full application router.
pub fn build_router(state: AppState) -> Router {
    let config = &state.config;
    let cors = build_cors_layer(&config.cors_allowed_origins);

    // =========================================================================
    // Admin surface, with per-route auth and RBAC
    // =========================================================================
    let mut admin = Router::new()
        .route(
            "/admin/policies",
            get(handlers::list_policies).post(handlers::upsert_policy),
        )
        .route("/admin/breakers", get(handlers::show_breakers))
        .route(
            "/admin/breakers/{target}/reset",
            post(handlers::reset_breaker),
        );

    if config.rbac_enabled {
        info!("RBAC enabled on admin surface");
        admin = admin.layer(RbacLayer::with_defaults());
    }

    // Bearer auth wraps RBAC so identity headers exist when roles are
    // checked. JWKS wins when both schemes are configured.
    if let Some(jwks) = &state.jwks {
        info!("JWKS bearer auth enabled on admin surface");
        admin = admin.layer(JwksAuthLayer::new(
            jwks.clone(),
            config.jwt_issuer.clone(),
            config.jwt_audience.clone(),
        ));
    } else if let Some(secret) = &config.jwt_secret {
        info!("HMAC bearer auth enabled on admin surface");
        admin = admin.layer(JwtAuthLayer::new(
            secret.as_bytes().to_vec(),
            config.jwt_issuer.clone(),
        ));
    }

    // =========================================================================
    // Reserved surface + proxy fallback
    // =========================================================================
    let router = Router::new()
        .route("/health", get(handlers::liveness))
        .route("/ready", get(handlers::readiness))
        .route("/status", get(handlers::status))
        .route("/metrics", get(render_metrics))
        .merge(admin)
        .fallback(proxy_handler);

    // =========================================================================
    // Pipeline layers (applied innermost first; the last is outermost)
    // =========================================================================
    router
        .layer(cors)
        .layer(ApiKeyAuthLayer::new(state.api_keys.clone()))
        .layer(DefaultBodyLimit::max(config.max_request_body_size))
        .layer(SizeLimitLayer::new(config.max_request_body_size))
        .layer(RateLimitLayer::new(
            state.limiter.clone(),
            state.policies.clone(),
            state.clock.clone(),
        ))
        .layer(LoggingLayer::new())
        .layer(RequestIdLayer::new())
        .with_state(state)
}

/// `GET /metrics` — Prometheus exposition from the installed recorder.
async fn render_metrics(State(state): State<AppState>) -> impl IntoResponse {
    match &state.metrics_handle {
        Some(handle) => (StatusCode::OK, handle.render()).into_response(),
        None => (StatusCode::SERVICE_UNAVAILABLE, "metrics recorder unavailable").into_response(),
    }
}

fn build_cors_layer(allowed_origins: &[String]) -> CorsLayer {
    let allow_any = allowed_origins.iter().any(|o| o == "*");
    if allow_any {
        CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any)
    } else {
        let origins: Vec<_> = allowed_origins
            .iter()
            .filter_map(|o| o.parse().ok())
            .collect();
        CorsLayer::new()
            .allow_origin(origins)
            .allow_methods(Any)
            .allow_headers(Any)
    }
}
