//! Admin surface: policy CRUD and circuit-breaker operations.
//!
//! Protected by bearer auth when a JWT scheme is configured, and by RBAC
//! when enabled; the handlers themselves only touch their tables.

use std::collections::HashMap;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use serde::Deserialize;
use tracing::info;

use crate::breaker::BreakerSnapshot;
use crate::error::GatewayError;
use crate::limiter::Policy;
use crate::state::AppState;

/// Body of `POST /admin/policies`.
#[derive(Debug, Deserialize)]
pub struct UpsertPolicyRequest {
    pub key: String,
    pub policy: Policy,
}

/// `GET /admin/policies` — the whole table as a JSON object.
pub async fn list_policies(State(state): State<AppState>) -> Json<HashMap<String, Policy>> {
    Json(state.policies.list())
}

/// `POST /admin/policies` — upsert one policy; 204 on success.
///
/// Malformed JSON is answered with 400 by the extractor via
/// [`GatewayError::BadRequest`].
pub async fn upsert_policy(
    State(state): State<AppState>,
    payload: Result<Json<UpsertPolicyRequest>, axum::extract::rejection::JsonRejection>,
) -> Result<StatusCode, GatewayError> {
    let Json(payload) = payload.map_err(|e| GatewayError::BadRequest(e.to_string()))?;
    info!(key = %payload.key, "policy upserted");
    state.policies.set(&payload.key, payload.policy);
    Ok(StatusCode::NO_CONTENT)
}

/// `GET /admin/breakers` — snapshot of every circuit breaker.
pub async fn show_breakers(
    State(state): State<AppState>,
) -> Json<HashMap<String, BreakerSnapshot>> {
    Json(state.breakers.snapshot_all())
}

/// `POST /admin/breakers/{target}/reset` — force one breaker closed.
pub async fn reset_breaker(
    State(state): State<AppState>,
    Path(target): Path<String>,
) -> impl IntoResponse {
    if state.breakers.reset(&target) {
        info!(breaker = %target, "breaker reset via admin");
        StatusCode::NO_CONTENT
    } else {
        StatusCode::NOT_FOUND
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_upsert_payload_parses() {
        let payload: UpsertPolicyRequest = serde_json::from_str(
            r#"{"key":"tenant:/api","policy":{"algorithm":"tokenbucket","capacity":50,"rate":25.0}}"#,
        )
        .unwrap();
        assert_eq!(payload.key, "tenant:/api");
        assert_eq!(payload.policy.capacity, 50);
    }

    #[test]
    fn test_upsert_payload_rejects_garbage() {
        assert!(serde_json::from_str::<UpsertPolicyRequest>(r#"{"key":123}"#).is_err());
        assert!(serde_json::from_str::<UpsertPolicyRequest>("not json").is_err());
    }
}
