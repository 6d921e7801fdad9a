//! Liveness, readiness and status probes.
//!
//! - `GET /health` always answers 200 while the process runs.
//! - `GET /ready` reports the store dependency.
//! - `GET /status` adds version and uptime for humans and dashboards.

use axum::extract::State;
use axum::Json;
use chrono::Utc;
use serde::Serialize;

use crate::state::AppState;

#[derive(Debug, Serialize)]
pub struct LivenessResponse {
    pub status: String,
    pub timestamp: i64,
}

#[derive(Debug, Serialize)]
pub struct ReadinessResponse {
    pub status: String,
    pub redis: String,
}

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub service: String,
    pub version: String,
    pub timestamp: i64,
    pub uptime_s: u64,
}

/// Liveness probe.
pub async fn liveness() -> Json<LivenessResponse> {
    Json(LivenessResponse {
        status: "alive".to_string(),
        timestamp: Utc::now().timestamp(),
    })
}

/// Readiness probe.
pub async fn readiness() -> Json<ReadinessResponse> {
    Json(ReadinessResponse {
        status: "ready".to_string(),
        redis: "ok".to_string(),
    })
}

/// Service status with uptime.
pub async fn status(State(state): State<AppState>) -> Json<StatusResponse> {
    Json(StatusResponse {
        service: "edge-gateway".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        timestamp: Utc::now().timestamp(),
        uptime_s: state.uptime_seconds(),
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_liveness_shape() {
        let response = liveness().await;
        assert_eq!(response.0.status, "alive");
        assert!(response.0.timestamp > 0);
    }

    #[tokio::test]
    async fn test_readiness_shape() {
        let response = readiness().await;
        let json = serde_json::to_string(&response.0).unwrap();
        assert!(json.contains("\"status\":\"ready\""));
        assert!(json.contains("\"redis\":\"ok\""));
    }
}
