// ABOUTME: Liveness and readiness endpoints
// ABOUTME: Readiness checks the execution store and the sandbox runtime

use axum::{extract::State, http::StatusCode, Json};
use chrono::Utc;
use serde_json::{json, Value};

use crate::ApiState;

pub async fn health_check() -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "timestamp": Utc::now().to_rfc3339(),
        "version": env!("CARGO_PKG_VERSION"),
        "service": "coderun"
    }))
}

pub async fn readiness_check(State(state): State<ApiState>) -> (StatusCode, Json<Value>) {
    let readiness = state.service.readiness().await;
    let status = if readiness.is_ready() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        status,
        Json(json!({
            "status": if readiness.is_ready() { "ready" } else { "not_ready" },
            "checks": readiness,
            "timestamp": Utc::now().to_rfc3339()
        })),
    )
}
