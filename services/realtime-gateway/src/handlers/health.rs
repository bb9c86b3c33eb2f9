use axum::{extract::State, Json};
use serde_json::{json, Value};

use crate::error::AppError;
use crate::state::AppState;

pub async fn liveness() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

/// Ready when both stores answer, ingest accepts work and the hub is running.
pub async fn readiness(State(state): State<AppState>) -> Result<Json<Value>, AppError> {
    if !state.hub.is_running() {
        return Err(AppError::ServiceUnavailable("streaming hub stopped".into()));
    }
    if !state.aggregator.ready().await {
        return Err(AppError::ServiceUnavailable("ingest pipeline not ready".into()));
    }
    Ok(Json(json!({ "status": "ready" })))
}
