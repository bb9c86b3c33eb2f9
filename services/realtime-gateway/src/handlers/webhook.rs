use axum::{
    extract::{rejection::JsonRejection, State},
    http::StatusCode,
    Json,
};
use serde::Deserialize;

use aggregator::ingest::IngestSummary;

use crate::error::AppError;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct TickWebhook {
    #[serde(default)]
    pub source: String,
    #[serde(default)]
    pub items: Vec<serde_json::Value>,
}

pub async fn ingest_ticks(
    State(state): State<AppState>,
    payload: Result<Json<TickWebhook>, JsonRejection>,
) -> Result<(StatusCode, Json<IngestSummary>), AppError> {
    let Json(payload) = payload?;
    let source = payload.source.trim();
    if source.is_empty() {
        return Err(AppError::BadRequest("source is required".into()));
    }
    if payload.items.is_empty() {
        return Err(AppError::BadRequest("items must not be empty".into()));
    }

    let summary = state
        .aggregator
        .ingest()
        .ingest_json(source, payload.items)
        .await?;

    Ok((StatusCode::ACCEPTED, Json(summary)))
}
