use std::collections::BTreeMap;

use axum::{extract::State, Json};

use crate::state::AppState;

/// Pipeline and gateway counters as one flat map.
pub async fn metrics(State(state): State<AppState>) -> Json<BTreeMap<String, u64>> {
    let mut counters = state.aggregator.metrics().export();
    counters.extend(state.metrics.export());
    Json(counters)
}
