use axum::{
    routing::{get, post},
    Router,
};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::handlers::{health, ops, stream, ticks, webhook};
use crate::state::AppState;

pub fn create_router(state: AppState) -> Router {
    let api_routes = Router::new()
        .route("/webhooks/ticks", post(webhook::ingest_ticks))
        .route("/ticks/{symbol}", get(ticks::latest_tick))
        .route("/ticks/{symbol}/history", get(ticks::tick_history))
        .route("/metrics/{symbol}", get(ticks::latest_summary));

    Router::new()
        .nest("/v1", api_routes)
        .route("/realtime/ticks", get(stream::stream_ticks))
        .route("/health/liveness", get(health::liveness))
        .route("/health/readiness", get(health::readiness))
        .route("/ops/metrics", get(ops::metrics))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
