use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use aggregator::dedup::MemoryKv;
use aggregator::publish::PubSubBus;
use aggregator::service::Aggregator;
use aggregator::store::MemoryStore;
use realtime_gateway::config::Args;
use realtime_gateway::hub::{HubHandle, StreamingHub};
use realtime_gateway::metrics::GatewayMetrics;
use realtime_gateway::router::create_router;
use realtime_gateway::state::AppState;

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    info!(
        version = aggregator::SERVICE_VERSION,
        channel = %args.pubsub_channel,
        batch_max = args.batch_max,
        batch_flush_ms = args.batch_flush_ms,
        workers = args.worker_concurrency,
        "Starting realtime gateway"
    );

    let bus = PubSubBus::new();
    let metrics = Arc::new(GatewayMetrics::new());
    let (hub, hub_task) = StreamingHub::spawn(
        args.enrichment_config(),
        args.broadcaster_config(),
        bus.subscribe(&args.pubsub_channel),
        metrics.clone(),
    );

    let aggregator = Arc::new(Aggregator::start(
        args.aggregator_config(),
        Arc::new(MemoryKv::new()),
        Arc::new(MemoryStore::new()),
        Arc::new(bus.clone()),
    ));

    let app = create_router(AppState::new(aggregator.clone(), hub.clone(), metrics));

    let addr = args.socket_addr();
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {}", addr))?;

    info!("Listening on {}", addr);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(aggregator, hub))
        .await?;

    if let Err(e) = hub_task.await {
        warn!(error = %e, "Hub task ended abnormally");
    }
    info!("Gateway stopped");
    Ok(())
}

/// Wait for Ctrl-C, then drain ingest and close live streams so the server
/// can finish its in-flight responses.
async fn shutdown_signal(aggregator: Arc<Aggregator>, hub: HubHandle) {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("Shutdown requested");

    // Failures are logged by the aggregator itself.
    let _ = aggregator.shutdown().await;
    hub.shutdown().await;
}
