use std::sync::Arc;

use aggregator::service::Aggregator;

use crate::hub::HubHandle;
use crate::metrics::GatewayMetrics;

#[derive(Clone)]
pub struct AppState {
    pub aggregator: Arc<Aggregator>,
    pub hub: HubHandle,
    pub metrics: Arc<GatewayMetrics>,
}

impl AppState {
    pub fn new(aggregator: Arc<Aggregator>, hub: HubHandle, metrics: Arc<GatewayMetrics>) -> Self {
        Self {
            aggregator,
            hub,
            metrics,
        }
    }
}
