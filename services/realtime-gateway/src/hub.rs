//! Streaming hub
//!
//! One task owns the enrichment engine and the broadcaster. It consumes the
//! pub/sub subscription and a command channel, so per-symbol state and the
//! connection map are only ever touched from this task.

use std::sync::Arc;

use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use types::ids::ConnectionId;

use crate::broadcaster::{Broadcaster, BroadcasterConfig, Subscription};
use crate::enrichment::{EnrichmentConfig, EnrichmentEngine};
use crate::metrics::GatewayMetrics;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HubError {
    #[error("streaming hub is not running")]
    Stopped,
}

enum HubCommand {
    Subscribe {
        filter: Option<String>,
        reply: oneshot::Sender<Subscription>,
    },
    Unsubscribe {
        id: ConnectionId,
    },
    Shutdown {
        done: oneshot::Sender<()>,
    },
}

/// Handle to the hub task. Cheap to clone.
///
/// The command channel is unbounded so that `unsubscribe` can be called
/// from `Drop`.
#[derive(Clone)]
pub struct HubHandle {
    tx: mpsc::UnboundedSender<HubCommand>,
}

impl HubHandle {
    pub async fn subscribe(&self, filter: Option<String>) -> Result<Subscription, HubError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(HubCommand::Subscribe { filter, reply })
            .map_err(|_| HubError::Stopped)?;
        rx.await.map_err(|_| HubError::Stopped)
    }

    /// Idempotent; unknown ids are ignored.
    pub fn unsubscribe(&self, id: ConnectionId) {
        let _ = self.tx.send(HubCommand::Unsubscribe { id });
    }

    /// Close every connection and stop the hub.
    pub async fn shutdown(&self) {
        let (done, rx) = oneshot::channel();
        if self.tx.send(HubCommand::Shutdown { done }).is_ok() {
            let _ = rx.await;
        }
    }

    pub fn is_running(&self) -> bool {
        !self.tx.is_closed()
    }
}

pub struct StreamingHub {
    engine: EnrichmentEngine,
    broadcaster: Broadcaster,
    commands: mpsc::UnboundedReceiver<HubCommand>,
    ticks: broadcast::Receiver<String>,
    metrics: Arc<GatewayMetrics>,
}

impl StreamingHub {
    /// Spawn the hub over a pub/sub subscription.
    pub fn spawn(
        enrichment: EnrichmentConfig,
        broadcaster: BroadcasterConfig,
        ticks: broadcast::Receiver<String>,
        metrics: Arc<GatewayMetrics>,
    ) -> (HubHandle, JoinHandle<()>) {
        let (tx, commands) = mpsc::unbounded_channel();
        let hub = Self {
            engine: EnrichmentEngine::new(enrichment),
            broadcaster: Broadcaster::new(broadcaster, metrics.clone()),
            commands,
            ticks,
            metrics,
        };
        let task = tokio::spawn(hub.run());
        (HubHandle { tx }, task)
    }

    async fn run(mut self) {
        info!("Streaming hub started");
        let mut ticks_open = true;

        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(HubCommand::Subscribe { filter, reply }) => {
                        let sub = self.broadcaster.subscribe(filter);
                        if let Err(sub) = reply.send(sub) {
                            // requester went away before the reply
                            self.broadcaster.unsubscribe(sub.id);
                        }
                    }
                    Some(HubCommand::Unsubscribe { id }) => {
                        self.broadcaster.unsubscribe(id);
                    }
                    Some(HubCommand::Shutdown { done }) => {
                        self.commands.close();
                        self.broadcaster.shutdown();
                        let _ = done.send(());
                        break;
                    }
                    None => {
                        self.broadcaster.shutdown();
                        break;
                    }
                },
                message = self.ticks.recv(), if ticks_open => match message {
                    Ok(payload) => self.handle_payload(&payload),
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Tick subscription lagged, messages skipped");
                        self.metrics.record_lagged(skipped);
                    }
                    Err(RecvError::Closed) => {
                        warn!("Tick channel closed");
                        ticks_open = false;
                    }
                },
            }
        }

        info!("Streaming hub stopped");
    }

    fn handle_payload(&mut self, payload: &str) {
        match self.engine.enrich_payload(payload) {
            Ok(event) => {
                let report = self.broadcaster.broadcast(&event);
                debug!(
                    symbol = %event.symbol,
                    delivered = report.delivered,
                    dropped = report.dropped,
                    connections = self.broadcaster.len(),
                    "Event fanned out"
                );
            }
            Err(e) => {
                self.metrics.record_parse_failure();
                debug!(error = %e, "Dropping unparseable tick");
            }
        }
    }
}
