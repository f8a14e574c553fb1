//! Connection statistics side channel.
//!
//! When enabled, every connection's periodic engine statistics are parsed and
//! forwarded to the stats collector queue. Delivery is best effort: malformed
//! samples and failed deliveries are counted and dropped.

use crate::engine::EngineConnection;
use crate::observability;

use common::bus::{ConnectionStats, StatsCollector};
use common::types::{PublisherId, SubscriberId};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Where samples go and which connection they describe.
pub struct StatsForwarder {
    pub collector: Arc<dyn StatsCollector>,
    pub queue: String,
    pub publisher_id: PublisherId,
    pub subscriber_id: Option<SubscriberId>,
}

impl StatsForwarder {
    /// Register a listener on `connection` and forward its samples until
    /// `cancel_token` fires or the engine stops reporting.
    pub fn attach(
        self,
        connection: &dyn EngineConnection,
        cancel_token: CancellationToken,
    ) -> JoinHandle<()> {
        let (tx, rx) = mpsc::unbounded_channel();
        connection.set_stats_listener(tx);
        tokio::spawn(self.run(rx, cancel_token))
    }

    async fn run(self, mut samples: mpsc::UnboundedReceiver<String>, cancel_token: CancellationToken) {
        loop {
            tokio::select! {
                () = cancel_token.cancelled() => break,
                sample = samples.recv() => {
                    let Some(raw) = sample else { break };
                    self.forward(&raw).await;
                }
            }
        }

        debug!(
            target: "sfu.session.stats",
            publisher_id = %self.publisher_id,
            subscriber_id = ?self.subscriber_id,
            "Stats forwarder stopped"
        );
    }

    async fn forward(&self, raw: &str) {
        let stats = match serde_json::from_str::<serde_json::Value>(raw) {
            Ok(value) => value,
            Err(e) => {
                warn!(
                    target: "sfu.session.stats",
                    publisher_id = %self.publisher_id,
                    error = %e,
                    "Dropping malformed stats sample"
                );
                observability::record_stats_dropped("malformed");
                return;
            }
        };

        let sample = ConnectionStats {
            publisher_id: self.publisher_id.clone(),
            subscriber_id: self.subscriber_id.clone(),
            stats,
        };

        if let Err(e) = self.collector.report(&self.queue, sample).await {
            warn!(
                target: "sfu.session.stats",
                publisher_id = %self.publisher_id,
                queue = %self.queue,
                error = %e,
                "Failed to deliver stats sample"
            );
            observability::record_stats_dropped("delivery");
        }
    }
}
