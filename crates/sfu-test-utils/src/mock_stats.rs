//! Recording stats collector.

use common::bus::{ConnectionStats, StatsCollector};
use common::error::BusError;
use std::sync::{Arc, Mutex};

/// Records every reported sample with the queue it was sent to.
#[derive(Clone, Default)]
pub struct RecordingStatsCollector {
    samples: Arc<Mutex<Vec<(String, ConnectionStats)>>>,
    fail: Arc<Mutex<bool>>,
}

impl RecordingStatsCollector {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every later `report` fail.
    pub fn fail_deliveries(&self) {
        *self.fail.lock().unwrap() = true;
    }

    #[must_use]
    pub fn samples(&self) -> Vec<(String, ConnectionStats)> {
        self.samples.lock().unwrap().clone()
    }

    #[must_use]
    pub fn as_collector(&self) -> Arc<dyn StatsCollector> {
        Arc::new(self.clone())
    }
}

#[async_trait::async_trait]
impl StatsCollector for RecordingStatsCollector {
    async fn report(&self, queue: &str, stats: ConnectionStats) -> Result<(), BusError> {
        if *self.fail.lock().unwrap() {
            return Err(BusError::Unreachable(queue.to_string()));
        }
        self.samples
            .lock()
            .unwrap()
            .push((queue.to_string(), stats));
        Ok(())
    }
}
