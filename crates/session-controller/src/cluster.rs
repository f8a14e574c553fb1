//! In-process worker cluster.
//!
//! `LocalCluster` plays both the Worker Process Manager and the Message Bus:
//! `create_worker` spawns a [`SessionController`] task, and every
//! [`WorkerClient`] call is delivered straight to that worker's handle. It
//! backs single-process deployments and the end-to-end tests.
//!
//! A worker stops on its own when its last publisher is removed. Calls to a
//! stopped worker fail with [`BusError::Unreachable`]; deleting it afterwards
//! still succeeds.

use crate::actors::{SessionController, SessionControllerHandle};
use crate::config::Config;
use crate::engine::MediaEngine;
use crate::errors::WorkerError;

use common::bus::{StatsCollector, WorkerAgent, WorkerClient};
use common::error::BusError;
use common::signaling::{InitStatus, SignalingContext, SignalingMessage, SignalingStream, SrtpSession};
use common::types::{PublisherId, SubscriberId, WorkerId};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info};

pub struct LocalCluster {
    /// Template for spawned workers; `worker_id` is replaced per worker.
    config: Config,
    engine: Arc<dyn MediaEngine>,
    stats: Option<Arc<dyn StatsCollector>>,
    workers: RwLock<HashMap<WorkerId, SessionControllerHandle>>,
}

impl LocalCluster {
    #[must_use]
    pub fn new(
        config: Config,
        engine: Arc<dyn MediaEngine>,
        stats: Option<Arc<dyn StatsCollector>>,
    ) -> Self {
        Self {
            config,
            engine,
            stats,
            workers: RwLock::new(HashMap::new()),
        }
    }

    /// Handle of a registered worker, running or not.
    pub async fn worker(&self, worker_id: &WorkerId) -> Option<SessionControllerHandle> {
        self.workers.read().await.get(worker_id).cloned()
    }

    /// Ids of workers that are still running, sorted.
    pub async fn running_workers(&self) -> Vec<WorkerId> {
        let mut ids: Vec<WorkerId> = self
            .workers
            .read()
            .await
            .iter()
            .filter(|(_, handle)| !handle.is_cancelled())
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }

    async fn handle(&self, worker_id: &WorkerId) -> Result<SessionControllerHandle, BusError> {
        self.worker(worker_id)
            .await
            .ok_or_else(|| BusError::Unreachable(worker_id.queue_name()))
    }
}

fn bus_unreachable(worker_id: &WorkerId) -> impl FnOnce(WorkerError) -> BusError + '_ {
    move |e| BusError::Unreachable(format!("{}: {e}", worker_id.queue_name()))
}

#[async_trait::async_trait]
impl WorkerAgent for LocalCluster {
    async fn create_worker(&self, publisher_id: &PublisherId) -> Result<WorkerId, BusError> {
        let worker_id = WorkerId::new(uuid::Uuid::new_v4().to_string());
        let config = Config {
            worker_id: worker_id.to_string(),
            ..self.config.clone()
        };

        let (handle, _task) =
            SessionController::spawn(config, Arc::clone(&self.engine), self.stats.clone());

        let mut workers = self.workers.write().await;
        workers.retain(|_, existing| !existing.is_cancelled());
        workers.insert(worker_id.clone(), handle);

        info!(
            target: "sfu.cluster.local",
            worker_id = %worker_id,
            publisher_id = %publisher_id,
            running = workers.len(),
            "Worker created"
        );

        Ok(worker_id)
    }

    async fn delete_worker(&self, worker_id: &WorkerId) -> Result<(), BusError> {
        match self.workers.write().await.remove(worker_id) {
            Some(handle) => {
                let already_exited = handle.is_cancelled();
                handle.cancel();
                info!(
                    target: "sfu.cluster.local",
                    worker_id = %worker_id,
                    already_exited,
                    "Worker deleted"
                );
            }
            None => {
                debug!(
                    target: "sfu.cluster.local",
                    worker_id = %worker_id,
                    "Delete for unknown worker, nothing to do"
                );
            }
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl WorkerClient for LocalCluster {
    async fn keep_alive(&self, worker_id: &WorkerId) -> Result<bool, BusError> {
        self.handle(worker_id)
            .await?
            .keep_alive()
            .await
            .map_err(bus_unreachable(worker_id))
    }

    async fn add_publisher(
        &self,
        worker_id: &WorkerId,
        publisher_id: &PublisherId,
    ) -> Result<Option<SignalingStream>, BusError> {
        self.handle(worker_id)
            .await?
            .add_publisher(publisher_id.clone())
            .await
            .map_err(bus_unreachable(worker_id))
    }

    async fn add_external_input(
        &self,
        worker_id: &WorkerId,
        publisher_id: &PublisherId,
        url: &str,
    ) -> Result<Option<InitStatus>, BusError> {
        self.handle(worker_id)
            .await?
            .add_external_input(publisher_id.clone(), url.to_string())
            .await
            .map_err(bus_unreachable(worker_id))
    }

    async fn add_external_output(
        &self,
        worker_id: &WorkerId,
        publisher_id: &PublisherId,
        url: &str,
    ) -> Result<(), BusError> {
        self.handle(worker_id)
            .await?
            .add_external_output(publisher_id.clone(), url.to_string())
            .await
            .map_err(bus_unreachable(worker_id))
    }

    async fn remove_external_output(
        &self,
        worker_id: &WorkerId,
        publisher_id: &PublisherId,
        url: &str,
    ) -> Result<(), BusError> {
        self.handle(worker_id)
            .await?
            .remove_external_output(publisher_id.clone(), url.to_string())
            .await
            .map_err(bus_unreachable(worker_id))
    }

    async fn get_srtp_session(
        &self,
        worker_id: &WorkerId,
        publisher_id: &PublisherId,
        peer_id: Option<&SubscriberId>,
    ) -> Result<Option<SrtpSession>, BusError> {
        self.handle(worker_id)
            .await?
            .get_srtp_session(publisher_id.clone(), peer_id.cloned())
            .await
            .map_err(bus_unreachable(worker_id))
    }

    async fn move_publisher(
        &self,
        worker_id: &WorkerId,
        publisher_id: &PublisherId,
        context: SignalingContext,
    ) -> Result<Option<SignalingStream>, BusError> {
        self.handle(worker_id)
            .await?
            .move_publisher(publisher_id.clone(), context)
            .await
            .map_err(bus_unreachable(worker_id))
    }

    async fn add_subscriber(
        &self,
        worker_id: &WorkerId,
        subscriber_id: &SubscriberId,
        publisher_id: &PublisherId,
        audio: bool,
        video: bool,
    ) -> Result<Option<SignalingStream>, BusError> {
        self.handle(worker_id)
            .await?
            .add_subscriber(subscriber_id.clone(), publisher_id.clone(), audio, video)
            .await
            .map_err(bus_unreachable(worker_id))
    }

    async fn process_signaling(
        &self,
        worker_id: &WorkerId,
        stream_id: &PublisherId,
        peer_id: Option<&SubscriberId>,
        message: SignalingMessage,
    ) -> Result<(), BusError> {
        self.handle(worker_id)
            .await?
            .process_signaling(stream_id.clone(), peer_id.cloned(), message)
            .await
            .map_err(bus_unreachable(worker_id))
    }

    async fn remove_publisher(
        &self,
        worker_id: &WorkerId,
        publisher_id: &PublisherId,
    ) -> Result<(), BusError> {
        self.handle(worker_id)
            .await?
            .remove_publisher(publisher_id.clone())
            .await
            .map_err(bus_unreachable(worker_id))
    }

    async fn remove_subscriber(
        &self,
        worker_id: &WorkerId,
        subscriber_id: &SubscriberId,
        publisher_id: &PublisherId,
    ) -> Result<(), BusError> {
        self.handle(worker_id)
            .await?
            .remove_subscriber(subscriber_id.clone(), publisher_id.clone())
            .await
            .map_err(bus_unreachable(worker_id))
    }
}
