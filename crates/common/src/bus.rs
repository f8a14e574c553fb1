//! Collaborator boundaries of the control plane.
//!
//! The coordinator never talks to a worker process directly. Every call goes
//! through one of these traits, which a deployment backs with its Message Bus
//! and Worker Process Manager. `session_controller::LocalCluster` backs all of
//! them in-process.
//!
//! # Architecture
//!
//! ```text
//! Coordinator
//!     |-- WorkerAgent   (createWorker / deleteWorker, queue "WorkerAgent")
//!     `-- WorkerClient  (one queue per worker, "SessionController_<id>")
//!             `-- Session Controller
//!                     `-- StatsCollector (optional side channel)
//! ```

use crate::error::BusError;
use crate::signaling::{InitStatus, SignalingContext, SignalingMessage, SignalingStream, SrtpSession};
use crate::types::{PublisherId, SubscriberId, WorkerId};
use serde::{Deserialize, Serialize};

/// Worker Process Manager operations.
#[async_trait::async_trait]
pub trait WorkerAgent: Send + Sync {
    /// Start a worker for `publisher_id` and return its id.
    async fn create_worker(&self, publisher_id: &PublisherId) -> Result<WorkerId, BusError>;

    /// Stop a worker. Stopping a worker that already exited succeeds.
    async fn delete_worker(&self, worker_id: &WorkerId) -> Result<(), BusError>;
}

/// Calls the coordinator issues against a worker's queue.
///
/// Methods returning `Option` yield `None` when the worker ignored the call
/// (duplicate or unknown id).
#[async_trait::async_trait]
pub trait WorkerClient: Send + Sync {
    /// Liveness probe.
    async fn keep_alive(&self, worker_id: &WorkerId) -> Result<bool, BusError>;

    async fn add_publisher(
        &self,
        worker_id: &WorkerId,
        publisher_id: &PublisherId,
    ) -> Result<Option<SignalingStream>, BusError>;

    async fn add_external_input(
        &self,
        worker_id: &WorkerId,
        publisher_id: &PublisherId,
        url: &str,
    ) -> Result<Option<InitStatus>, BusError>;

    async fn add_external_output(
        &self,
        worker_id: &WorkerId,
        publisher_id: &PublisherId,
        url: &str,
    ) -> Result<(), BusError>;

    async fn remove_external_output(
        &self,
        worker_id: &WorkerId,
        publisher_id: &PublisherId,
        url: &str,
    ) -> Result<(), BusError>;

    /// Read SRTP material of a publisher connection, or of one of its
    /// subscriber connections when `peer_id` is given.
    async fn get_srtp_session(
        &self,
        worker_id: &WorkerId,
        publisher_id: &PublisherId,
        peer_id: Option<&SubscriberId>,
    ) -> Result<Option<SrtpSession>, BusError>;

    /// Rebuild a publisher from a migration context.
    async fn move_publisher(
        &self,
        worker_id: &WorkerId,
        publisher_id: &PublisherId,
        context: SignalingContext,
    ) -> Result<Option<SignalingStream>, BusError>;

    async fn add_subscriber(
        &self,
        worker_id: &WorkerId,
        subscriber_id: &SubscriberId,
        publisher_id: &PublisherId,
        audio: bool,
        video: bool,
    ) -> Result<Option<SignalingStream>, BusError>;

    async fn process_signaling(
        &self,
        worker_id: &WorkerId,
        stream_id: &PublisherId,
        peer_id: Option<&SubscriberId>,
        message: SignalingMessage,
    ) -> Result<(), BusError>;

    async fn remove_publisher(
        &self,
        worker_id: &WorkerId,
        publisher_id: &PublisherId,
    ) -> Result<(), BusError>;

    async fn remove_subscriber(
        &self,
        worker_id: &WorkerId,
        subscriber_id: &SubscriberId,
        publisher_id: &PublisherId,
    ) -> Result<(), BusError>;
}

/// One statistics sample of a connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionStats {
    /// Publisher the connection belongs to.
    #[serde(rename = "pub")]
    pub publisher_id: PublisherId,
    /// Subscriber owning the connection, absent for the publisher's own.
    #[serde(rename = "subs", skip_serializing_if = "Option::is_none", default)]
    pub subscriber_id: Option<SubscriberId>,
    /// Engine-provided statistics document.
    pub stats: serde_json::Value,
}

/// Receiver of the optional statistics side channel.
#[async_trait::async_trait]
pub trait StatsCollector: Send + Sync {
    /// Deliver one sample to `queue`.
    async fn report(&self, queue: &str, stats: ConnectionStats) -> Result<(), BusError>;
}
