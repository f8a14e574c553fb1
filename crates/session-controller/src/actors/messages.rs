//! Message types for the session controller actor.
//!
//! One variant per worker RPC. Calls the coordinator treats as
//! fire-and-forget carry no reply channel.

use crate::engine::ConnectionState;

use common::signaling::{InitStatus, SignalingContext, SignalingMessage, SignalingStream, SrtpSession};
use common::types::{PublisherId, SubscriberId};
use tokio::sync::oneshot;

/// Messages sent to `SessionController`.
#[derive(Debug)]
pub enum SessionMessage {
    KeepAlive {
        respond_to: oneshot::Sender<bool>,
    },

    /// Create a WebRTC publisher; `None` if the id is already in use.
    AddPublisher {
        publisher_id: PublisherId,
        respond_to: oneshot::Sender<Option<SignalingStream>>,
    },

    /// Create a publisher fed from a URL; `None` if the id is already in use.
    AddExternalInput {
        publisher_id: PublisherId,
        url: String,
        respond_to: oneshot::Sender<Option<InitStatus>>,
    },

    AddExternalOutput {
        publisher_id: PublisherId,
        url: String,
    },

    RemoveExternalOutput {
        publisher_id: PublisherId,
        url: String,
    },

    /// Rebuild a publisher migrated from another worker.
    MovePublisher {
        publisher_id: PublisherId,
        context: SignalingContext,
        respond_to: oneshot::Sender<Option<SignalingStream>>,
    },

    AddSubscriber {
        subscriber_id: SubscriberId,
        publisher_id: PublisherId,
        audio: bool,
        video: bool,
        respond_to: oneshot::Sender<Option<SignalingStream>>,
    },

    ProcessSignaling {
        stream_id: PublisherId,
        peer_id: Option<SubscriberId>,
        message: SignalingMessage,
    },

    GetSrtpSession {
        stream_id: PublisherId,
        peer_id: Option<SubscriberId>,
        respond_to: oneshot::Sender<Option<SrtpSession>>,
    },

    SetSrtpSession {
        stream_id: PublisherId,
        peer_id: Option<SubscriberId>,
        session: SrtpSession,
    },

    RemovePublisher {
        publisher_id: PublisherId,
    },

    RemoveSubscriber {
        subscriber_id: SubscriberId,
        publisher_id: PublisherId,
    },

    /// Remove `subscriber_id` from every publisher it is attached to.
    RemoveSubscriptions {
        subscriber_id: SubscriberId,
    },

    GetStatus {
        respond_to: oneshot::Sender<WorkerStatus>,
    },
}

/// Snapshot of a session controller's registries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerStatus {
    pub worker_id: String,
    /// Sorted by publisher id.
    pub publishers: Vec<PublisherStatus>,
    /// Sorted URLs of attached external outputs.
    pub external_outputs: Vec<String>,
}

impl WorkerStatus {
    #[must_use]
    pub fn publisher(&self, publisher_id: &PublisherId) -> Option<&PublisherStatus> {
        self.publishers.iter().find(|p| &p.publisher_id == publisher_id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublisherStatus {
    pub publisher_id: PublisherId,
    /// Fed from an external input rather than a WebRTC connection.
    pub external: bool,
    /// Rebuilt from a migration context.
    pub restored: bool,
    /// The publisher reached READY (keyframe requests may flow).
    pub ready: bool,
    /// State reported by the fan-out for its publisher.
    pub state: ConnectionState,
    /// Sorted by subscriber id.
    pub subscribers: Vec<SubscriberStatus>,
    /// Unix timestamp of creation.
    pub created_at: i64,
}

impl PublisherStatus {
    #[must_use]
    pub fn subscriber_ids(&self) -> Vec<SubscriberId> {
        self.subscribers.iter().map(|s| s.subscriber_id.clone()).collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriberStatus {
    pub subscriber_id: SubscriberId,
    pub audio: bool,
    pub video: bool,
    pub state: ConnectionState,
}
