//! Message types for the coordinator actor.

use crate::errors::RoomError;
use crate::events::EventListener;

use common::signaling::{InitStatus, SignalingContext, SignalingMessage, SignalingStream};
use common::types::{PublisherId, SubscriberId, WorkerId};
use serde::Serialize;
use tokio::sync::oneshot;

/// Media a subscriber wants from its publisher. Both default to on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscribeOptions {
    pub audio: bool,
    pub video: bool,
}

impl Default for SubscribeOptions {
    fn default() -> Self {
        Self {
            audio: true,
            video: true,
        }
    }
}

/// Messages sent to `Coordinator`.
pub enum CoordinatorMessage {
    AddPublisher {
        publisher_id: PublisherId,
        respond_to: oneshot::Sender<Result<Option<SignalingStream>, RoomError>>,
    },

    AddExternalInput {
        publisher_id: PublisherId,
        url: String,
        respond_to: oneshot::Sender<Result<Option<InitStatus>, RoomError>>,
    },

    AddExternalOutput {
        publisher_id: PublisherId,
        url: String,
        respond_to: oneshot::Sender<Result<(), RoomError>>,
    },

    RemoveExternalOutput {
        url: String,
        respond_to: oneshot::Sender<Result<(), RoomError>>,
    },

    AddSubscriber {
        subscriber_id: SubscriberId,
        publisher_id: PublisherId,
        options: SubscribeOptions,
        respond_to: oneshot::Sender<Result<Option<SignalingStream>, RoomError>>,
    },

    RemovePublisher {
        publisher_id: PublisherId,
    },

    RemoveSubscriber {
        subscriber_id: SubscriberId,
        publisher_id: PublisherId,
    },

    RemoveSubscriptions {
        subscriber_id: SubscriberId,
    },

    ProcessSignaling {
        stream_id: PublisherId,
        peer_id: Option<SubscriberId>,
        message: SignalingMessage,
    },

    MovePublisher {
        publisher_id: PublisherId,
        respond_to: oneshot::Sender<Result<Option<SignalingStream>, RoomError>>,
    },

    AddEventListener {
        listener: EventListener,
    },

    GetState {
        respond_to: oneshot::Sender<RoomState>,
    },
}

/// Snapshot of a room's registries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomState {
    pub room_id: String,
    /// Sorted by publisher id.
    pub publishers: Vec<PublisherInfo>,
    /// `(url, publisher)` pairs, sorted by URL.
    pub external_outputs: Vec<(String, PublisherId)>,
    /// Workers with an open outbox, sorted.
    pub workers: Vec<WorkerId>,
    /// Workers whose outbox has fallen behind, sorted.
    pub backlogged_workers: Vec<WorkerId>,
    pub event_listeners: usize,
}

impl RoomState {
    #[must_use]
    pub fn publisher(&self, publisher_id: &PublisherId) -> Option<&PublisherInfo> {
        self.publishers.iter().find(|p| &p.publisher_id == publisher_id)
    }

    /// Worker currently hosting `publisher_id`, if any.
    #[must_use]
    pub fn worker_of(&self, publisher_id: &PublisherId) -> Option<&WorkerId> {
        self.publisher(publisher_id)
            .and_then(|p| p.worker_id.as_ref())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PublisherInfo {
    pub publisher_id: PublisherId,
    /// `None` while the worker is being created or after it failed.
    pub worker_id: Option<WorkerId>,
    /// Worker creation is still in flight.
    pub pending: bool,
    pub migrating: bool,
    /// Sorted.
    pub subscribers: Vec<SubscriberId>,
    pub context: SignalingContext,
}
