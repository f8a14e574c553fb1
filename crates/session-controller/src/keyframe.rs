//! Keyframe request timing for new subscribers.
//!
//! A subscriber that joins mid-stream cannot decode anything until the
//! publisher sends an intra frame. Once both the subscriber connection and
//! its publisher are READY, exactly one FIR is sent through the publisher's
//! fan-out. Readiness of the publisher is published through a
//! [`ReadinessGate`]; the subscriber side waits on it and gives up if the
//! subscriber is removed first.

use crate::engine::FanOut;
use crate::observability;

use common::types::{PublisherId, SubscriberId};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Publisher readiness flag shared between the publisher's connection actor
/// (which opens it) and waiting subscribers.
#[derive(Debug, Clone)]
pub struct ReadinessGate {
    sender: Arc<watch::Sender<bool>>,
}

impl ReadinessGate {
    #[must_use]
    pub fn new() -> Self {
        let (sender, _) = watch::channel(false);
        Self {
            sender: Arc::new(sender),
        }
    }

    /// Open the gate. Idempotent.
    pub fn mark_ready(&self) {
        self.sender.send_replace(true);
    }

    #[must_use]
    pub fn is_ready(&self) -> bool {
        *self.sender.borrow()
    }

    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.sender.subscribe()
    }
}

impl Default for ReadinessGate {
    fn default() -> Self {
        Self::new()
    }
}

/// Outcome of a keyframe wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyframeOutcome {
    Sent,
    Cancelled,
    /// The publisher went away before becoming ready.
    PublisherGone,
}

/// Spawn the wait for `publisher_ready`, then send one FIR.
///
/// Call once the subscriber connection itself is READY.
pub fn spawn_keyframe_request(
    publisher_id: PublisherId,
    subscriber_id: SubscriberId,
    mut publisher_ready: watch::Receiver<bool>,
    fan_out: Arc<dyn FanOut>,
    cancel_token: CancellationToken,
) -> JoinHandle<KeyframeOutcome> {
    tokio::spawn(async move {
        let outcome = tokio::select! {
            biased;
            () = cancel_token.cancelled() => KeyframeOutcome::Cancelled,
            ready = publisher_ready.wait_for(|ready| *ready) => match ready {
                Ok(_) => KeyframeOutcome::Sent,
                Err(_) => KeyframeOutcome::PublisherGone,
            },
        };

        match outcome {
            KeyframeOutcome::Sent => {
                info!(
                    target: "sfu.session.keyframe",
                    publisher_id = %publisher_id,
                    subscriber_id = %subscriber_id,
                    "Sending FIR"
                );
                fan_out.send_fir();
                observability::record_keyframe_request();
            }
            KeyframeOutcome::Cancelled | KeyframeOutcome::PublisherGone => {
                debug!(
                    target: "sfu.session.keyframe",
                    publisher_id = %publisher_id,
                    subscriber_id = %subscriber_id,
                    outcome = ?outcome,
                    "Keyframe request abandoned"
                );
            }
        }

        outcome
    })
}
