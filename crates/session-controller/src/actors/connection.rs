//! `ConnectionActor` - drives one engine connection's negotiation.
//!
//! Each `ConnectionActor`:
//! - Owns the event channel of exactly one [`EngineConnection`]
//! - Translates engine events into signaling messages on the caller's stream
//! - For a restored (migrated) connection, suppresses the local answer and
//!   replays the buffered remote candidates once the first local candidate
//!   shows up
//! - Opens the publisher's readiness gate, or starts the keyframe request for
//!   a subscriber, when the connection becomes READY
//!
//! # Lifecycle
//!
//! 1. Spawned by the session controller right after the engine object is
//!    created; `initializing` is queued on the stream before the task runs
//! 2. Runs until the engine drops its event sender or the token is cancelled
//! 3. Publisher tokens are children of the controller's root token and parents
//!    of their subscribers' tokens

use crate::engine::{ConnectionState, EngineConnection, EngineEvent, FanOut};
use crate::keyframe::{spawn_keyframe_request, ReadinessGate};
use crate::observability;

use common::signaling::{SignalingContext, SignalingMessage, SignalingSink};
use common::types::{PublisherId, SubscriberId};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

/// What the connection is for.
pub(crate) enum ConnectionRole {
    Publisher {
        ready: ReadinessGate,
    },
    Subscriber {
        subscriber_id: SubscriberId,
        fan_out: Arc<dyn FanOut>,
        publisher_ready: watch::Receiver<bool>,
    },
}

impl ConnectionRole {
    const fn label(&self) -> &'static str {
        match self {
            ConnectionRole::Publisher { .. } => "publisher",
            ConnectionRole::Subscriber { .. } => "subscriber",
        }
    }
}

pub(crate) struct ConnectionActor {
    publisher_id: PublisherId,
    role: ConnectionRole,
    connection: Arc<dyn EngineConnection>,
    events: mpsc::UnboundedReceiver<EngineEvent>,
    sink: SignalingSink,
    /// Present only for connections rebuilt from a migration.
    restored: Option<SignalingContext>,
    cancel_token: CancellationToken,
    /// Set once the caller dropped its stream.
    sink_closed: bool,
    keyframe_requested: bool,
}

impl ConnectionActor {
    /// Start negotiation on `connection` and spawn its driver.
    ///
    /// With a `restored` context the remote SDP and SRTP material are applied
    /// before the task starts, so the engine never waits for a fresh offer.
    pub(crate) fn spawn(
        publisher_id: PublisherId,
        role: ConnectionRole,
        connection: Arc<dyn EngineConnection>,
        sink: SignalingSink,
        mut restored: Option<SignalingContext>,
        cancel_token: CancellationToken,
    ) -> JoinHandle<()> {
        let (events_tx, events) = mpsc::unbounded_channel();
        connection.init(events_tx);

        if let Some(context) = &mut restored {
            // Replay is per connection; a flag set on the previous worker does not carry over.
            context.candidates_replayed = false;

            if let Some(sdp) = &context.remote_sdp {
                connection.set_remote_sdp(sdp);
            }
            if let Some(session) = &context.srtp_session {
                connection.set_srtp_session(session);
            }
        }

        // Fresh channel with spare capacity; this cannot fail unless the
        // caller already dropped the stream.
        let _ = sink.try_send(SignalingMessage::Initializing);

        let actor = Self {
            publisher_id,
            role,
            connection,
            events,
            sink,
            restored,
            cancel_token,
            sink_closed: false,
            keyframe_requested: false,
        };

        tokio::spawn(actor.run())
    }

    #[instrument(
        skip_all,
        name = "sfu.session.connection",
        fields(publisher_id = %self.publisher_id, role = self.role.label())
    )]
    async fn run(mut self) {
        debug!(
            target: "sfu.session.connection",
            publisher_id = %self.publisher_id,
            role = self.role.label(),
            restored = self.restored.is_some(),
            "ConnectionActor started"
        );

        loop {
            tokio::select! {
                () = self.cancel_token.cancelled() => {
                    debug!(
                        target: "sfu.session.connection",
                        publisher_id = %self.publisher_id,
                        "ConnectionActor received cancellation signal"
                    );
                    break;
                }

                event = self.events.recv() => {
                    match event {
                        Some(event) => self.handle_event(event).await,
                        None => {
                            debug!(
                                target: "sfu.session.connection",
                                publisher_id = %self.publisher_id,
                                "Engine closed event channel, exiting"
                            );
                            break;
                        }
                    }
                }
            }
        }
    }

    async fn handle_event(&mut self, event: EngineEvent) {
        observability::record_connection_event(self.role.label(), event.as_str());

        match event {
            EngineEvent::State(ConnectionState::Initial) => {
                self.emit(SignalingMessage::Started).await;
            }

            EngineEvent::SdpReady(sdp) => {
                if self.restored.is_some() {
                    debug!(
                        target: "sfu.session.connection",
                        publisher_id = %self.publisher_id,
                        "Suppressing answer for restored connection"
                    );
                } else {
                    self.emit(SignalingMessage::Answer { sdp }).await;
                }
            }

            EngineEvent::Candidate(candidate) => {
                self.emit(SignalingMessage::Candidate { candidate }).await;
                self.replay_candidates();
            }

            EngineEvent::State(ConnectionState::Ready) => self.on_ready(),

            EngineEvent::State(ConnectionState::Failed) => {
                warn!(
                    target: "sfu.session.connection",
                    publisher_id = %self.publisher_id,
                    role = self.role.label(),
                    "Connection failed"
                );
            }

            EngineEvent::State(state @ (ConnectionState::Started | ConnectionState::Finished)) => {
                debug!(
                    target: "sfu.session.connection",
                    publisher_id = %self.publisher_id,
                    state = state.as_str(),
                    "Connection state changed"
                );
            }
        }
    }

    /// Apply buffered remote candidates to a restored connection, once.
    fn replay_candidates(&mut self) {
        let Some(context) = self.restored.as_mut() else {
            return;
        };
        if context.candidates_replayed {
            return;
        }

        for candidate in &context.pending_candidates {
            self.connection.add_remote_candidate(candidate);
        }
        context.candidates_replayed = true;

        debug!(
            target: "sfu.session.connection",
            publisher_id = %self.publisher_id,
            count = context.pending_candidates.len(),
            "Replayed buffered remote candidates"
        );
        observability::record_candidates_replayed(context.pending_candidates.len());
    }

    fn on_ready(&mut self) {
        match &self.role {
            ConnectionRole::Publisher { ready } => ready.mark_ready(),
            ConnectionRole::Subscriber {
                subscriber_id,
                fan_out,
                publisher_ready,
            } => {
                if self.keyframe_requested {
                    return;
                }
                self.keyframe_requested = true;
                spawn_keyframe_request(
                    self.publisher_id.clone(),
                    subscriber_id.clone(),
                    publisher_ready.clone(),
                    Arc::clone(fan_out),
                    self.cancel_token.clone(),
                );
            }
        }
    }

    async fn emit(&mut self, message: SignalingMessage) {
        if self.sink_closed {
            return;
        }
        if self.sink.send(message).await.is_err() {
            // Negotiation keeps going; only the caller stopped listening.
            debug!(
                target: "sfu.session.connection",
                publisher_id = %self.publisher_id,
                "Signaling stream dropped by caller"
            );
            self.sink_closed = true;
        }
    }
}
