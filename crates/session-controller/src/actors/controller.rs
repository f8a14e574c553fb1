//! `SessionController` - per-worker owner of connections and fan-outs.
//!
//! The `SessionController` is the only actor in a worker process:
//!
//! - Owns the publisher, subscriber and external-output registries
//! - Creates engine objects and spawns one `ConnectionActor` per connection
//! - Rebuilds migrated publishers from a `SignalingContext`
//! - Owns the root `CancellationToken`; publisher tokens are its children and
//!   subscriber tokens are children of their publisher's
//!
//! # Termination
//!
//! When `removePublisher` leaves the registry empty the controller cancels
//! its root token and stops. Any later call on the handle fails with
//! [`WorkerError::Exited`], which the coordinator observes as a dead worker.

use crate::config::Config;
use crate::engine::{
    ConnectionOptions, EngineConnection, ExternalInput, ExternalOutput, FanOut, MediaEngine,
};
use crate::errors::WorkerError;
use crate::keyframe::ReadinessGate;
use crate::observability;
use crate::stats::StatsForwarder;

use super::connection::{ConnectionActor, ConnectionRole};
use super::messages::{PublisherStatus, SessionMessage, SubscriberStatus, WorkerStatus};

use common::bus::StatsCollector;
use common::mailbox::{ActorType, MailboxMonitor};
use common::signaling::{
    signaling_channel, InitStatus, SignalingContext, SignalingMessage, SignalingStream, SrtpSession,
};
use common::types::{PublisherId, SubscriberId};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Default channel buffer size for the session controller mailbox.
const SESSION_CHANNEL_BUFFER: usize = 500;

/// Handle to a `SessionController`.
#[derive(Clone, Debug)]
pub struct SessionControllerHandle {
    sender: mpsc::Sender<SessionMessage>,
    cancel_token: CancellationToken,
    worker_id: String,
    mailbox: Arc<MailboxMonitor>,
}

impl SessionControllerHandle {
    #[must_use]
    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    async fn send(&self, message: SessionMessage) -> Result<(), WorkerError> {
        if self.cancel_token.is_cancelled() {
            return Err(WorkerError::Exited);
        }
        self.mailbox.record_enqueue();
        self.sender.send(message).await.map_err(|e| {
            self.mailbox.record_send_failed();
            WorkerError::Internal(format!("channel send failed: {e}"))
        })
    }

    async fn receive<T>(&self, rx: oneshot::Receiver<T>) -> Result<T, WorkerError> {
        match rx.await {
            Ok(value) => Ok(value),
            Err(_) if self.cancel_token.is_cancelled() => Err(WorkerError::Exited),
            Err(e) => Err(WorkerError::Internal(format!("response receive failed: {e}"))),
        }
    }

    /// Liveness probe; `true` while the controller is running.
    pub async fn keep_alive(&self) -> Result<bool, WorkerError> {
        let (tx, rx) = oneshot::channel();
        self.send(SessionMessage::KeepAlive { respond_to: tx }).await?;
        self.receive(rx).await
    }

    /// Add a WebRTC publisher. `None` if the id is already in use.
    pub async fn add_publisher(
        &self,
        publisher_id: PublisherId,
    ) -> Result<Option<SignalingStream>, WorkerError> {
        let (tx, rx) = oneshot::channel();
        self.send(SessionMessage::AddPublisher {
            publisher_id,
            respond_to: tx,
        })
        .await?;
        self.receive(rx).await
    }

    /// Add a publisher fed from `url`. `None` if the id is already in use.
    pub async fn add_external_input(
        &self,
        publisher_id: PublisherId,
        url: String,
    ) -> Result<Option<InitStatus>, WorkerError> {
        let (tx, rx) = oneshot::channel();
        self.send(SessionMessage::AddExternalInput {
            publisher_id,
            url,
            respond_to: tx,
        })
        .await?;
        self.receive(rx).await
    }

    pub async fn add_external_output(
        &self,
        publisher_id: PublisherId,
        url: String,
    ) -> Result<(), WorkerError> {
        self.send(SessionMessage::AddExternalOutput { publisher_id, url })
            .await
    }

    pub async fn remove_external_output(
        &self,
        publisher_id: PublisherId,
        url: String,
    ) -> Result<(), WorkerError> {
        self.send(SessionMessage::RemoveExternalOutput { publisher_id, url })
            .await
    }

    /// Rebuild a migrated publisher. `None` if the id is already in use.
    pub async fn move_publisher(
        &self,
        publisher_id: PublisherId,
        context: SignalingContext,
    ) -> Result<Option<SignalingStream>, WorkerError> {
        let (tx, rx) = oneshot::channel();
        self.send(SessionMessage::MovePublisher {
            publisher_id,
            context,
            respond_to: tx,
        })
        .await?;
        self.receive(rx).await
    }

    /// Attach a subscriber. `None` if the publisher is unknown or the pair
    /// already exists.
    pub async fn add_subscriber(
        &self,
        subscriber_id: SubscriberId,
        publisher_id: PublisherId,
        audio: bool,
        video: bool,
    ) -> Result<Option<SignalingStream>, WorkerError> {
        let (tx, rx) = oneshot::channel();
        self.send(SessionMessage::AddSubscriber {
            subscriber_id,
            publisher_id,
            audio,
            video,
            respond_to: tx,
        })
        .await?;
        self.receive(rx).await
    }

    pub async fn process_signaling(
        &self,
        stream_id: PublisherId,
        peer_id: Option<SubscriberId>,
        message: SignalingMessage,
    ) -> Result<(), WorkerError> {
        self.send(SessionMessage::ProcessSignaling {
            stream_id,
            peer_id,
            message,
        })
        .await
    }

    pub async fn get_srtp_session(
        &self,
        stream_id: PublisherId,
        peer_id: Option<SubscriberId>,
    ) -> Result<Option<SrtpSession>, WorkerError> {
        let (tx, rx) = oneshot::channel();
        self.send(SessionMessage::GetSrtpSession {
            stream_id,
            peer_id,
            respond_to: tx,
        })
        .await?;
        self.receive(rx).await
    }

    pub async fn set_srtp_session(
        &self,
        stream_id: PublisherId,
        peer_id: Option<SubscriberId>,
        session: SrtpSession,
    ) -> Result<(), WorkerError> {
        self.send(SessionMessage::SetSrtpSession {
            stream_id,
            peer_id,
            session,
        })
        .await
    }

    pub async fn remove_publisher(&self, publisher_id: PublisherId) -> Result<(), WorkerError> {
        self.send(SessionMessage::RemovePublisher { publisher_id })
            .await
    }

    pub async fn remove_subscriber(
        &self,
        subscriber_id: SubscriberId,
        publisher_id: PublisherId,
    ) -> Result<(), WorkerError> {
        self.send(SessionMessage::RemoveSubscriber {
            subscriber_id,
            publisher_id,
        })
        .await
    }

    pub async fn remove_subscriptions(&self, subscriber_id: SubscriberId) -> Result<(), WorkerError> {
        self.send(SessionMessage::RemoveSubscriptions { subscriber_id })
            .await
    }

    pub async fn get_status(&self) -> Result<WorkerStatus, WorkerError> {
        let (tx, rx) = oneshot::channel();
        self.send(SessionMessage::GetStatus { respond_to: tx }).await?;
        self.receive(rx).await
    }

    /// Stop the controller and every connection actor it owns.
    pub fn cancel(&self) {
        self.cancel_token.cancel();
    }

    /// `true` once the controller stopped or is stopping.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel_token.is_cancelled()
    }

    /// Resolves once the controller stops.
    pub async fn cancelled(&self) {
        self.cancel_token.cancelled().await;
    }

    /// Messages sent to the controller and not yet handled.
    #[must_use]
    pub fn queued_messages(&self) -> usize {
        self.mailbox.queued()
    }
}

/// Media source of a publisher.
enum PublisherSource {
    WebRtc(Arc<dyn EngineConnection>),
    External(Arc<dyn ExternalInput>),
}

struct PublisherEntry {
    source: PublisherSource,
    fan_out: Arc<dyn FanOut>,
    ready: ReadinessGate,
    restored: bool,
    cancel_token: CancellationToken,
    subscribers: HashMap<SubscriberId, SubscriberEntry>,
    created_at: i64,
}

struct SubscriberEntry {
    connection: Arc<dyn EngineConnection>,
    cancel_token: CancellationToken,
    audio: bool,
    video: bool,
}

struct ExternalOutputEntry {
    publisher_id: PublisherId,
    /// Kept alive for as long as it is attached.
    _output: Arc<dyn ExternalOutput>,
}

/// The `SessionController` implementation.
pub struct SessionController {
    worker_id: String,
    config: Config,
    engine: Arc<dyn MediaEngine>,
    stats: Option<Arc<dyn StatsCollector>>,
    receiver: mpsc::Receiver<SessionMessage>,
    cancel_token: CancellationToken,
    publishers: HashMap<PublisherId, PublisherEntry>,
    external_outputs: HashMap<String, ExternalOutputEntry>,
    mailbox: Arc<MailboxMonitor>,
}

impl SessionController {
    /// Spawn a controller for `config.worker_id`.
    ///
    /// `stats` is only used when `config.send_stats` is set.
    #[must_use]
    pub fn spawn(
        config: Config,
        engine: Arc<dyn MediaEngine>,
        stats: Option<Arc<dyn StatsCollector>>,
    ) -> (SessionControllerHandle, JoinHandle<()>) {
        let (sender, receiver) = mpsc::channel(SESSION_CHANNEL_BUFFER);
        let cancel_token = CancellationToken::new();
        let worker_id = config.worker_id.clone();
        let mailbox = Arc::new(MailboxMonitor::new(ActorType::Session, &worker_id));

        let actor = Self {
            worker_id: worker_id.clone(),
            config,
            engine,
            stats,
            receiver,
            cancel_token: cancel_token.clone(),
            publishers: HashMap::new(),
            external_outputs: HashMap::new(),
            mailbox: Arc::clone(&mailbox),
        };

        let task_handle = tokio::spawn(actor.run());

        let handle = SessionControllerHandle {
            sender,
            cancel_token,
            worker_id,
            mailbox,
        };

        (handle, task_handle)
    }

    #[instrument(skip_all, name = "sfu.session.controller", fields(worker_id = %self.worker_id))]
    async fn run(mut self) {
        info!(
            target: "sfu.session.controller",
            worker_id = %self.worker_id,
            "SessionController started"
        );

        loop {
            tokio::select! {
                () = self.cancel_token.cancelled() => {
                    info!(
                        target: "sfu.session.controller",
                        worker_id = %self.worker_id,
                        "SessionController received cancellation signal"
                    );
                    break;
                }

                msg = self.receiver.recv() => {
                    match msg {
                        Some(message) => {
                            let should_exit = self.handle_message(message);
                            self.mailbox.record_dequeue();

                            if should_exit {
                                self.cancel_token.cancel();
                                break;
                            }
                        }
                        None => {
                            info!(
                                target: "sfu.session.controller",
                                worker_id = %self.worker_id,
                                "SessionController channel closed, exiting"
                            );
                            self.cancel_token.cancel();
                            break;
                        }
                    }
                }
            }
        }

        for (_, entry) in self.publishers.drain() {
            entry.fan_out.close();
        }
        observability::set_publishers_active(0);
        observability::set_subscribers_active(0);

        info!(
            target: "sfu.session.controller",
            worker_id = %self.worker_id,
            messages_processed = self.mailbox.messages_processed(),
            "SessionController stopped"
        );
    }

    /// Handle a single message. Returns true if the controller should exit.
    fn handle_message(&mut self, message: SessionMessage) -> bool {
        match message {
            SessionMessage::KeepAlive { respond_to } => {
                let _ = respond_to.send(true);
            }

            SessionMessage::AddPublisher {
                publisher_id,
                respond_to,
            } => {
                let stream = self.add_publisher(publisher_id, None);
                let _ = respond_to.send(stream);
            }

            SessionMessage::AddExternalInput {
                publisher_id,
                url,
                respond_to,
            } => {
                let status = self.add_external_input(publisher_id, &url);
                let _ = respond_to.send(status);
            }

            SessionMessage::AddExternalOutput { publisher_id, url } => {
                self.add_external_output(&publisher_id, url);
            }

            SessionMessage::RemoveExternalOutput { publisher_id, url } => {
                self.remove_external_output(&publisher_id, &url);
            }

            SessionMessage::MovePublisher {
                publisher_id,
                context,
                respond_to,
            } => {
                let stream = self.add_publisher(publisher_id, Some(context));
                let _ = respond_to.send(stream);
            }

            SessionMessage::AddSubscriber {
                subscriber_id,
                publisher_id,
                audio,
                video,
                respond_to,
            } => {
                let stream = self.add_subscriber(subscriber_id, publisher_id, audio, video);
                let _ = respond_to.send(stream);
            }

            SessionMessage::ProcessSignaling {
                stream_id,
                peer_id,
                message,
            } => {
                self.process_signaling(&stream_id, peer_id.as_ref(), message);
            }

            SessionMessage::GetSrtpSession {
                stream_id,
                peer_id,
                respond_to,
            } => {
                let session = self
                    .srtp_target(&stream_id, peer_id.as_ref())
                    .and_then(|connection| connection.srtp_session());
                let _ = respond_to.send(session);
            }

            SessionMessage::SetSrtpSession {
                stream_id,
                peer_id,
                session,
            } => match self.srtp_target(&stream_id, peer_id.as_ref()) {
                Some(connection) => connection.set_srtp_session(&session),
                None => debug!(
                    target: "sfu.session.controller",
                    stream_id = %stream_id,
                    "No connection for SRTP session, ignoring"
                ),
            },

            SessionMessage::RemovePublisher { publisher_id } => {
                return self.remove_publisher(&publisher_id);
            }

            SessionMessage::RemoveSubscriber {
                subscriber_id,
                publisher_id,
            } => {
                self.remove_subscriber(&subscriber_id, &publisher_id);
            }

            SessionMessage::RemoveSubscriptions { subscriber_id } => {
                let publisher_ids: Vec<PublisherId> = self
                    .publishers
                    .iter()
                    .filter(|(_, entry)| entry.subscribers.contains_key(&subscriber_id))
                    .map(|(id, _)| id.clone())
                    .collect();

                info!(
                    target: "sfu.session.controller",
                    worker_id = %self.worker_id,
                    subscriber_id = %subscriber_id,
                    count = publisher_ids.len(),
                    "Removing subscriptions"
                );

                for publisher_id in publisher_ids {
                    self.remove_subscriber(&subscriber_id, &publisher_id);
                }
            }

            SessionMessage::GetStatus { respond_to } => {
                let _ = respond_to.send(self.status());
            }
        }

        false
    }

    fn connection_options(&self, audio: bool, video: bool) -> ConnectionOptions {
        ConnectionOptions {
            audio,
            video,
            stun_server: self.config.stun_server.clone(),
            stun_port: self.config.stun_port,
            min_port: self.config.min_port,
            max_port: self.config.max_port,
        }
    }

    fn attach_stats(
        &self,
        connection: &dyn EngineConnection,
        publisher_id: &PublisherId,
        subscriber_id: Option<&SubscriberId>,
        cancel_token: &CancellationToken,
    ) {
        if !self.config.send_stats {
            return;
        }
        let Some(collector) = &self.stats else {
            return;
        };

        let forwarder = StatsForwarder {
            collector: Arc::clone(collector),
            queue: self.config.stats_queue.clone(),
            publisher_id: publisher_id.clone(),
            subscriber_id: subscriber_id.cloned(),
        };
        forwarder.attach(connection, cancel_token.child_token());
    }

    /// Create a WebRTC publisher, restored from `context` when migrating.
    fn add_publisher(
        &mut self,
        publisher_id: PublisherId,
        context: Option<SignalingContext>,
    ) -> Option<SignalingStream> {
        if self.publishers.contains_key(&publisher_id) {
            info!(
                target: "sfu.session.controller",
                worker_id = %self.worker_id,
                publisher_id = %publisher_id,
                "Publisher already set"
            );
            return None;
        }

        let restored = context.is_some();
        let connection = self.engine.create_connection(self.connection_options(true, true));
        let fan_out = self.engine.create_fan_out(&publisher_id);
        fan_out.set_publisher(Arc::clone(&connection));

        let ready = ReadinessGate::new();
        let cancel_token = self.cancel_token.child_token();
        let (sink, stream) = signaling_channel();

        self.attach_stats(connection.as_ref(), &publisher_id, None, &cancel_token);

        ConnectionActor::spawn(
            publisher_id.clone(),
            ConnectionRole::Publisher {
                ready: ready.clone(),
            },
            Arc::clone(&connection),
            sink,
            context,
            cancel_token.clone(),
        );

        self.publishers.insert(
            publisher_id.clone(),
            PublisherEntry {
                source: PublisherSource::WebRtc(connection),
                fan_out,
                ready,
                restored,
                cancel_token,
                subscribers: HashMap::new(),
                created_at: chrono::Utc::now().timestamp(),
            },
        );
        observability::set_publishers_active(self.publishers.len());

        info!(
            target: "sfu.session.controller",
            worker_id = %self.worker_id,
            publisher_id = %publisher_id,
            restored,
            total_publishers = self.publishers.len(),
            "Publisher added"
        );

        Some(stream)
    }

    fn add_external_input(&mut self, publisher_id: PublisherId, url: &str) -> Option<InitStatus> {
        if self.publishers.contains_key(&publisher_id) {
            info!(
                target: "sfu.session.controller",
                worker_id = %self.worker_id,
                publisher_id = %publisher_id,
                "Publisher already set"
            );
            return None;
        }

        let input = self.engine.create_external_input(url);
        let fan_out = self.engine.create_fan_out(&publisher_id);
        fan_out.set_external_publisher(Arc::clone(&input));

        let status = InitStatus::from_code(input.init());
        let ready = ReadinessGate::new();
        if status.is_success() {
            ready.mark_ready();
        } else {
            warn!(
                target: "sfu.session.controller",
                worker_id = %self.worker_id,
                publisher_id = %publisher_id,
                status = ?status,
                "External input failed to initialize"
            );
        }

        // Registered even on failure so a later removePublisher finds it.
        self.publishers.insert(
            publisher_id.clone(),
            PublisherEntry {
                source: PublisherSource::External(input),
                fan_out,
                ready,
                restored: false,
                cancel_token: self.cancel_token.child_token(),
                subscribers: HashMap::new(),
                created_at: chrono::Utc::now().timestamp(),
            },
        );
        observability::set_publishers_active(self.publishers.len());

        info!(
            target: "sfu.session.controller",
            worker_id = %self.worker_id,
            publisher_id = %publisher_id,
            "External input added"
        );

        Some(status)
    }

    fn add_external_output(&mut self, publisher_id: &PublisherId, url: String) {
        let Some(entry) = self.publishers.get(publisher_id) else {
            debug!(
                target: "sfu.session.controller",
                publisher_id = %publisher_id,
                "External output for unknown publisher, ignoring"
            );
            return;
        };

        let output = self.engine.create_external_output(&url);
        let code = output.init();
        if code < 0 {
            warn!(
                target: "sfu.session.controller",
                worker_id = %self.worker_id,
                publisher_id = %publisher_id,
                code,
                "External output failed to initialize"
            );
            return;
        }

        entry.fan_out.add_external_output(&url, Arc::clone(&output));
        info!(
            target: "sfu.session.controller",
            worker_id = %self.worker_id,
            publisher_id = %publisher_id,
            "External output added"
        );
        self.external_outputs.insert(
            url,
            ExternalOutputEntry {
                publisher_id: publisher_id.clone(),
                _output: output,
            },
        );
    }

    fn remove_external_output(&mut self, publisher_id: &PublisherId, url: &str) {
        let Some(entry) = self.publishers.get(publisher_id) else {
            return;
        };
        if self.external_outputs.remove(url).is_none() {
            return;
        }

        entry.fan_out.remove_external_output(url);
        info!(
            target: "sfu.session.controller",
            worker_id = %self.worker_id,
            publisher_id = %publisher_id,
            "External output stopped"
        );
    }

    fn add_subscriber(
        &mut self,
        subscriber_id: SubscriberId,
        publisher_id: PublisherId,
        audio: bool,
        video: bool,
    ) -> Option<SignalingStream> {
        let (fan_out, publisher_ready, publisher_token) = match self.publishers.get(&publisher_id) {
            Some(entry) if !entry.subscribers.contains_key(&subscriber_id) => (
                Arc::clone(&entry.fan_out),
                entry.ready.subscribe(),
                entry.cancel_token.clone(),
            ),
            Some(_) => {
                debug!(
                    target: "sfu.session.controller",
                    publisher_id = %publisher_id,
                    subscriber_id = %subscriber_id,
                    "Subscriber already attached, ignoring"
                );
                return None;
            }
            None => {
                debug!(
                    target: "sfu.session.controller",
                    publisher_id = %publisher_id,
                    subscriber_id = %subscriber_id,
                    "Subscriber for unknown publisher, ignoring"
                );
                return None;
            }
        };

        let connection = self
            .engine
            .create_connection(self.connection_options(audio, video));
        fan_out.add_subscriber(&subscriber_id, Arc::clone(&connection));

        let cancel_token = publisher_token.child_token();
        let (sink, stream) = signaling_channel();

        self.attach_stats(
            connection.as_ref(),
            &publisher_id,
            Some(&subscriber_id),
            &cancel_token,
        );

        ConnectionActor::spawn(
            publisher_id.clone(),
            ConnectionRole::Subscriber {
                subscriber_id: subscriber_id.clone(),
                fan_out,
                publisher_ready,
            },
            Arc::clone(&connection),
            sink,
            None,
            cancel_token.clone(),
        );

        if let Some(entry) = self.publishers.get_mut(&publisher_id) {
            entry.subscribers.insert(
                subscriber_id.clone(),
                SubscriberEntry {
                    connection,
                    cancel_token,
                    audio,
                    video,
                },
            );
        }
        observability::set_subscribers_active(self.subscriber_count());

        info!(
            target: "sfu.session.controller",
            worker_id = %self.worker_id,
            publisher_id = %publisher_id,
            subscriber_id = %subscriber_id,
            audio,
            video,
            "Subscriber added"
        );

        Some(stream)
    }

    /// Route an inbound message to a subscriber connection when `peer_id`
    /// names one of the stream's subscribers, else to the publisher.
    fn process_signaling(
        &self,
        stream_id: &PublisherId,
        peer_id: Option<&SubscriberId>,
        message: SignalingMessage,
    ) {
        let Some(entry) = self.publishers.get(stream_id) else {
            debug!(
                target: "sfu.session.controller",
                stream_id = %stream_id,
                "Signaling for unknown stream, ignoring"
            );
            return;
        };

        let connection = match peer_id.and_then(|peer| entry.subscribers.get(peer)) {
            Some(subscriber) => &subscriber.connection,
            None => match &entry.source {
                PublisherSource::WebRtc(connection) => connection,
                PublisherSource::External(_) => {
                    debug!(
                        target: "sfu.session.controller",
                        stream_id = %stream_id,
                        "Signaling for external input, ignoring"
                    );
                    return;
                }
            },
        };

        debug!(
            target: "sfu.session.controller",
            stream_id = %stream_id,
            peer_id = ?peer_id,
            message_type = message.kind(),
            "Processing signaling message"
        );

        match message {
            SignalingMessage::Offer { sdp } => connection.set_remote_sdp(&sdp),
            SignalingMessage::Candidate { candidate } => connection.add_remote_candidate(&candidate),
            SignalingMessage::Initializing
            | SignalingMessage::Started
            | SignalingMessage::Answer { .. } => {}
        }
    }

    /// Connection whose SRTP material `getSrtpSession`/`setSrtpSession`
    /// address: the subscriber's when `peer_id` is given, else the publisher's.
    fn srtp_target(
        &self,
        stream_id: &PublisherId,
        peer_id: Option<&SubscriberId>,
    ) -> Option<&Arc<dyn EngineConnection>> {
        let entry = self.publishers.get(stream_id)?;
        match peer_id {
            Some(peer) => entry.subscribers.get(peer).map(|s| &s.connection),
            None => match &entry.source {
                PublisherSource::WebRtc(connection) => Some(connection),
                PublisherSource::External(_) => None,
            },
        }
    }

    /// Returns true when the last publisher was removed.
    fn remove_publisher(&mut self, publisher_id: &PublisherId) -> bool {
        let Some(entry) = self.publishers.remove(publisher_id) else {
            debug!(
                target: "sfu.session.controller",
                publisher_id = %publisher_id,
                "Remove for unknown publisher, ignoring"
            );
            return false;
        };

        entry.cancel_token.cancel();
        entry.fan_out.close();
        self.external_outputs
            .retain(|_, output| &output.publisher_id != publisher_id);

        observability::set_publishers_active(self.publishers.len());
        observability::set_subscribers_active(self.subscriber_count());

        info!(
            target: "sfu.session.controller",
            worker_id = %self.worker_id,
            publisher_id = %publisher_id,
            subscribers_removed = entry.subscribers.len(),
            remaining_publishers = self.publishers.len(),
            "Publisher removed"
        );

        if self.publishers.is_empty() {
            info!(
                target: "sfu.session.controller",
                worker_id = %self.worker_id,
                "Removed all publishers, session controller exiting"
            );
            return true;
        }

        false
    }

    fn remove_subscriber(&mut self, subscriber_id: &SubscriberId, publisher_id: &PublisherId) {
        let Some(entry) = self.publishers.get_mut(publisher_id) else {
            return;
        };
        let Some(subscriber) = entry.subscribers.remove(subscriber_id) else {
            return;
        };

        subscriber.cancel_token.cancel();
        entry.fan_out.remove_subscriber(subscriber_id);
        observability::set_subscribers_active(self.subscriber_count());

        info!(
            target: "sfu.session.controller",
            worker_id = %self.worker_id,
            publisher_id = %publisher_id,
            subscriber_id = %subscriber_id,
            "Subscriber removed"
        );
    }

    fn subscriber_count(&self) -> usize {
        self.publishers.values().map(|p| p.subscribers.len()).sum()
    }

    fn status(&self) -> WorkerStatus {
        let mut publishers: Vec<PublisherStatus> = self
            .publishers
            .iter()
            .map(|(publisher_id, entry)| {
                let mut subscribers: Vec<SubscriberStatus> = entry
                    .subscribers
                    .iter()
                    .map(|(subscriber_id, subscriber)| SubscriberStatus {
                        subscriber_id: subscriber_id.clone(),
                        audio: subscriber.audio,
                        video: subscriber.video,
                        state: subscriber.connection.current_state(),
                    })
                    .collect();
                subscribers.sort_by(|a, b| a.subscriber_id.cmp(&b.subscriber_id));

                PublisherStatus {
                    publisher_id: publisher_id.clone(),
                    external: matches!(entry.source, PublisherSource::External(_)),
                    restored: entry.restored,
                    ready: entry.ready.is_ready(),
                    state: entry.fan_out.publisher_state(),
                    subscribers,
                    created_at: entry.created_at,
                }
            })
            .collect();
        publishers.sort_by(|a, b| a.publisher_id.cmp(&b.publisher_id));

        let mut external_outputs: Vec<String> = self.external_outputs.keys().cloned().collect();
        external_outputs.sort();

        WorkerStatus {
            worker_id: self.worker_id.clone(),
            publishers,
            external_outputs,
        }
    }
}
