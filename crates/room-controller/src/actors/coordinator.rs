//! `Coordinator` - room-level owner of publisher placement.
//!
//! The `Coordinator` is the only actor in a room:
//!
//! - Owns the publisher registry: worker placement, subscriber set and
//!   signaling context per publisher, plus the external output map
//! - Asks the Worker Process Manager for one worker per new publisher
//! - Sends every worker call through that worker's outbox, in issue order
//! - Pings every placed publisher's worker on a fixed interval
//! - Orchestrates migration: fetch SRTP material from the old worker, create a
//!   new one, and rebuild the publisher there from its signaling context
//!
//! # Continuations
//!
//! Worker creation, the migration SRTP fetch and keepalive pings run in
//! spawned tasks. Their results come back as [`Continuation`]s through a
//! second channel, so every registry change still happens on the actor task.
//! Each placement carries an epoch; a continuation whose publisher was
//! removed (or removed and re-added) in the meantime is discarded and any
//! worker it produced is deleted again.
//!
//! # Keepalive failure
//!
//! A ping answered with anything but `true` emits one `unpublish` event and
//! unmaps every publisher placed on that worker. The worker is deleted once,
//! however many of its pings fail in the same round.

use crate::config::Config;
use crate::errors::RoomError;
use crate::events::{EventListeners, RoomEvent};
use crate::observability;
use crate::outbox::{OutboxHandle, WorkerCall};

use super::messages::{CoordinatorMessage, PublisherInfo, RoomState, SubscribeOptions};

use common::bus::{WorkerAgent, WorkerClient};
use common::error::BusError;
use common::mailbox::{ActorType, Backlog, MailboxMonitor};
use common::signaling::{InitStatus, SignalingContext, SignalingMessage, SignalingStream, SrtpSession};
use common::types::{PublisherId, SubscriberId, WorkerId};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Default channel buffer size for the coordinator mailbox.
const COORDINATOR_CHANNEL_BUFFER: usize = 500;

type StreamReply = oneshot::Sender<Result<Option<SignalingStream>, RoomError>>;

/// Handle to a `Coordinator`.
#[derive(Clone)]
pub struct CoordinatorHandle {
    sender: mpsc::Sender<CoordinatorMessage>,
    cancel_token: CancellationToken,
    room_id: String,
    mailbox: Arc<MailboxMonitor>,
}

impl CoordinatorHandle {
    #[must_use]
    pub fn room_id(&self) -> &str {
        &self.room_id
    }

    async fn send(&self, message: CoordinatorMessage) -> Result<(), RoomError> {
        if self.cancel_token.is_cancelled() {
            return Err(RoomError::Internal("coordinator stopped".to_string()));
        }
        self.mailbox.record_enqueue();
        self.sender.send(message).await.map_err(|e| {
            self.mailbox.record_send_failed();
            RoomError::Internal(format!("channel send failed: {e}"))
        })
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<Result<T, RoomError>>) -> CoordinatorMessage,
    ) -> Result<T, RoomError> {
        let (tx, rx) = oneshot::channel();
        self.send(build(tx)).await?;
        rx.await
            .map_err(|e| RoomError::Internal(format!("response receive failed: {e}")))?
    }

    /// Place a new publisher on a fresh worker and return its signaling
    /// stream. `None` if the id is already tracked.
    pub async fn add_publisher(
        &self,
        publisher_id: PublisherId,
    ) -> Result<Option<SignalingStream>, RoomError> {
        self.request(|respond_to| CoordinatorMessage::AddPublisher {
            publisher_id,
            respond_to,
        })
        .await
    }

    /// Place a publisher fed from `url` and relay the worker's init status.
    /// `None` if the id is already tracked.
    pub async fn add_external_input(
        &self,
        publisher_id: PublisherId,
        url: String,
    ) -> Result<Option<InitStatus>, RoomError> {
        self.request(|respond_to| CoordinatorMessage::AddExternalInput {
            publisher_id,
            url,
            respond_to,
        })
        .await
    }

    /// Start recording or re-streaming a publisher to `url`.
    ///
    /// Succeeds as soon as the call is queued for the worker; a failure on
    /// the worker side is not reported back.
    pub async fn add_external_output(
        &self,
        publisher_id: PublisherId,
        url: String,
    ) -> Result<(), RoomError> {
        self.request(|respond_to| CoordinatorMessage::AddExternalOutput {
            publisher_id,
            url,
            respond_to,
        })
        .await
    }

    /// Stop the output writing to `url`; [`RoomError::NotRecorded`] if
    /// nothing does.
    pub async fn remove_external_output(&self, url: String) -> Result<(), RoomError> {
        self.request(|respond_to| CoordinatorMessage::RemoveExternalOutput { url, respond_to })
            .await
    }

    /// Attach a subscriber. `None` when the publisher has no worker or the
    /// pair already exists; nothing is sent to any worker in that case.
    pub async fn add_subscriber(
        &self,
        subscriber_id: SubscriberId,
        publisher_id: PublisherId,
        options: SubscribeOptions,
    ) -> Result<Option<SignalingStream>, RoomError> {
        self.request(|respond_to| CoordinatorMessage::AddSubscriber {
            subscriber_id,
            publisher_id,
            options,
            respond_to,
        })
        .await
    }

    pub async fn remove_publisher(&self, publisher_id: PublisherId) -> Result<(), RoomError> {
        self.send(CoordinatorMessage::RemovePublisher { publisher_id })
            .await
    }

    pub async fn remove_subscriber(
        &self,
        subscriber_id: SubscriberId,
        publisher_id: PublisherId,
    ) -> Result<(), RoomError> {
        self.send(CoordinatorMessage::RemoveSubscriber {
            subscriber_id,
            publisher_id,
        })
        .await
    }

    /// Detach `subscriber_id` from every publisher.
    pub async fn remove_subscriptions(&self, subscriber_id: SubscriberId) -> Result<(), RoomError> {
        self.send(CoordinatorMessage::RemoveSubscriptions { subscriber_id })
            .await
    }

    /// Relay a client signaling message to the worker hosting `stream_id`.
    pub async fn process_signaling(
        &self,
        stream_id: PublisherId,
        peer_id: Option<SubscriberId>,
        message: SignalingMessage,
    ) -> Result<(), RoomError> {
        self.send(CoordinatorMessage::ProcessSignaling {
            stream_id,
            peer_id,
            message,
        })
        .await
    }

    /// Move a publisher to a new worker without renegotiating.
    pub async fn move_publisher(
        &self,
        publisher_id: PublisherId,
    ) -> Result<Option<SignalingStream>, RoomError> {
        self.request(|respond_to| CoordinatorMessage::MovePublisher {
            publisher_id,
            respond_to,
        })
        .await
    }

    /// Register an observer, called as `listener(event_type, event)`.
    /// Observers run on the coordinator task, in registration order.
    pub async fn add_event_listener(
        &self,
        listener: impl Fn(&str, &RoomEvent) + Send + Sync + 'static,
    ) -> Result<(), RoomError> {
        self.send(CoordinatorMessage::AddEventListener {
            listener: Box::new(listener),
        })
        .await
    }

    pub async fn get_state(&self) -> Result<RoomState, RoomError> {
        let (tx, rx) = oneshot::channel();
        self.send(CoordinatorMessage::GetState { respond_to: tx })
            .await?;
        rx.await
            .map_err(|e| RoomError::Internal(format!("response receive failed: {e}")))
    }

    /// Stop the coordinator, its outboxes and its keepalive loop.
    pub fn cancel(&self) {
        self.cancel_token.cancel();
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel_token.is_cancelled()
    }
}

/// Where a publisher currently lives.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Placement {
    /// Worker creation in flight.
    Pending,
    Assigned(WorkerId),
    /// The worker failed a keepalive.
    Unmapped,
}

struct PublisherRecord {
    placement: Placement,
    subscribers: HashSet<SubscriberId>,
    context: SignalingContext,
    migrating: bool,
    epoch: u64,
}

impl PublisherRecord {
    fn worker(&self) -> Option<&WorkerId> {
        match &self.placement {
            Placement::Assigned(worker_id) => Some(worker_id),
            Placement::Pending | Placement::Unmapped => None,
        }
    }
}

/// What to do once a worker exists for a publisher.
enum PendingPlacement {
    Publisher {
        respond_to: StreamReply,
    },
    ExternalInput {
        url: String,
        respond_to: oneshot::Sender<Result<Option<InitStatus>, RoomError>>,
    },
    Migration {
        respond_to: StreamReply,
    },
}

impl PendingPlacement {
    const fn is_migration(&self) -> bool {
        matches!(self, PendingPlacement::Migration { .. })
    }

    fn fail(self, error: RoomError) {
        match self {
            PendingPlacement::Publisher { respond_to } | PendingPlacement::Migration { respond_to } => {
                let _ = respond_to.send(Err(error));
            }
            PendingPlacement::ExternalInput { respond_to, .. } => {
                let _ = respond_to.send(Err(error));
            }
        }
    }

    fn into_call(self, publisher_id: PublisherId, context: &SignalingContext) -> WorkerCall {
        match self {
            PendingPlacement::Publisher { respond_to } => WorkerCall::AddPublisher {
                publisher_id,
                respond_to,
            },
            PendingPlacement::ExternalInput { url, respond_to } => WorkerCall::AddExternalInput {
                publisher_id,
                url,
                respond_to,
            },
            PendingPlacement::Migration { respond_to } => WorkerCall::MovePublisher {
                publisher_id,
                context: context.clone(),
                respond_to,
            },
        }
    }
}

/// Results of spawned work, fed back into the actor.
enum Continuation {
    WorkerCreated {
        publisher_id: PublisherId,
        epoch: u64,
        result: Result<WorkerId, BusError>,
        pending: PendingPlacement,
    },
    SrtpReceived {
        publisher_id: PublisherId,
        epoch: u64,
        result: Result<Option<SrtpSession>, RoomError>,
        respond_to: StreamReply,
    },
    KeepAliveAnswered {
        worker_id: WorkerId,
        alive: bool,
    },
}

/// The `Coordinator` implementation.
pub struct Coordinator {
    room_id: String,
    config: Config,
    agent: Arc<dyn WorkerAgent>,
    client: Arc<dyn WorkerClient>,
    receiver: mpsc::Receiver<CoordinatorMessage>,
    continuations_tx: mpsc::UnboundedSender<Continuation>,
    continuations: mpsc::UnboundedReceiver<Continuation>,
    cancel_token: CancellationToken,
    publishers: HashMap<PublisherId, PublisherRecord>,
    /// url -> publisher
    external_outputs: HashMap<String, PublisherId>,
    outboxes: HashMap<WorkerId, OutboxHandle>,
    listeners: EventListeners,
    /// Keepalive pings awaiting an answer, per worker.
    pings_in_flight: HashMap<WorkerId, usize>,
    /// Workers already being deleted after a failed keepalive.
    retired: HashSet<WorkerId>,
    next_epoch: u64,
    mailbox: Arc<MailboxMonitor>,
}

impl Coordinator {
    /// Spawn a coordinator for `config.room_id`.
    #[must_use]
    pub fn spawn(
        config: Config,
        agent: Arc<dyn WorkerAgent>,
        client: Arc<dyn WorkerClient>,
    ) -> (CoordinatorHandle, JoinHandle<()>) {
        let (actor, handle) = Self::new(config, agent, client);
        let task_handle = tokio::spawn(actor.run());
        (handle, task_handle)
    }

    fn new(
        config: Config,
        agent: Arc<dyn WorkerAgent>,
        client: Arc<dyn WorkerClient>,
    ) -> (Self, CoordinatorHandle) {
        let (sender, receiver) = mpsc::channel(COORDINATOR_CHANNEL_BUFFER);
        let (continuations_tx, continuations) = mpsc::unbounded_channel();
        let cancel_token = CancellationToken::new();
        let room_id = config.room_id.clone();
        let mailbox = Arc::new(MailboxMonitor::new(ActorType::Coordinator, &room_id));

        let actor = Self {
            room_id: room_id.clone(),
            config,
            agent,
            client,
            receiver,
            continuations_tx,
            continuations,
            cancel_token: cancel_token.clone(),
            publishers: HashMap::new(),
            external_outputs: HashMap::new(),
            outboxes: HashMap::new(),
            listeners: EventListeners::default(),
            pings_in_flight: HashMap::new(),
            retired: HashSet::new(),
            next_epoch: 0,
            mailbox: Arc::clone(&mailbox),
        };

        let handle = CoordinatorHandle {
            sender,
            cancel_token,
            room_id,
            mailbox,
        };

        (actor, handle)
    }

    #[instrument(skip_all, name = "sfu.room.coordinator", fields(room_id = %self.room_id))]
    async fn run(mut self) {
        info!(
            target: "sfu.room.coordinator",
            room_id = %self.room_id,
            keepalive_interval = ?self.config.keepalive_interval,
            "Coordinator started"
        );

        let period = self.config.keepalive_interval;
        let mut keepalive = tokio::time::interval_at(Instant::now() + period, period);
        keepalive.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                () = self.cancel_token.cancelled() => {
                    info!(
                        target: "sfu.room.coordinator",
                        room_id = %self.room_id,
                        "Coordinator received cancellation signal"
                    );
                    break;
                }

                _ = keepalive.tick() => {
                    self.send_keep_alives();
                }

                Some(continuation) = self.continuations.recv() => {
                    self.handle_continuation(continuation);
                }

                msg = self.receiver.recv() => {
                    match msg {
                        Some(message) => {
                            self.handle_message(message);
                            self.mailbox.record_dequeue();
                        }
                        None => {
                            info!(
                                target: "sfu.room.coordinator",
                                room_id = %self.room_id,
                                "Coordinator channel closed, exiting"
                            );
                            break;
                        }
                    }
                }
            }
        }

        info!(
            target: "sfu.room.coordinator",
            room_id = %self.room_id,
            publishers = self.publishers.len(),
            workers = self.outboxes.len(),
            messages_processed = self.mailbox.messages_processed(),
            "Coordinator stopped"
        );
    }

    fn handle_message(&mut self, message: CoordinatorMessage) {
        match message {
            CoordinatorMessage::AddPublisher {
                publisher_id,
                respond_to,
            } => {
                self.place_publisher(publisher_id, PendingPlacement::Publisher { respond_to });
            }

            CoordinatorMessage::AddExternalInput {
                publisher_id,
                url,
                respond_to,
            } => {
                self.place_publisher(
                    publisher_id,
                    PendingPlacement::ExternalInput { url, respond_to },
                );
            }

            CoordinatorMessage::AddExternalOutput {
                publisher_id,
                url,
                respond_to,
            } => {
                let result = self.add_external_output(publisher_id, url);
                let _ = respond_to.send(result);
            }

            CoordinatorMessage::RemoveExternalOutput { url, respond_to } => {
                let result = self.remove_external_output(url);
                let _ = respond_to.send(result);
            }

            CoordinatorMessage::AddSubscriber {
                subscriber_id,
                publisher_id,
                options,
                respond_to,
            } => {
                self.add_subscriber(subscriber_id, publisher_id, options, respond_to);
            }

            CoordinatorMessage::RemovePublisher { publisher_id } => {
                self.remove_publisher(&publisher_id);
            }

            CoordinatorMessage::RemoveSubscriber {
                subscriber_id,
                publisher_id,
            } => {
                self.remove_subscriber(subscriber_id, &publisher_id);
            }

            CoordinatorMessage::RemoveSubscriptions { subscriber_id } => {
                let publisher_ids: Vec<PublisherId> = self
                    .publishers
                    .iter()
                    .filter(|(_, record)| record.subscribers.contains(&subscriber_id))
                    .map(|(id, _)| id.clone())
                    .collect();

                info!(
                    target: "sfu.room.coordinator",
                    room_id = %self.room_id,
                    subscriber_id = %subscriber_id,
                    count = publisher_ids.len(),
                    "Removing subscriptions"
                );

                for publisher_id in publisher_ids {
                    self.remove_subscriber(subscriber_id.clone(), &publisher_id);
                }
            }

            CoordinatorMessage::ProcessSignaling {
                stream_id,
                peer_id,
                message,
            } => {
                self.process_signaling(stream_id, peer_id, message);
            }

            CoordinatorMessage::MovePublisher {
                publisher_id,
                respond_to,
            } => {
                self.start_migration(publisher_id, respond_to);
            }

            CoordinatorMessage::AddEventListener { listener } => {
                self.listeners.push(listener);
                debug!(
                    target: "sfu.room.coordinator",
                    room_id = %self.room_id,
                    listeners = self.listeners.len(),
                    "Event listener added"
                );
            }

            CoordinatorMessage::GetState { respond_to } => {
                let _ = respond_to.send(self.state());
            }
        }
    }

    fn handle_continuation(&mut self, continuation: Continuation) {
        match continuation {
            Continuation::WorkerCreated {
                publisher_id,
                epoch,
                result,
                pending,
            } => {
                self.on_worker_created(publisher_id, epoch, result, pending);
            }

            Continuation::SrtpReceived {
                publisher_id,
                epoch,
                result,
                respond_to,
            } => {
                self.on_srtp_received(publisher_id, epoch, result, respond_to);
            }

            Continuation::KeepAliveAnswered { worker_id, alive } => {
                self.on_keep_alive_answered(worker_id, alive);
            }
        }
    }

    // ------------------------------------------------------------------
    // Placement
    // ------------------------------------------------------------------

    /// Track a new publisher as pending and ask for a worker.
    fn place_publisher(&mut self, publisher_id: PublisherId, pending: PendingPlacement) {
        if self.publishers.contains_key(&publisher_id) {
            info!(
                target: "sfu.room.coordinator",
                room_id = %self.room_id,
                publisher_id = %publisher_id,
                "Publisher already set"
            );
            match pending {
                PendingPlacement::Publisher { respond_to }
                | PendingPlacement::Migration { respond_to } => {
                    let _ = respond_to.send(Ok(None));
                }
                PendingPlacement::ExternalInput { respond_to, .. } => {
                    let _ = respond_to.send(Ok(None));
                }
            }
            return;
        }

        self.next_epoch += 1;
        let epoch = self.next_epoch;
        self.publishers.insert(
            publisher_id.clone(),
            PublisherRecord {
                placement: Placement::Pending,
                subscribers: HashSet::new(),
                context: SignalingContext::default(),
                migrating: false,
                epoch,
            },
        );
        observability::set_publishers_active(self.publishers.len());

        info!(
            target: "sfu.room.coordinator",
            room_id = %self.room_id,
            publisher_id = %publisher_id,
            external = matches!(pending, PendingPlacement::ExternalInput { .. }),
            "Adding publisher"
        );

        self.spawn_worker_creation(publisher_id, epoch, pending);
    }

    fn spawn_worker_creation(
        &self,
        publisher_id: PublisherId,
        epoch: u64,
        pending: PendingPlacement,
    ) {
        let agent = Arc::clone(&self.agent);
        let continuations = self.continuations_tx.clone();

        tokio::spawn(async move {
            let result = agent.create_worker(&publisher_id).await;
            let _ = continuations.send(Continuation::WorkerCreated {
                publisher_id,
                epoch,
                result,
                pending,
            });
        });
    }

    fn spawn_worker_deletion(&self, worker_id: WorkerId) {
        let agent = Arc::clone(&self.agent);
        let room_id = self.room_id.clone();

        tokio::spawn(async move {
            match agent.delete_worker(&worker_id).await {
                Ok(()) => info!(
                    target: "sfu.room.coordinator",
                    room_id = %room_id,
                    worker_id = %worker_id,
                    "Worker deleted"
                ),
                Err(e) => warn!(
                    target: "sfu.room.coordinator",
                    room_id = %room_id,
                    worker_id = %worker_id,
                    error = %e,
                    "Failed to delete worker"
                ),
            }
        });
    }

    fn on_worker_created(
        &mut self,
        publisher_id: PublisherId,
        epoch: u64,
        result: Result<WorkerId, BusError>,
        pending: PendingPlacement,
    ) {
        let migration = pending.is_migration();
        observability::record_worker_creation(result.is_ok());

        let worker_id = match result {
            Ok(worker_id) => worker_id,
            Err(e) => {
                warn!(
                    target: "sfu.room.coordinator",
                    room_id = %self.room_id,
                    publisher_id = %publisher_id,
                    migration,
                    error = %e,
                    "Worker creation failed"
                );
                self.abandon_placement(&publisher_id, epoch, migration);
                if migration {
                    observability::record_migration(false);
                }
                pending.fail(RoomError::WorkerCreation(e.to_string()));
                return;
            }
        };

        let awaited = self.publishers.get(&publisher_id).is_some_and(|record| {
            record.epoch == epoch
                && if migration {
                    record.migrating
                } else {
                    record.placement == Placement::Pending
                }
        });

        if !awaited {
            info!(
                target: "sfu.room.coordinator",
                room_id = %self.room_id,
                publisher_id = %publisher_id,
                worker_id = %worker_id,
                "Publisher removed while its worker was being created, deleting worker"
            );
            self.spawn_worker_deletion(worker_id);
            if migration {
                observability::record_migration(false);
            }
            pending.fail(RoomError::PublisherNotFound(publisher_id.to_string()));
            return;
        }

        let Some(record) = self.publishers.get_mut(&publisher_id) else {
            return;
        };
        record.migrating = false;
        let previous = std::mem::replace(
            &mut record.placement,
            Placement::Assigned(worker_id.clone()),
        );
        let call = pending.into_call(publisher_id.clone(), &record.context);

        if migration {
            observability::record_migration(true);
        }
        info!(
            target: "sfu.room.coordinator",
            room_id = %self.room_id,
            publisher_id = %publisher_id,
            worker_id = %worker_id,
            migration,
            "Publisher placed on worker"
        );

        self.dispatch(&worker_id, call);

        if let Placement::Assigned(old_worker) = previous {
            self.release_outbox_if_unused(&old_worker);
        }
    }

    /// Undo the bookkeeping of a placement that will not complete.
    fn abandon_placement(&mut self, publisher_id: &PublisherId, epoch: u64, migration: bool) {
        let Some(record) = self.publishers.get_mut(publisher_id) else {
            return;
        };
        if record.epoch != epoch {
            return;
        }

        if migration {
            record.migrating = false;
        } else if record.placement == Placement::Pending {
            self.publishers.remove(publisher_id);
            self.external_outputs.retain(|_, owner| owner != publisher_id);
            observability::set_publishers_active(self.publishers.len());
        }
    }

    /// Queue `call` on `worker_id`'s outbox, opening it if needed.
    fn dispatch(&mut self, worker_id: &WorkerId, call: WorkerCall) {
        let outbox = self.outboxes.entry(worker_id.clone()).or_insert_with(|| {
            let (outbox, _task) = OutboxHandle::spawn(
                worker_id.clone(),
                Arc::clone(&self.client),
                self.cancel_token.child_token(),
            );
            outbox
        });

        if let Err(e) = outbox.enqueue(call) {
            warn!(
                target: "sfu.room.coordinator",
                room_id = %self.room_id,
                worker_id = %worker_id,
                error = %e,
                "Failed to queue worker call"
            );
        }
        observability::set_workers_active(self.outboxes.len());
    }

    /// Close the outbox of a worker no publisher is placed on any more.
    /// Calls already queued still go out.
    fn release_outbox_if_unused(&mut self, worker_id: &WorkerId) {
        let in_use = self
            .publishers
            .values()
            .any(|record| record.worker() == Some(worker_id));
        if in_use {
            return;
        }
        if let Some(outbox) = self.outboxes.remove(worker_id) {
            debug!(
                target: "sfu.room.coordinator",
                room_id = %self.room_id,
                worker_id = %worker_id,
                pending_calls = outbox.queued(),
                "Worker outbox closed"
            );
            observability::set_workers_active(self.outboxes.len());
        }
    }

    /// Worker hosting `publisher_id`.
    fn worker_of(&self, publisher_id: &PublisherId) -> Result<WorkerId, RoomError> {
        let record = self
            .publishers
            .get(publisher_id)
            .ok_or_else(|| RoomError::PublisherNotFound(publisher_id.to_string()))?;
        record
            .worker()
            .cloned()
            .ok_or_else(|| RoomError::NoWorker(publisher_id.to_string()))
    }

    // ------------------------------------------------------------------
    // External outputs
    // ------------------------------------------------------------------

    fn add_external_output(
        &mut self,
        publisher_id: PublisherId,
        url: String,
    ) -> Result<(), RoomError> {
        let worker_id = self.worker_of(&publisher_id)?;

        info!(
            target: "sfu.room.coordinator",
            room_id = %self.room_id,
            publisher_id = %publisher_id,
            url = %url,
            "Adding external output"
        );

        self.external_outputs
            .insert(url.clone(), publisher_id.clone());
        self.dispatch(
            &worker_id,
            WorkerCall::AddExternalOutput { publisher_id, url },
        );
        Ok(())
    }

    fn remove_external_output(&mut self, url: String) -> Result<(), RoomError> {
        let publisher_id = match self.external_outputs.get(&url) {
            Some(publisher_id) if self.publishers.contains_key(publisher_id) => {
                publisher_id.clone()
            }
            _ => return Err(RoomError::NotRecorded),
        };

        info!(
            target: "sfu.room.coordinator",
            room_id = %self.room_id,
            publisher_id = %publisher_id,
            url = %url,
            "Stopping external output"
        );

        self.external_outputs.remove(&url);
        if let Ok(worker_id) = self.worker_of(&publisher_id) {
            self.dispatch(
                &worker_id,
                WorkerCall::RemoveExternalOutput { publisher_id, url },
            );
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Subscribers and removal
    // ------------------------------------------------------------------

    fn add_subscriber(
        &mut self,
        subscriber_id: SubscriberId,
        publisher_id: PublisherId,
        options: SubscribeOptions,
        respond_to: StreamReply,
    ) {
        let Some(record) = self.publishers.get_mut(&publisher_id) else {
            debug!(
                target: "sfu.room.coordinator",
                publisher_id = %publisher_id,
                subscriber_id = %subscriber_id,
                "Subscriber for unknown publisher, ignoring"
            );
            let _ = respond_to.send(Ok(None));
            return;
        };

        let Some(worker_id) = record.worker().cloned() else {
            debug!(
                target: "sfu.room.coordinator",
                publisher_id = %publisher_id,
                subscriber_id = %subscriber_id,
                "Subscriber for publisher without worker, ignoring"
            );
            let _ = respond_to.send(Ok(None));
            return;
        };

        if !record.subscribers.insert(subscriber_id.clone()) {
            debug!(
                target: "sfu.room.coordinator",
                publisher_id = %publisher_id,
                subscriber_id = %subscriber_id,
                "Subscriber already attached, ignoring"
            );
            let _ = respond_to.send(Ok(None));
            return;
        }

        info!(
            target: "sfu.room.coordinator",
            room_id = %self.room_id,
            publisher_id = %publisher_id,
            subscriber_id = %subscriber_id,
            worker_id = %worker_id,
            "Adding subscriber"
        );

        self.dispatch(
            &worker_id,
            WorkerCall::AddSubscriber {
                subscriber_id,
                publisher_id,
                audio: options.audio,
                video: options.video,
                respond_to,
            },
        );
    }

    fn remove_publisher(&mut self, publisher_id: &PublisherId) {
        let Some(record) = self.publishers.remove(publisher_id) else {
            debug!(
                target: "sfu.room.coordinator",
                publisher_id = %publisher_id,
                "Remove for unknown publisher, ignoring"
            );
            return;
        };

        self.external_outputs.retain(|_, owner| owner != publisher_id);
        observability::set_publishers_active(self.publishers.len());

        info!(
            target: "sfu.room.coordinator",
            room_id = %self.room_id,
            publisher_id = %publisher_id,
            subscribers = record.subscribers.len(),
            "Removing publisher"
        );

        if let Placement::Assigned(worker_id) = record.placement {
            self.dispatch(
                &worker_id,
                WorkerCall::RemovePublisher {
                    publisher_id: publisher_id.clone(),
                },
            );
            self.release_outbox_if_unused(&worker_id);
        }
    }

    fn remove_subscriber(&mut self, subscriber_id: SubscriberId, publisher_id: &PublisherId) {
        let Some(record) = self.publishers.get_mut(publisher_id) else {
            return;
        };
        if !record.subscribers.remove(&subscriber_id) {
            return;
        }
        let worker_id = record.worker().cloned();

        info!(
            target: "sfu.room.coordinator",
            room_id = %self.room_id,
            publisher_id = %publisher_id,
            subscriber_id = %subscriber_id,
            "Removing subscriber"
        );

        if let Some(worker_id) = worker_id {
            self.dispatch(
                &worker_id,
                WorkerCall::RemoveSubscriber {
                    subscriber_id,
                    publisher_id: publisher_id.clone(),
                },
            );
        }
    }

    // ------------------------------------------------------------------
    // Signaling
    // ------------------------------------------------------------------

    fn process_signaling(
        &mut self,
        stream_id: PublisherId,
        peer_id: Option<SubscriberId>,
        message: SignalingMessage,
    ) {
        let Some(record) = self.publishers.get_mut(&stream_id) else {
            debug!(
                target: "sfu.room.coordinator",
                stream_id = %stream_id,
                "Signaling for unknown stream, dropping"
            );
            return;
        };

        // Signaling addressed to a tracked subscriber is deliberately left out
        // of the context: a migration only rebuilds the publisher connection.
        // Peers that are not subscribers of the stream count as the publisher.
        let for_subscriber = peer_id
            .as_ref()
            .is_some_and(|peer| record.subscribers.contains(peer));
        if !for_subscriber {
            record.context.record(&message);
        }

        let Some(worker_id) = record.worker().cloned() else {
            debug!(
                target: "sfu.room.coordinator",
                stream_id = %stream_id,
                "Stream has no worker, signaling not forwarded"
            );
            return;
        };

        observability::record_signaling_forwarded(message.kind());
        self.dispatch(
            &worker_id,
            WorkerCall::ProcessSignaling {
                stream_id,
                peer_id,
                message,
            },
        );
    }

    // ------------------------------------------------------------------
    // Migration
    // ------------------------------------------------------------------

    fn start_migration(&mut self, publisher_id: PublisherId, respond_to: StreamReply) {
        let (old_worker, epoch) = match self.publishers.get_mut(&publisher_id) {
            None => {
                let _ = respond_to.send(Err(RoomError::PublisherNotFound(publisher_id.to_string())));
                return;
            }
            Some(record) if record.migrating => {
                let _ = respond_to.send(Err(RoomError::MigrationInProgress(
                    publisher_id.to_string(),
                )));
                return;
            }
            Some(record) => match record.worker().cloned() {
                Some(worker_id) => {
                    record.migrating = true;
                    (worker_id, record.epoch)
                }
                None => {
                    let _ = respond_to.send(Err(RoomError::NoWorker(publisher_id.to_string())));
                    return;
                }
            },
        };

        info!(
            target: "sfu.room.coordinator",
            room_id = %self.room_id,
            publisher_id = %publisher_id,
            worker_id = %old_worker,
            "Moving publisher, fetching SRTP session"
        );

        let (srtp_tx, srtp_rx) = oneshot::channel();
        self.dispatch(
            &old_worker,
            WorkerCall::GetSrtpSession {
                publisher_id: publisher_id.clone(),
                respond_to: srtp_tx,
            },
        );

        let continuations = self.continuations_tx.clone();
        tokio::spawn(async move {
            let result = srtp_rx.await.unwrap_or_else(|e| {
                Err(RoomError::Internal(format!("response receive failed: {e}")))
            });
            let _ = continuations.send(Continuation::SrtpReceived {
                publisher_id,
                epoch,
                result,
                respond_to,
            });
        });
    }

    fn on_srtp_received(
        &mut self,
        publisher_id: PublisherId,
        epoch: u64,
        result: Result<Option<SrtpSession>, RoomError>,
        respond_to: StreamReply,
    ) {
        let Some(record) = self
            .publishers
            .get_mut(&publisher_id)
            .filter(|record| record.epoch == epoch && record.migrating)
        else {
            observability::record_migration(false);
            let _ = respond_to.send(Err(RoomError::PublisherNotFound(publisher_id.to_string())));
            return;
        };

        match result {
            Ok(session) => {
                debug!(
                    target: "sfu.room.coordinator",
                    publisher_id = %publisher_id,
                    has_srtp = session.is_some(),
                    "Received SRTP session, creating new worker"
                );
                if let Some(session) = session {
                    record.context.srtp_session = Some(session);
                }
                self.spawn_worker_creation(
                    publisher_id,
                    epoch,
                    PendingPlacement::Migration { respond_to },
                );
            }
            Err(e) => {
                warn!(
                    target: "sfu.room.coordinator",
                    room_id = %self.room_id,
                    publisher_id = %publisher_id,
                    error = %e,
                    "Failed to fetch SRTP session, migration aborted"
                );
                record.migrating = false;
                observability::record_migration(false);
                let _ = respond_to.send(Err(e));
            }
        }
    }

    // ------------------------------------------------------------------
    // Keepalive
    // ------------------------------------------------------------------

    /// Ping the worker of every placed publisher, one ping per publisher.
    fn send_keep_alives(&mut self) {
        for (publisher_id, record) in &self.publishers {
            let Some(worker_id) = record.worker() else {
                continue;
            };
            *self.pings_in_flight.entry(worker_id.clone()).or_insert(0) += 1;

            let client = Arc::clone(&self.client);
            let continuations = self.continuations_tx.clone();
            let worker_id = worker_id.clone();
            let publisher_id = publisher_id.clone();

            tokio::spawn(async move {
                let alive = match client.keep_alive(&worker_id).await {
                    Ok(alive) => alive,
                    Err(e) => {
                        debug!(
                            target: "sfu.room.coordinator",
                            worker_id = %worker_id,
                            publisher_id = %publisher_id,
                            error = %e,
                            "Keepalive failed"
                        );
                        false
                    }
                };
                let _ = continuations.send(Continuation::KeepAliveAnswered { worker_id, alive });
            });
        }
    }

    fn on_keep_alive_answered(&mut self, worker_id: WorkerId, alive: bool) {
        let still_waiting = match self.pings_in_flight.get_mut(&worker_id) {
            Some(count) => {
                *count = count.saturating_sub(1);
                *count > 0
            }
            None => false,
        };
        if !still_waiting {
            self.pings_in_flight.remove(&worker_id);
        }

        if !alive {
            self.retire_worker(&worker_id);
        }

        if !still_waiting {
            self.retired.remove(&worker_id);
        }
    }

    /// Handle one failed ping for `worker_id`.
    fn retire_worker(&mut self, worker_id: &WorkerId) {
        warn!(
            target: "sfu.room.coordinator",
            room_id = %self.room_id,
            worker_id = %worker_id,
            "Worker failed keepalive"
        );

        let event = RoomEvent::Unpublish {
            worker_id: worker_id.clone(),
        };
        observability::record_event(event.event_type());
        self.listeners.dispatch(&event);

        if self.retired.insert(worker_id.clone()) {
            observability::record_worker_failure();
            self.spawn_worker_deletion(worker_id.clone());
        }

        let mut unmapped = 0usize;
        for record in self.publishers.values_mut() {
            if record.worker() == Some(worker_id) {
                record.placement = Placement::Unmapped;
                unmapped += 1;
            }
        }
        if unmapped > 0 {
            info!(
                target: "sfu.room.coordinator",
                room_id = %self.room_id,
                worker_id = %worker_id,
                publishers = unmapped,
                "Publishers unmapped from failed worker"
            );
        }

        if self.outboxes.remove(worker_id).is_some() {
            observability::set_workers_active(self.outboxes.len());
        }
    }

    fn state(&self) -> RoomState {
        let mut publishers: Vec<PublisherInfo> = self
            .publishers
            .iter()
            .map(|(publisher_id, record)| {
                let mut subscribers: Vec<SubscriberId> =
                    record.subscribers.iter().cloned().collect();
                subscribers.sort();

                PublisherInfo {
                    publisher_id: publisher_id.clone(),
                    worker_id: record.worker().cloned(),
                    pending: record.placement == Placement::Pending,
                    migrating: record.migrating,
                    subscribers,
                    context: record.context.clone(),
                }
            })
            .collect();
        publishers.sort_by(|a, b| a.publisher_id.cmp(&b.publisher_id));

        let mut external_outputs: Vec<(String, PublisherId)> = self
            .external_outputs
            .iter()
            .map(|(url, publisher_id)| (url.clone(), publisher_id.clone()))
            .collect();
        external_outputs.sort();

        let mut workers: Vec<WorkerId> = self.outboxes.keys().cloned().collect();
        workers.sort();

        let mut backlogged_workers: Vec<WorkerId> = self
            .outboxes
            .iter()
            .filter(|(_, outbox)| outbox.backlog() != Backlog::Normal)
            .map(|(worker_id, _)| worker_id.clone())
            .collect();
        backlogged_workers.sort();

        RoomState {
            room_id: self.room_id.clone(),
            publishers,
            external_outputs,
            workers,
            backlogged_workers,
            event_listeners: self.listeners.len(),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use sfu_test_utils::{
        candidate, candidate_message, eventually, offer, test_sdp, test_srtp_session, BusCall,
        MockBus,
    };
    use std::sync::Mutex;
    use std::time::Duration;

    const KEEPALIVE: Duration = Duration::from_secs(1);

    fn pid(id: &str) -> PublisherId {
        PublisherId::from(id)
    }

    fn sid(id: &str) -> SubscriberId {
        SubscriberId::from(id)
    }

    fn wid(id: &str) -> WorkerId {
        WorkerId::from(id)
    }

    fn test_config(keepalive_interval: Duration) -> Config {
        Config {
            room_id: "room-test".to_string(),
            keepalive_interval,
        }
    }

    /// Coordinator whose keepalive never fires within a test.
    fn spawn_quiet(bus: &MockBus) -> CoordinatorHandle {
        let (handle, _task) = Coordinator::spawn(
            test_config(Duration::from_secs(3600)),
            bus.as_agent(),
            bus.as_client(),
        );
        handle
    }

    fn spawn_with_keepalive(bus: &MockBus) -> CoordinatorHandle {
        let (handle, _task) =
            Coordinator::spawn(test_config(KEEPALIVE), bus.as_agent(), bus.as_client());
        handle
    }

    fn count_calls(bus: &MockBus, matcher: impl Fn(&BusCall) -> bool) -> usize {
        bus.calls().iter().filter(|call| matcher(call)).count()
    }

    #[tokio::test]
    async fn test_add_publisher_creates_worker_and_relays_stream() {
        let bus = MockBus::new();
        let coordinator = spawn_quiet(&bus);

        let mut stream = coordinator.add_publisher(pid("p1")).await.unwrap().unwrap();
        assert_eq!(stream.recv().await, Some(SignalingMessage::Initializing));

        assert_eq!(
            bus.calls_without_keep_alive(),
            vec![
                BusCall::CreateWorker {
                    publisher_id: pid("p1")
                },
                BusCall::AddPublisher {
                    worker_id: wid("worker-1"),
                    publisher_id: pid("p1")
                },
            ]
        );

        let state = coordinator.get_state().await.unwrap();
        assert_eq!(state.room_id, "room-test");
        assert_eq!(state.worker_of(&pid("p1")), Some(&wid("worker-1")));
        assert_eq!(state.workers, vec![wid("worker-1")]);
    }

    #[tokio::test]
    async fn test_duplicate_publisher_returns_none() {
        let bus = MockBus::new();
        let coordinator = spawn_quiet(&bus);

        assert!(coordinator.add_publisher(pid("p1")).await.unwrap().is_some());
        assert!(coordinator.add_publisher(pid("p1")).await.unwrap().is_none());
        assert!(coordinator
            .add_external_input(pid("p1"), "rtsp://camera".to_string())
            .await
            .unwrap()
            .is_none());

        assert_eq!(bus.created_workers(), 1);
    }

    #[tokio::test]
    async fn test_worker_creation_failure_untracks_publisher() {
        let bus = MockBus::new();
        bus.fail_worker_creation(true);
        let coordinator = spawn_quiet(&bus);

        let result = coordinator.add_publisher(pid("p1")).await;
        assert!(matches!(result, Err(RoomError::WorkerCreation(_))));

        let state = coordinator.get_state().await.unwrap();
        assert!(state.publishers.is_empty());

        // The id can be placed again once workers are available.
        bus.fail_worker_creation(false);
        assert!(coordinator.add_publisher(pid("p1")).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_publisher_removed_while_pending_deletes_new_worker() {
        let bus = MockBus::new();
        bus.pause_creation();
        let coordinator = spawn_quiet(&bus);

        let adding = {
            let coordinator = coordinator.clone();
            tokio::spawn(async move { coordinator.add_publisher(pid("p1")).await })
        };
        eventually(|| bus.created_workers() == 1).await;

        let state = coordinator.get_state().await.unwrap();
        assert!(state.publisher(&pid("p1")).unwrap().pending);

        coordinator.remove_publisher(pid("p1")).await.unwrap();
        // Drain the removal before letting creation finish.
        coordinator.get_state().await.unwrap();
        bus.resume_creation();

        let result = adding.await.unwrap();
        assert!(matches!(result, Err(RoomError::PublisherNotFound(_))));
        eventually(|| bus.deleted_workers() == vec![wid("worker-1")]).await;
        assert_eq!(
            count_calls(&bus, |call| matches!(call, BusCall::AddPublisher { .. })),
            0
        );
    }

    #[tokio::test]
    async fn test_subscriber_added_once() {
        let bus = MockBus::new();
        let coordinator = spawn_quiet(&bus);
        coordinator.add_publisher(pid("p1")).await.unwrap();

        let first = coordinator
            .add_subscriber(sid("s1"), pid("p1"), SubscribeOptions::default())
            .await
            .unwrap();
        let second = coordinator
            .add_subscriber(sid("s1"), pid("p1"), SubscribeOptions::default())
            .await
            .unwrap();

        assert!(first.is_some());
        assert!(second.is_none());
        assert_eq!(
            count_calls(&bus, |call| matches!(call, BusCall::AddSubscriber { .. })),
            1
        );

        let state = coordinator.get_state().await.unwrap();
        assert_eq!(state.publisher(&pid("p1")).unwrap().subscribers, vec![sid("s1")]);
    }

    #[tokio::test]
    async fn test_subscriber_options_reach_worker() {
        let bus = MockBus::new();
        let coordinator = spawn_quiet(&bus);
        coordinator.add_publisher(pid("p1")).await.unwrap();

        coordinator
            .add_subscriber(
                sid("s1"),
                pid("p1"),
                SubscribeOptions {
                    audio: true,
                    video: false,
                },
            )
            .await
            .unwrap();

        assert!(bus.calls().contains(&BusCall::AddSubscriber {
            worker_id: wid("worker-1"),
            subscriber_id: sid("s1"),
            publisher_id: pid("p1"),
            audio: true,
            video: false,
        }));
    }

    #[tokio::test]
    async fn test_subscriber_for_unknown_publisher_sends_nothing() {
        let bus = MockBus::new();
        let coordinator = spawn_quiet(&bus);

        let stream = coordinator
            .add_subscriber(sid("s1"), pid("ghost"), SubscribeOptions::default())
            .await
            .unwrap();

        assert!(stream.is_none());
        assert!(bus.calls().is_empty());
    }

    #[tokio::test]
    async fn test_remove_subscriptions_detaches_from_every_publisher() {
        let bus = MockBus::new();
        let coordinator = spawn_quiet(&bus);
        for publisher in ["p1", "p2"] {
            coordinator.add_publisher(pid(publisher)).await.unwrap();
            coordinator
                .add_subscriber(sid("s1"), pid(publisher), SubscribeOptions::default())
                .await
                .unwrap();
        }
        coordinator
            .add_subscriber(sid("s2"), pid("p1"), SubscribeOptions::default())
            .await
            .unwrap();

        coordinator.remove_subscriptions(sid("s1")).await.unwrap();

        eventually(|| {
            count_calls(&bus, |call| {
                matches!(call, BusCall::RemoveSubscriber { subscriber_id, .. } if subscriber_id == &sid("s1"))
            }) == 2
        })
        .await;

        let state = coordinator.get_state().await.unwrap();
        assert_eq!(state.publisher(&pid("p1")).unwrap().subscribers, vec![sid("s2")]);
        assert!(state.publisher(&pid("p2")).unwrap().subscribers.is_empty());
    }

    #[tokio::test]
    async fn test_remove_unknown_subscriber_sends_nothing() {
        let bus = MockBus::new();
        let coordinator = spawn_quiet(&bus);
        coordinator.add_publisher(pid("p1")).await.unwrap();

        coordinator
            .remove_subscriber(sid("nobody"), pid("p1"))
            .await
            .unwrap();
        coordinator.get_state().await.unwrap();

        assert_eq!(
            count_calls(&bus, |call| matches!(call, BusCall::RemoveSubscriber { .. })),
            0
        );
    }

    #[tokio::test]
    async fn test_external_output_lifecycle() {
        let bus = MockBus::new();
        let coordinator = spawn_quiet(&bus);
        coordinator.add_publisher(pid("p1")).await.unwrap();

        coordinator
            .add_external_output(pid("p1"), "file:///rec/p1.mkv".to_string())
            .await
            .unwrap();
        let state = coordinator.get_state().await.unwrap();
        assert_eq!(
            state.external_outputs,
            vec![("file:///rec/p1.mkv".to_string(), pid("p1"))]
        );

        coordinator
            .remove_external_output("file:///rec/p1.mkv".to_string())
            .await
            .unwrap();

        eventually(|| {
            bus.calls_to(&wid("worker-1")).contains(&BusCall::RemoveExternalOutput {
                worker_id: wid("worker-1"),
                publisher_id: pid("p1"),
                url: "file:///rec/p1.mkv".to_string(),
            })
        })
        .await;
        assert_eq!(
            count_calls(&bus, |call| matches!(call, BusCall::AddExternalOutput { .. })),
            1
        );
        assert!(coordinator
            .get_state()
            .await
            .unwrap()
            .external_outputs
            .is_empty());
    }

    #[tokio::test]
    async fn test_external_output_for_unknown_publisher_fails() {
        let bus = MockBus::new();
        let coordinator = spawn_quiet(&bus);

        let result = coordinator
            .add_external_output(pid("ghost"), "file:///rec/ghost.mkv".to_string())
            .await;

        assert!(matches!(result, Err(RoomError::PublisherNotFound(_))));
        assert!(bus.calls().is_empty());
    }

    #[tokio::test]
    async fn test_remove_unrecorded_output_changes_nothing() {
        let bus = MockBus::new();
        let coordinator = spawn_quiet(&bus);
        coordinator.add_publisher(pid("p1")).await.unwrap();
        coordinator
            .add_external_output(pid("p1"), "file:///rec/p1.mkv".to_string())
            .await
            .unwrap();
        let before = coordinator.get_state().await.unwrap();

        let result = coordinator
            .remove_external_output("file:///rec/other.mkv".to_string())
            .await;

        assert!(matches!(result, Err(RoomError::NotRecorded)));
        assert_eq!(result.unwrap_err().to_string(), "This stream is not being recorded");
        assert_eq!(coordinator.get_state().await.unwrap(), before);
        assert_eq!(
            count_calls(&bus, |call| matches!(call, BusCall::RemoveExternalOutput { .. })),
            0
        );
    }

    #[tokio::test]
    async fn test_external_input_relays_init_status() {
        let bus = MockBus::new();
        bus.set_input_status(InitStatus::Failed { code: -1 });
        let coordinator = spawn_quiet(&bus);

        let status = coordinator
            .add_external_input(pid("cam"), "rtsp://camera/1".to_string())
            .await
            .unwrap();

        assert_eq!(status, Some(InitStatus::Failed { code: -1 }));
        assert!(bus.calls().contains(&BusCall::AddExternalInput {
            worker_id: wid("worker-1"),
            publisher_id: pid("cam"),
            url: "rtsp://camera/1".to_string(),
        }));
    }

    #[tokio::test]
    async fn test_remove_publisher_tears_down_worker_state() {
        let bus = MockBus::new();
        let coordinator = spawn_quiet(&bus);
        coordinator.add_publisher(pid("p1")).await.unwrap();
        coordinator
            .add_external_output(pid("p1"), "file:///rec/p1.mkv".to_string())
            .await
            .unwrap();

        coordinator.remove_publisher(pid("p1")).await.unwrap();

        eventually(|| {
            bus.calls().contains(&BusCall::RemovePublisher {
                worker_id: wid("worker-1"),
                publisher_id: pid("p1"),
            })
        })
        .await;
        let state = coordinator.get_state().await.unwrap();
        assert!(state.publishers.is_empty());
        assert!(state.external_outputs.is_empty());
        assert!(state.workers.is_empty());
        // Workers are released by the session controller itself.
        assert!(bus.deleted_workers().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_signaling_for_new_subscriber_follows_add_subscriber() {
        let bus = MockBus::new();
        let coordinator = spawn_quiet(&bus);
        coordinator.add_publisher(pid("p1")).await.unwrap();
        bus.set_call_delay(Duration::from_millis(100));

        let (added, sent) = tokio::join!(
            coordinator.add_subscriber(sid("s1"), pid("p1"), SubscribeOptions::default()),
            async {
                tokio::task::yield_now().await;
                coordinator
                    .process_signaling(pid("p1"), Some(sid("s1")), candidate_message(7))
                    .await
            }
        );
        assert!(added.unwrap().is_some());
        sent.unwrap();

        eventually(|| bus.calls_to(&wid("worker-1")).len() == 3).await;
        let calls = bus.calls_to(&wid("worker-1"));
        assert!(matches!(calls.get(1), Some(BusCall::AddSubscriber { .. })));
        assert!(matches!(
            calls.get(2),
            Some(BusCall::ProcessSignaling { peer_id: Some(_), .. })
        ));
    }

    #[tokio::test]
    async fn test_publisher_signaling_recorded_in_context() {
        let bus = MockBus::new();
        let coordinator = spawn_quiet(&bus);
        coordinator.add_publisher(pid("p1")).await.unwrap();
        coordinator
            .add_subscriber(sid("s1"), pid("p1"), SubscribeOptions::default())
            .await
            .unwrap();

        coordinator
            .process_signaling(pid("p1"), None, offer(&test_sdp("pub")))
            .await
            .unwrap();
        coordinator
            .process_signaling(pid("p1"), None, candidate_message(1))
            .await
            .unwrap();
        coordinator
            .process_signaling(pid("p1"), Some(sid("s1")), candidate_message(2))
            .await
            .unwrap();

        let state = coordinator.get_state().await.unwrap();
        let context = &state.publisher(&pid("p1")).unwrap().context;
        assert_eq!(context.remote_sdp, Some(test_sdp("pub")));
        assert_eq!(context.pending_candidates, vec![candidate(1)]);

        eventually(|| {
            count_calls(&bus, |call| matches!(call, BusCall::ProcessSignaling { .. })) == 3
        })
        .await;
    }

    #[tokio::test]
    async fn test_signaling_for_unknown_stream_dropped() {
        let bus = MockBus::new();
        let coordinator = spawn_quiet(&bus);

        coordinator
            .process_signaling(pid("ghost"), None, candidate_message(1))
            .await
            .unwrap();
        coordinator.get_state().await.unwrap();

        assert!(bus.calls().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_keepalive_pings_every_placed_worker() {
        let bus = MockBus::new();
        let coordinator = spawn_with_keepalive(&bus);
        coordinator.add_publisher(pid("p1")).await.unwrap();
        coordinator.add_publisher(pid("p2")).await.unwrap();

        tokio::time::sleep(KEEPALIVE * 3 + Duration::from_millis(10)).await;

        assert_eq!(bus.keep_alive_count(&wid("worker-1")), 3);
        assert_eq!(bus.keep_alive_count(&wid("worker-2")), 3);
        assert!(bus.deleted_workers().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_unreachable_worker_unpublished_and_deleted() {
        let bus = MockBus::new();
        let coordinator = spawn_with_keepalive(&bus);
        let events = Arc::new(Mutex::new(Vec::new()));
        {
            let events = Arc::clone(&events);
            coordinator
                .add_event_listener(move |_, event| events.lock().unwrap().push(event.clone()))
                .await
                .unwrap();
        }
        coordinator.add_publisher(pid("p1")).await.unwrap();
        coordinator.add_publisher(pid("p2")).await.unwrap();
        bus.kill_worker(&wid("worker-1"));

        eventually(|| bus.deleted_workers() == vec![wid("worker-1")]).await;
        tokio::time::sleep(KEEPALIVE * 3).await;

        assert_eq!(
            *events.lock().unwrap(),
            vec![RoomEvent::Unpublish {
                worker_id: wid("worker-1")
            }]
        );
        // Unmapped publishers are not pinged again.
        assert_eq!(bus.keep_alive_count(&wid("worker-1")), 1);
        assert_eq!(bus.deleted_workers(), vec![wid("worker-1")]);

        let state = coordinator.get_state().await.unwrap();
        let p1 = state.publisher(&pid("p1")).unwrap();
        assert_eq!(p1.worker_id, None);
        assert!(!p1.pending);
        assert_eq!(state.worker_of(&pid("p2")), Some(&wid("worker-2")));
        assert_eq!(state.workers, vec![wid("worker-2")]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_worker_reporting_not_alive_is_treated_as_failed() {
        let bus = MockBus::new();
        let coordinator = spawn_with_keepalive(&bus);
        coordinator.add_publisher(pid("p1")).await.unwrap();
        bus.report_not_alive(&wid("worker-1"));

        eventually(|| bus.deleted_workers() == vec![wid("worker-1")]).await;

        let state = coordinator.get_state().await.unwrap();
        assert_eq!(state.worker_of(&pid("p1")), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unmapped_publisher_ignores_subscribers_and_migration() {
        let bus = MockBus::new();
        let coordinator = spawn_with_keepalive(&bus);
        coordinator.add_publisher(pid("p1")).await.unwrap();
        bus.kill_worker(&wid("worker-1"));
        eventually(|| bus.deleted_workers().len() == 1).await;

        let subscriber = coordinator
            .add_subscriber(sid("s1"), pid("p1"), SubscribeOptions::default())
            .await
            .unwrap();
        let moved = coordinator.move_publisher(pid("p1")).await;
        let output = coordinator
            .add_external_output(pid("p1"), "file:///rec/p1.mkv".to_string())
            .await;

        assert!(subscriber.is_none());
        assert!(matches!(moved, Err(RoomError::NoWorker(_))));
        assert!(matches!(output, Err(RoomError::NoWorker(_))));
    }

    #[tokio::test]
    async fn test_failed_pings_for_shared_worker_delete_it_once() {
        let bus = MockBus::new();
        let (mut coordinator, _handle) = Coordinator::new(
            test_config(KEEPALIVE),
            bus.as_agent(),
            bus.as_client(),
        );
        let events = Arc::new(Mutex::new(0usize));
        {
            let events = Arc::clone(&events);
            coordinator.listeners.push(Box::new(move |_: &str, _: &RoomEvent| {
                *events.lock().unwrap() += 1;
            }));
        }
        for publisher in ["p1", "p2"] {
            coordinator.publishers.insert(
                pid(publisher),
                PublisherRecord {
                    placement: Placement::Assigned(wid("worker-1")),
                    subscribers: HashSet::new(),
                    context: SignalingContext::default(),
                    migrating: false,
                    epoch: 1,
                },
            );
        }
        coordinator.pings_in_flight.insert(wid("worker-1"), 2);

        coordinator.on_keep_alive_answered(wid("worker-1"), false);
        coordinator.on_keep_alive_answered(wid("worker-1"), false);

        assert_eq!(*events.lock().unwrap(), 2);
        assert!(coordinator
            .publishers
            .values()
            .all(|record| record.placement == Placement::Unmapped));
        assert!(coordinator.pings_in_flight.is_empty());
        assert!(coordinator.retired.is_empty());

        eventually(|| !bus.deleted_workers().is_empty()).await;
        tokio::task::yield_now().await;
        assert_eq!(bus.deleted_workers(), vec![wid("worker-1")]);
    }

    #[tokio::test]
    async fn test_move_publisher_rebuilds_on_new_worker() {
        let bus = MockBus::new();
        bus.set_srtp_session(test_srtp_session());
        let coordinator = spawn_quiet(&bus);
        coordinator.add_publisher(pid("p1")).await.unwrap();
        coordinator
            .add_subscriber(sid("s1"), pid("p1"), SubscribeOptions::default())
            .await
            .unwrap();
        coordinator
            .process_signaling(pid("p1"), None, offer(&test_sdp("pub")))
            .await
            .unwrap();
        coordinator
            .process_signaling(pid("p1"), None, candidate_message(1))
            .await
            .unwrap();

        let stream = coordinator.move_publisher(pid("p1")).await.unwrap();
        assert!(stream.is_some());

        let calls = bus.calls_without_keep_alive();
        assert!(calls.contains(&BusCall::GetSrtpSession {
            worker_id: wid("worker-1"),
            publisher_id: pid("p1"),
            peer_id: None,
        }));
        assert_eq!(bus.created_workers(), 2);

        let moved = calls
            .iter()
            .find_map(|call| match call {
                BusCall::MovePublisher {
                    worker_id, context, ..
                } => Some((worker_id.clone(), context.clone())),
                _ => None,
            })
            .unwrap();
        assert_eq!(moved.0, wid("worker-2"));
        assert_eq!(moved.1.remote_sdp, Some(test_sdp("pub")));
        assert_eq!(moved.1.pending_candidates, vec![candidate(1)]);
        assert_eq!(moved.1.srtp_session, Some(test_srtp_session()));

        coordinator
            .process_signaling(pid("p1"), None, candidate_message(2))
            .await
            .unwrap();
        eventually(|| {
            bus.calls_to(&wid("worker-2")).contains(&BusCall::ProcessSignaling {
                worker_id: wid("worker-2"),
                stream_id: pid("p1"),
                peer_id: None,
                message: candidate_message(2),
            })
        })
        .await;

        let state = coordinator.get_state().await.unwrap();
        let p1 = state.publisher(&pid("p1")).unwrap();
        assert_eq!(p1.worker_id, Some(wid("worker-2")));
        assert!(!p1.migrating);
        assert_eq!(p1.subscribers, vec![sid("s1")]);
        // The old worker is left running.
        assert!(bus.deleted_workers().is_empty());
    }

    #[tokio::test]
    async fn test_move_publisher_while_migrating_rejected() {
        let bus = MockBus::new();
        let coordinator = spawn_quiet(&bus);
        coordinator.add_publisher(pid("p1")).await.unwrap();
        bus.pause_creation();

        let first = {
            let coordinator = coordinator.clone();
            tokio::spawn(async move { coordinator.move_publisher(pid("p1")).await })
        };
        eventually(|| bus.created_workers() == 2).await;

        let second = coordinator.move_publisher(pid("p1")).await;
        assert!(matches!(second, Err(RoomError::MigrationInProgress(_))));
        assert!(coordinator
            .get_state()
            .await
            .unwrap()
            .publisher(&pid("p1"))
            .unwrap()
            .migrating);

        bus.resume_creation();
        assert!(first.await.unwrap().unwrap().is_some());
    }

    #[tokio::test]
    async fn test_move_unknown_publisher_fails() {
        let bus = MockBus::new();
        let coordinator = spawn_quiet(&bus);

        let result = coordinator.move_publisher(pid("ghost")).await;

        assert!(matches!(result, Err(RoomError::PublisherNotFound(_))));
        assert!(bus.calls().is_empty());
    }

    #[tokio::test]
    async fn test_move_aborted_when_old_worker_unreachable() {
        let bus = MockBus::new();
        let coordinator = spawn_quiet(&bus);
        coordinator.add_publisher(pid("p1")).await.unwrap();
        bus.kill_worker(&wid("worker-1"));

        let result = coordinator.move_publisher(pid("p1")).await;

        assert!(matches!(result, Err(RoomError::Bus(BusError::Unreachable(_)))));
        assert_eq!(bus.created_workers(), 1);
        let state = coordinator.get_state().await.unwrap();
        let p1 = state.publisher(&pid("p1")).unwrap();
        assert!(!p1.migrating);
        assert_eq!(p1.worker_id, Some(wid("worker-1")));
    }

    #[tokio::test]
    async fn test_listeners_registered_in_state() {
        let bus = MockBus::new();
        let coordinator = spawn_quiet(&bus);

        coordinator.add_event_listener(|_, _| {}).await.unwrap();
        coordinator.add_event_listener(|_, _| {}).await.unwrap();

        assert_eq!(coordinator.get_state().await.unwrap().event_listeners, 2);
    }

    #[tokio::test]
    async fn test_cancelled_coordinator_rejects_calls() {
        let bus = MockBus::new();
        let (coordinator, task) = Coordinator::spawn(
            test_config(Duration::from_secs(3600)),
            bus.as_agent(),
            bus.as_client(),
        );

        coordinator.cancel();
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();

        assert!(coordinator.is_cancelled());
        assert!(matches!(
            coordinator.add_publisher(pid("p1")).await,
            Err(RoomError::Internal(_))
        ));
    }

    #[tokio::test]
    async fn test_stalled_worker_does_not_block_coordinator() {
        let bus = MockBus::new();
        let coordinator = spawn_quiet(&bus);
        coordinator.add_publisher(pid("p1")).await.unwrap().unwrap();
        bus.set_call_delay(Duration::from_secs(3600));

        // The worker never answers; everything after this queues behind it.
        let stalled = tokio::time::timeout(
            Duration::from_millis(50),
            coordinator.add_subscriber(sid("s1"), pid("p1"), SubscribeOptions::default()),
        )
        .await;
        assert!(stalled.is_err());

        for n in 0..250 {
            coordinator
                .process_signaling(pid("p1"), None, candidate_message(n))
                .await
                .unwrap();
        }
        coordinator
            .add_external_output(pid("p1"), "file:///rec/p1.mkv".to_string())
            .await
            .unwrap();

        let state = tokio::time::timeout(Duration::from_secs(2), coordinator.get_state())
            .await
            .expect("coordinator stopped answering")
            .unwrap();
        let publisher = state.publisher(&pid("p1")).unwrap();
        assert_eq!(publisher.subscribers, vec![sid("s1")]);
        assert_eq!(publisher.context.pending_candidates.len(), 250);
        assert_eq!(state.backlogged_workers, vec![wid("worker-1")]);
    }

    #[tokio::test]
    async fn test_mailbox_depth_counts_messages_not_yet_handled() {
        let bus = MockBus::new();
        let (coordinator, handle) = Coordinator::new(
            test_config(Duration::from_secs(3600)),
            bus.as_agent(),
            bus.as_client(),
        );

        for n in 0..3 {
            handle
                .process_signaling(pid("p1"), None, candidate_message(n))
                .await
                .unwrap();
        }
        assert_eq!(handle.mailbox.queued(), 3);

        tokio::spawn(coordinator.run());
        handle.get_state().await.unwrap();

        assert_eq!(handle.mailbox.queued(), 0);
        assert_eq!(handle.mailbox.high_water(), 4);
        assert_eq!(handle.mailbox.messages_processed(), 4);
    }
}
