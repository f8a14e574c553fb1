//! Per-worker ordered call queue.
//!
//! Every call the coordinator makes to one worker goes through that worker's
//! outbox, which executes them one at a time in enqueue order. A subscriber
//! added to a worker is therefore always known there before signaling for it
//! arrives. Keepalive pings do not go through the outbox.
//!
//! The queue is unbounded: enqueueing never waits, so a worker that stops
//! answering only backs up its own outbox, never the coordinator.
//!
//! The outbox stops once its handle is dropped and the queue has drained, or
//! when the coordinator is cancelled.

use crate::errors::RoomError;

use common::bus::WorkerClient;
use common::error::BusError;
use common::mailbox::{ActorType, Backlog, MailboxMonitor};
use common::signaling::{InitStatus, SignalingContext, SignalingMessage, SignalingStream, SrtpSession};
use common::types::{PublisherId, SubscriberId, WorkerId};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

type Reply<T> = oneshot::Sender<Result<T, RoomError>>;

/// One queued worker call. Calls without `respond_to` are fire-and-forget.
pub(crate) enum WorkerCall {
    AddPublisher {
        publisher_id: PublisherId,
        respond_to: Reply<Option<SignalingStream>>,
    },
    AddExternalInput {
        publisher_id: PublisherId,
        url: String,
        respond_to: Reply<Option<InitStatus>>,
    },
    MovePublisher {
        publisher_id: PublisherId,
        context: SignalingContext,
        respond_to: Reply<Option<SignalingStream>>,
    },
    AddSubscriber {
        subscriber_id: SubscriberId,
        publisher_id: PublisherId,
        audio: bool,
        video: bool,
        respond_to: Reply<Option<SignalingStream>>,
    },
    GetSrtpSession {
        publisher_id: PublisherId,
        respond_to: Reply<Option<SrtpSession>>,
    },
    AddExternalOutput {
        publisher_id: PublisherId,
        url: String,
    },
    RemoveExternalOutput {
        publisher_id: PublisherId,
        url: String,
    },
    ProcessSignaling {
        stream_id: PublisherId,
        peer_id: Option<SubscriberId>,
        message: SignalingMessage,
    },
    RemovePublisher {
        publisher_id: PublisherId,
    },
    RemoveSubscriber {
        subscriber_id: SubscriberId,
        publisher_id: PublisherId,
    },
}

impl WorkerCall {
    const fn name(&self) -> &'static str {
        match self {
            WorkerCall::AddPublisher { .. } => "addPublisher",
            WorkerCall::AddExternalInput { .. } => "addExternalInput",
            WorkerCall::MovePublisher { .. } => "movePublisher",
            WorkerCall::AddSubscriber { .. } => "addSubscriber",
            WorkerCall::GetSrtpSession { .. } => "getSrtpSession",
            WorkerCall::AddExternalOutput { .. } => "addExternalOutput",
            WorkerCall::RemoveExternalOutput { .. } => "removeExternalOutput",
            WorkerCall::ProcessSignaling { .. } => "processSignaling",
            WorkerCall::RemovePublisher { .. } => "removePublisher",
            WorkerCall::RemoveSubscriber { .. } => "removeSubscriber",
        }
    }
}

/// Sending side of a worker's outbox.
pub(crate) struct OutboxHandle {
    sender: mpsc::UnboundedSender<WorkerCall>,
    worker_id: WorkerId,
    mailbox: Arc<MailboxMonitor>,
}

impl OutboxHandle {
    /// Spawn the outbox task for `worker_id`.
    pub(crate) fn spawn(
        worker_id: WorkerId,
        client: Arc<dyn WorkerClient>,
        cancel_token: CancellationToken,
    ) -> (Self, JoinHandle<()>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        let mailbox = Arc::new(MailboxMonitor::new(ActorType::Outbox, worker_id.as_str()));

        let outbox = Outbox {
            mailbox: Arc::clone(&mailbox),
            worker_id: worker_id.clone(),
            client,
            receiver,
            cancel_token,
        };
        let task_handle = tokio::spawn(outbox.run());

        (
            Self {
                sender,
                worker_id,
                mailbox,
            },
            task_handle,
        )
    }

    /// Queue a call without waiting. Fails only if the outbox already stopped.
    pub(crate) fn enqueue(&self, call: WorkerCall) -> Result<(), RoomError> {
        self.mailbox.record_enqueue();
        self.sender.send(call).map_err(|e| {
            self.mailbox.record_send_failed();
            RoomError::Internal(format!(
                "outbox for {} closed: {}",
                self.worker_id,
                e.0.name()
            ))
        })
    }

    /// Calls queued or executing.
    pub(crate) fn queued(&self) -> usize {
        self.mailbox.queued()
    }

    pub(crate) fn backlog(&self) -> Backlog {
        self.mailbox.backlog()
    }
}

struct Outbox {
    worker_id: WorkerId,
    client: Arc<dyn WorkerClient>,
    receiver: mpsc::UnboundedReceiver<WorkerCall>,
    cancel_token: CancellationToken,
    mailbox: Arc<MailboxMonitor>,
}

impl Outbox {
    #[instrument(skip_all, name = "sfu.room.outbox", fields(worker_id = %self.worker_id))]
    async fn run(mut self) {
        debug!(
            target: "sfu.room.outbox",
            worker_id = %self.worker_id,
            "Outbox started"
        );

        loop {
            tokio::select! {
                () = self.cancel_token.cancelled() => break,

                call = self.receiver.recv() => {
                    match call {
                        Some(call) => {
                            self.execute(call).await;
                            self.mailbox.record_dequeue();
                        }
                        None => break,
                    }
                }
            }
        }

        debug!(
            target: "sfu.room.outbox",
            worker_id = %self.worker_id,
            calls = self.mailbox.messages_processed(),
            "Outbox stopped"
        );
    }

    async fn execute(&self, call: WorkerCall) {
        let name = call.name();
        let worker = &self.worker_id;
        let client = &self.client;

        match call {
            WorkerCall::AddPublisher {
                publisher_id,
                respond_to,
            } => {
                let result = client.add_publisher(worker, &publisher_id).await;
                let _ = respond_to.send(result.map_err(RoomError::from));
            }

            WorkerCall::AddExternalInput {
                publisher_id,
                url,
                respond_to,
            } => {
                let result = client.add_external_input(worker, &publisher_id, &url).await;
                let _ = respond_to.send(result.map_err(RoomError::from));
            }

            WorkerCall::MovePublisher {
                publisher_id,
                context,
                respond_to,
            } => {
                let result = client.move_publisher(worker, &publisher_id, context).await;
                let _ = respond_to.send(result.map_err(RoomError::from));
            }

            WorkerCall::AddSubscriber {
                subscriber_id,
                publisher_id,
                audio,
                video,
                respond_to,
            } => {
                let result = client
                    .add_subscriber(worker, &subscriber_id, &publisher_id, audio, video)
                    .await;
                let _ = respond_to.send(result.map_err(RoomError::from));
            }

            WorkerCall::GetSrtpSession {
                publisher_id,
                respond_to,
            } => {
                let result = client.get_srtp_session(worker, &publisher_id, None).await;
                let _ = respond_to.send(result.map_err(RoomError::from));
            }

            WorkerCall::AddExternalOutput { publisher_id, url } => {
                self.log_failure(name, client.add_external_output(worker, &publisher_id, &url).await);
            }

            WorkerCall::RemoveExternalOutput { publisher_id, url } => {
                self.log_failure(
                    name,
                    client.remove_external_output(worker, &publisher_id, &url).await,
                );
            }

            WorkerCall::ProcessSignaling {
                stream_id,
                peer_id,
                message,
            } => {
                self.log_failure(
                    name,
                    client
                        .process_signaling(worker, &stream_id, peer_id.as_ref(), message)
                        .await,
                );
            }

            WorkerCall::RemovePublisher { publisher_id } => {
                self.log_failure(name, client.remove_publisher(worker, &publisher_id).await);
            }

            WorkerCall::RemoveSubscriber {
                subscriber_id,
                publisher_id,
            } => {
                self.log_failure(
                    name,
                    client
                        .remove_subscriber(worker, &subscriber_id, &publisher_id)
                        .await,
                );
            }
        }
    }

    /// Fire-and-forget calls have nobody to report to.
    fn log_failure(&self, call: &'static str, result: Result<(), BusError>) {
        if let Err(e) = result {
            warn!(
                target: "sfu.room.outbox",
                worker_id = %self.worker_id,
                call,
                error = %e,
                "Worker call failed"
            );
        }
    }
}
