//! Recording Worker Process Manager and Message Bus.
//!
//! `MockBus` implements both [`WorkerAgent`] and [`WorkerClient`]. Every call
//! is appended to a log as a [`BusCall`] so coordinator tests can assert on
//! what reached which worker queue, and in which order.
//!
//! Workers are named `worker-1`, `worker-2`, ... in creation order. Calls
//! returning a signaling stream get a fresh stream pre-seeded with
//! `initializing`; its sending half is kept so tests can push more.
//!
//! Failure knobs:
//! - [`MockBus::kill_worker`]: every call to that worker fails as unreachable
//! - [`MockBus::report_not_alive`]: keepalive answers `false`
//! - [`MockBus::fail_worker_creation`]: `create_worker` fails
//! - [`MockBus::pause_creation`]: `create_worker` blocks until resumed
//! - [`MockBus::set_call_delay`]: stream-returning calls take this long,
//!   and are logged when they complete

use common::bus::{WorkerAgent, WorkerClient};
use common::error::BusError;
use common::signaling::{
    signaling_channel, InitStatus, SignalingContext, SignalingMessage, SignalingSink,
    SignalingStream, SrtpSession,
};
use common::types::{PublisherId, SubscriberId, WorkerId};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;

/// One call received by the mock.
#[derive(Debug, Clone, PartialEq)]
pub enum BusCall {
    CreateWorker {
        publisher_id: PublisherId,
    },
    DeleteWorker {
        worker_id: WorkerId,
    },
    KeepAlive {
        worker_id: WorkerId,
    },
    AddPublisher {
        worker_id: WorkerId,
        publisher_id: PublisherId,
    },
    AddExternalInput {
        worker_id: WorkerId,
        publisher_id: PublisherId,
        url: String,
    },
    AddExternalOutput {
        worker_id: WorkerId,
        publisher_id: PublisherId,
        url: String,
    },
    RemoveExternalOutput {
        worker_id: WorkerId,
        publisher_id: PublisherId,
        url: String,
    },
    GetSrtpSession {
        worker_id: WorkerId,
        publisher_id: PublisherId,
        peer_id: Option<SubscriberId>,
    },
    MovePublisher {
        worker_id: WorkerId,
        publisher_id: PublisherId,
        context: SignalingContext,
    },
    AddSubscriber {
        worker_id: WorkerId,
        subscriber_id: SubscriberId,
        publisher_id: PublisherId,
        audio: bool,
        video: bool,
    },
    ProcessSignaling {
        worker_id: WorkerId,
        stream_id: PublisherId,
        peer_id: Option<SubscriberId>,
        message: SignalingMessage,
    },
    RemovePublisher {
        worker_id: WorkerId,
        publisher_id: PublisherId,
    },
    RemoveSubscriber {
        worker_id: WorkerId,
        subscriber_id: SubscriberId,
        publisher_id: PublisherId,
    },
}

impl BusCall {
    /// Worker queue the call was addressed to; `None` for agent calls.
    #[must_use]
    pub fn worker_id(&self) -> Option<&WorkerId> {
        match self {
            BusCall::CreateWorker { .. } | BusCall::DeleteWorker { .. } => None,
            BusCall::KeepAlive { worker_id }
            | BusCall::AddPublisher { worker_id, .. }
            | BusCall::AddExternalInput { worker_id, .. }
            | BusCall::AddExternalOutput { worker_id, .. }
            | BusCall::RemoveExternalOutput { worker_id, .. }
            | BusCall::GetSrtpSession { worker_id, .. }
            | BusCall::MovePublisher { worker_id, .. }
            | BusCall::AddSubscriber { worker_id, .. }
            | BusCall::ProcessSignaling { worker_id, .. }
            | BusCall::RemovePublisher { worker_id, .. }
            | BusCall::RemoveSubscriber { worker_id, .. } => Some(worker_id),
        }
    }

    #[must_use]
    pub fn is_keep_alive(&self) -> bool {
        matches!(self, BusCall::KeepAlive { .. })
    }
}

/// Sending half of a stream handed out by the mock.
pub struct OpenStream {
    pub worker_id: WorkerId,
    pub publisher_id: PublisherId,
    pub subscriber_id: Option<SubscriberId>,
    pub sink: SignalingSink,
}

struct BusInner {
    calls: Vec<BusCall>,
    next_worker: u32,
    dead: HashSet<WorkerId>,
    not_alive: HashSet<WorkerId>,
    fail_creation: bool,
    srtp_session: Option<SrtpSession>,
    input_status: InitStatus,
    call_delay: Option<Duration>,
    streams: Vec<OpenStream>,
}

impl Default for BusInner {
    fn default() -> Self {
        Self {
            calls: Vec::new(),
            next_worker: 0,
            dead: HashSet::new(),
            not_alive: HashSet::new(),
            fail_creation: false,
            srtp_session: None,
            input_status: InitStatus::Success,
            call_delay: None,
            streams: Vec::new(),
        }
    }
}

/// Recording bus. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct MockBus {
    inner: Arc<Mutex<BusInner>>,
    /// `true` while worker creation is allowed to complete.
    creation_gate: Arc<watch::Sender<bool>>,
}

impl Default for MockBus {
    fn default() -> Self {
        Self::new()
    }
}

impl MockBus {
    #[must_use]
    pub fn new() -> Self {
        let (gate, _) = watch::channel(true);
        Self {
            inner: Arc::new(Mutex::new(BusInner::default())),
            creation_gate: Arc::new(gate),
        }
    }

    #[must_use]
    pub fn as_agent(&self) -> Arc<dyn WorkerAgent> {
        Arc::new(self.clone())
    }

    #[must_use]
    pub fn as_client(&self) -> Arc<dyn WorkerClient> {
        Arc::new(self.clone())
    }

    pub fn kill_worker(&self, worker_id: &WorkerId) {
        self.inner.lock().unwrap().dead.insert(worker_id.clone());
    }

    pub fn report_not_alive(&self, worker_id: &WorkerId) {
        self.inner.lock().unwrap().not_alive.insert(worker_id.clone());
    }

    pub fn fail_worker_creation(&self, fail: bool) {
        self.inner.lock().unwrap().fail_creation = fail;
    }

    pub fn pause_creation(&self) {
        self.creation_gate.send_replace(false);
    }

    pub fn resume_creation(&self) {
        self.creation_gate.send_replace(true);
    }

    pub fn set_srtp_session(&self, session: SrtpSession) {
        self.inner.lock().unwrap().srtp_session = Some(session);
    }

    pub fn set_input_status(&self, status: InitStatus) {
        self.inner.lock().unwrap().input_status = status;
    }

    pub fn set_call_delay(&self, delay: Duration) {
        self.inner.lock().unwrap().call_delay = Some(delay);
    }

    /// All calls in the order they were logged.
    #[must_use]
    pub fn calls(&self) -> Vec<BusCall> {
        self.inner.lock().unwrap().calls.clone()
    }

    /// All calls except keepalives.
    #[must_use]
    pub fn calls_without_keep_alive(&self) -> Vec<BusCall> {
        self.calls()
            .into_iter()
            .filter(|call| !call.is_keep_alive())
            .collect()
    }

    /// Calls addressed to `worker_id`, keepalives excluded.
    #[must_use]
    pub fn calls_to(&self, worker_id: &WorkerId) -> Vec<BusCall> {
        self.calls_without_keep_alive()
            .into_iter()
            .filter(|call| call.worker_id() == Some(worker_id))
            .collect()
    }

    #[must_use]
    pub fn keep_alive_count(&self, worker_id: &WorkerId) -> usize {
        self.calls()
            .iter()
            .filter(|call| matches!(call, BusCall::KeepAlive { worker_id: w } if w == worker_id))
            .count()
    }

    #[must_use]
    pub fn created_workers(&self) -> usize {
        self.calls()
            .iter()
            .filter(|call| matches!(call, BusCall::CreateWorker { .. }))
            .count()
    }

    #[must_use]
    pub fn deleted_workers(&self) -> Vec<WorkerId> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                BusCall::DeleteWorker { worker_id } => Some(worker_id),
                _ => None,
            })
            .collect()
    }

    /// Sending half of the most recent stream for this publisher/subscriber.
    #[must_use]
    pub fn sink(&self, publisher_id: &str, subscriber_id: Option<&str>) -> SignalingSink {
        self.inner
            .lock()
            .unwrap()
            .streams
            .iter()
            .rev()
            .find(|s| {
                s.publisher_id.as_str() == publisher_id
                    && s.subscriber_id.as_ref().map(SubscriberId::as_str) == subscriber_id
            })
            .map(|s| s.sink.clone())
            .unwrap_or_else(|| panic!("no stream for {publisher_id}/{subscriber_id:?}"))
    }

    fn record(&self, call: BusCall) -> Result<(), BusError> {
        let mut inner = self.inner.lock().unwrap();
        let dead = call
            .worker_id()
            .is_some_and(|worker_id| inner.dead.contains(worker_id));
        let queue = call.worker_id().map(WorkerId::queue_name);
        inner.calls.push(call);
        match queue {
            Some(queue) if dead => Err(BusError::Unreachable(queue)),
            _ => Ok(()),
        }
    }

    async fn delay(&self) {
        let delay = self.inner.lock().unwrap().call_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
    }

    fn open_stream(
        &self,
        worker_id: &WorkerId,
        publisher_id: &PublisherId,
        subscriber_id: Option<&SubscriberId>,
    ) -> SignalingStream {
        let (sink, stream) = signaling_channel();
        let _ = sink.try_send(SignalingMessage::Initializing);
        self.inner.lock().unwrap().streams.push(OpenStream {
            worker_id: worker_id.clone(),
            publisher_id: publisher_id.clone(),
            subscriber_id: subscriber_id.cloned(),
            sink,
        });
        stream
    }
}

#[async_trait::async_trait]
impl WorkerAgent for MockBus {
    async fn create_worker(&self, publisher_id: &PublisherId) -> Result<WorkerId, BusError> {
        self.record(BusCall::CreateWorker {
            publisher_id: publisher_id.clone(),
        })?;

        let mut gate = self.creation_gate.subscribe();
        let _ = gate.wait_for(|open| *open).await;

        let mut inner = self.inner.lock().unwrap();
        if inner.fail_creation {
            return Err(BusError::WorkerCreation("no capacity".to_string()));
        }
        inner.next_worker += 1;
        Ok(WorkerId::new(format!("worker-{}", inner.next_worker)))
    }

    async fn delete_worker(&self, worker_id: &WorkerId) -> Result<(), BusError> {
        self.record(BusCall::DeleteWorker {
            worker_id: worker_id.clone(),
        })
    }
}

#[async_trait::async_trait]
impl WorkerClient for MockBus {
    async fn keep_alive(&self, worker_id: &WorkerId) -> Result<bool, BusError> {
        self.record(BusCall::KeepAlive {
            worker_id: worker_id.clone(),
        })?;
        Ok(!self.inner.lock().unwrap().not_alive.contains(worker_id))
    }

    async fn add_publisher(
        &self,
        worker_id: &WorkerId,
        publisher_id: &PublisherId,
    ) -> Result<Option<SignalingStream>, BusError> {
        self.delay().await;
        self.record(BusCall::AddPublisher {
            worker_id: worker_id.clone(),
            publisher_id: publisher_id.clone(),
        })?;
        Ok(Some(self.open_stream(worker_id, publisher_id, None)))
    }

    async fn add_external_input(
        &self,
        worker_id: &WorkerId,
        publisher_id: &PublisherId,
        url: &str,
    ) -> Result<Option<InitStatus>, BusError> {
        self.record(BusCall::AddExternalInput {
            worker_id: worker_id.clone(),
            publisher_id: publisher_id.clone(),
            url: url.to_string(),
        })?;
        Ok(Some(self.inner.lock().unwrap().input_status))
    }

    async fn add_external_output(
        &self,
        worker_id: &WorkerId,
        publisher_id: &PublisherId,
        url: &str,
    ) -> Result<(), BusError> {
        self.record(BusCall::AddExternalOutput {
            worker_id: worker_id.clone(),
            publisher_id: publisher_id.clone(),
            url: url.to_string(),
        })
    }

    async fn remove_external_output(
        &self,
        worker_id: &WorkerId,
        publisher_id: &PublisherId,
        url: &str,
    ) -> Result<(), BusError> {
        self.record(BusCall::RemoveExternalOutput {
            worker_id: worker_id.clone(),
            publisher_id: publisher_id.clone(),
            url: url.to_string(),
        })
    }

    async fn get_srtp_session(
        &self,
        worker_id: &WorkerId,
        publisher_id: &PublisherId,
        peer_id: Option<&SubscriberId>,
    ) -> Result<Option<SrtpSession>, BusError> {
        self.record(BusCall::GetSrtpSession {
            worker_id: worker_id.clone(),
            publisher_id: publisher_id.clone(),
            peer_id: peer_id.cloned(),
        })?;
        Ok(self.inner.lock().unwrap().srtp_session.clone())
    }

    async fn move_publisher(
        &self,
        worker_id: &WorkerId,
        publisher_id: &PublisherId,
        context: SignalingContext,
    ) -> Result<Option<SignalingStream>, BusError> {
        self.delay().await;
        self.record(BusCall::MovePublisher {
            worker_id: worker_id.clone(),
            publisher_id: publisher_id.clone(),
            context,
        })?;
        Ok(Some(self.open_stream(worker_id, publisher_id, None)))
    }

    async fn add_subscriber(
        &self,
        worker_id: &WorkerId,
        subscriber_id: &SubscriberId,
        publisher_id: &PublisherId,
        audio: bool,
        video: bool,
    ) -> Result<Option<SignalingStream>, BusError> {
        self.delay().await;
        self.record(BusCall::AddSubscriber {
            worker_id: worker_id.clone(),
            subscriber_id: subscriber_id.clone(),
            publisher_id: publisher_id.clone(),
            audio,
            video,
        })?;
        Ok(Some(self.open_stream(
            worker_id,
            publisher_id,
            Some(subscriber_id),
        )))
    }

    async fn process_signaling(
        &self,
        worker_id: &WorkerId,
        stream_id: &PublisherId,
        peer_id: Option<&SubscriberId>,
        message: SignalingMessage,
    ) -> Result<(), BusError> {
        self.record(BusCall::ProcessSignaling {
            worker_id: worker_id.clone(),
            stream_id: stream_id.clone(),
            peer_id: peer_id.cloned(),
            message,
        })
    }

    async fn remove_publisher(
        &self,
        worker_id: &WorkerId,
        publisher_id: &PublisherId,
    ) -> Result<(), BusError> {
        self.record(BusCall::RemovePublisher {
            worker_id: worker_id.clone(),
            publisher_id: publisher_id.clone(),
        })
    }

    async fn remove_subscriber(
        &self,
        worker_id: &WorkerId,
        subscriber_id: &SubscriberId,
        publisher_id: &PublisherId,
    ) -> Result<(), BusError> {
        self.record(BusCall::RemoveSubscriber {
            worker_id: worker_id.clone(),
            subscriber_id: subscriber_id.clone(),
            publisher_id: publisher_id.clone(),
        })
    }
}
