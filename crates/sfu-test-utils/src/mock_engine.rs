//! Recording Media Engine.
//!
//! Every engine object the session controller creates is kept, in creation
//! order, so tests can inspect what was applied to it and push engine events
//! into its connection actor.
//!
//! # Example
//!
//! ```rust,ignore
//! let engine = MockEngine::new();
//! // ... add a publisher through the controller ...
//! let publisher = engine.connection(0);
//! publisher.emit(EngineEvent::SdpReady("v=0".into()));
//! assert_eq!(publisher.remote_candidates().len(), 0);
//! ```

use common::signaling::{IceCandidate, SrtpSession};
use common::types::{PublisherId, SubscriberId};
use session_controller::engine::{
    ConnectionOptions, ConnectionState, EngineConnection, EngineEvent, ExternalInput,
    ExternalOutput, FanOut, MediaEngine,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

/// A call the session controller made on a [`MockConnection`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionCall {
    Init,
    SetRemoteSdp(String),
    AddRemoteCandidate(IceCandidate),
    SetSrtpSession(SrtpSession),
}

#[derive(Default)]
struct ConnectionInner {
    events: Option<mpsc::UnboundedSender<EngineEvent>>,
    stats: Option<mpsc::UnboundedSender<String>>,
    calls: Vec<ConnectionCall>,
    local_srtp: Option<SrtpSession>,
    state: Option<ConnectionState>,
}

/// Mock engine connection.
pub struct MockConnection {
    options: ConnectionOptions,
    inner: Mutex<ConnectionInner>,
}

impl MockConnection {
    fn new(options: ConnectionOptions) -> Self {
        Self {
            options,
            inner: Mutex::new(ConnectionInner::default()),
        }
    }

    /// Options the connection was created with.
    #[must_use]
    pub fn options(&self) -> &ConnectionOptions {
        &self.options
    }

    /// Push an engine event to the connection actor.
    ///
    /// State events also update [`EngineConnection::current_state`].
    pub fn emit(&self, event: EngineEvent) {
        let mut inner = self.inner.lock().unwrap();
        if let EngineEvent::State(state) = &event {
            inner.state = Some(*state);
        }
        inner
            .events
            .as_ref()
            .expect("connection was not initialized")
            .send(event)
            .expect("connection actor stopped");
    }

    /// Emit the usual sequence up to READY for a fresh connection.
    pub fn negotiate(&self, answer_sdp: &str, candidate: IceCandidate) {
        self.emit(EngineEvent::State(ConnectionState::Initial));
        self.emit(EngineEvent::SdpReady(answer_sdp.to_string()));
        self.emit(EngineEvent::Candidate(candidate));
        self.emit(EngineEvent::State(ConnectionState::Ready));
    }

    /// Push a statistics document to the stats listener, if one is set.
    pub fn emit_stats(&self, raw: &str) -> bool {
        let inner = self.inner.lock().unwrap();
        match &inner.stats {
            Some(listener) => listener.send(raw.to_string()).is_ok(),
            None => false,
        }
    }

    /// SRTP material returned by `srtp_session()`.
    pub fn set_local_srtp(&self, session: SrtpSession) {
        self.inner.lock().unwrap().local_srtp = Some(session);
    }

    #[must_use]
    pub fn calls(&self) -> Vec<ConnectionCall> {
        self.inner.lock().unwrap().calls.clone()
    }

    #[must_use]
    pub fn remote_candidates(&self) -> Vec<IceCandidate> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                ConnectionCall::AddRemoteCandidate(candidate) => Some(candidate),
                _ => None,
            })
            .collect()
    }

    #[must_use]
    pub fn remote_sdps(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                ConnectionCall::SetRemoteSdp(sdp) => Some(sdp),
                _ => None,
            })
            .collect()
    }

    #[must_use]
    pub fn applied_srtp(&self) -> Vec<SrtpSession> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                ConnectionCall::SetSrtpSession(session) => Some(session),
                _ => None,
            })
            .collect()
    }

    #[must_use]
    pub fn has_stats_listener(&self) -> bool {
        self.inner.lock().unwrap().stats.is_some()
    }
}

impl EngineConnection for MockConnection {
    fn init(&self, events: mpsc::UnboundedSender<EngineEvent>) {
        let mut inner = self.inner.lock().unwrap();
        inner.events = Some(events);
        inner.calls.push(ConnectionCall::Init);
    }

    fn set_remote_sdp(&self, sdp: &str) {
        let mut inner = self.inner.lock().unwrap();
        inner.calls.push(ConnectionCall::SetRemoteSdp(sdp.to_string()));
    }

    fn add_remote_candidate(&self, candidate: &IceCandidate) {
        let mut inner = self.inner.lock().unwrap();
        inner
            .calls
            .push(ConnectionCall::AddRemoteCandidate(candidate.clone()));
    }

    fn srtp_session(&self) -> Option<SrtpSession> {
        self.inner.lock().unwrap().local_srtp.clone()
    }

    fn set_srtp_session(&self, session: &SrtpSession) {
        let mut inner = self.inner.lock().unwrap();
        inner.calls.push(ConnectionCall::SetSrtpSession(session.clone()));
    }

    fn current_state(&self) -> ConnectionState {
        self.inner
            .lock()
            .unwrap()
            .state
            .unwrap_or(ConnectionState::Initial)
    }

    fn set_stats_listener(&self, listener: mpsc::UnboundedSender<String>) {
        self.inner.lock().unwrap().stats = Some(listener);
    }
}

#[derive(Default)]
struct FanOutInner {
    has_publisher: bool,
    has_external_publisher: bool,
    subscribers: Vec<SubscriberId>,
    outputs: Vec<String>,
    closed: bool,
}

/// Mock fan-out resource.
#[derive(Default)]
pub struct MockFanOut {
    inner: Mutex<FanOutInner>,
    firs: AtomicUsize,
}

impl MockFanOut {
    #[must_use]
    pub fn fir_count(&self) -> usize {
        self.firs.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn has_publisher(&self) -> bool {
        self.inner.lock().unwrap().has_publisher
    }

    #[must_use]
    pub fn has_external_publisher(&self) -> bool {
        self.inner.lock().unwrap().has_external_publisher
    }

    /// Currently attached subscribers, in attach order.
    #[must_use]
    pub fn subscribers(&self) -> Vec<SubscriberId> {
        self.inner.lock().unwrap().subscribers.clone()
    }

    /// Currently attached external output URLs, in attach order.
    #[must_use]
    pub fn outputs(&self) -> Vec<String> {
        self.inner.lock().unwrap().outputs.clone()
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.lock().unwrap().closed
    }
}

impl FanOut for MockFanOut {
    fn set_publisher(&self, _publisher: Arc<dyn EngineConnection>) {
        self.inner.lock().unwrap().has_publisher = true;
    }

    fn set_external_publisher(&self, _input: Arc<dyn ExternalInput>) {
        self.inner.lock().unwrap().has_external_publisher = true;
    }

    fn add_subscriber(&self, subscriber_id: &SubscriberId, _subscriber: Arc<dyn EngineConnection>) {
        self.inner
            .lock()
            .unwrap()
            .subscribers
            .push(subscriber_id.clone());
    }

    fn remove_subscriber(&self, subscriber_id: &SubscriberId) {
        self.inner
            .lock()
            .unwrap()
            .subscribers
            .retain(|s| s != subscriber_id);
    }

    fn add_external_output(&self, url: &str, _output: Arc<dyn ExternalOutput>) {
        self.inner.lock().unwrap().outputs.push(url.to_string());
    }

    fn remove_external_output(&self, url: &str) {
        self.inner.lock().unwrap().outputs.retain(|u| u != url);
    }

    fn publisher_state(&self) -> ConnectionState {
        ConnectionState::Initial
    }

    fn send_fir(&self) {
        self.firs.fetch_add(1, Ordering::SeqCst);
    }

    fn close(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.closed = true;
        inner.subscribers.clear();
        inner.outputs.clear();
    }
}

/// Mock external input or output with a fixed init code.
pub struct MockExternalEndpoint {
    url: String,
    init_code: i32,
    init_calls: AtomicUsize,
}

impl MockExternalEndpoint {
    fn new(url: &str, init_code: i32) -> Self {
        Self {
            url: url.to_string(),
            init_code,
            init_calls: AtomicUsize::new(0),
        }
    }

    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }

    #[must_use]
    pub fn init_calls(&self) -> usize {
        self.init_calls.load(Ordering::SeqCst)
    }

    fn do_init(&self) -> i32 {
        self.init_calls.fetch_add(1, Ordering::SeqCst);
        self.init_code
    }
}

impl ExternalInput for MockExternalEndpoint {
    fn init(&self) -> i32 {
        self.do_init()
    }
}

impl ExternalOutput for MockExternalEndpoint {
    fn init(&self) -> i32 {
        self.do_init()
    }
}

#[derive(Default)]
struct EngineInner {
    connections: Vec<Arc<MockConnection>>,
    fan_outs: Vec<(PublisherId, Arc<MockFanOut>)>,
    inputs: Vec<Arc<MockExternalEndpoint>>,
    outputs: Vec<Arc<MockExternalEndpoint>>,
    input_init_code: i32,
    output_init_code: i32,
}

/// Recording Media Engine. Cheap to clone; clones share state.
#[derive(Clone, Default)]
pub struct MockEngine {
    inner: Arc<Mutex<EngineInner>>,
}

impl MockEngine {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Init code returned by every external input created from now on.
    #[must_use]
    pub fn with_input_init_code(self, code: i32) -> Self {
        self.inner.lock().unwrap().input_init_code = code;
        self
    }

    /// Init code returned by every external output created from now on.
    #[must_use]
    pub fn with_output_init_code(self, code: i32) -> Self {
        self.inner.lock().unwrap().output_init_code = code;
        self
    }

    /// This engine as the trait object the session controller takes.
    #[must_use]
    pub fn as_engine(&self) -> Arc<dyn MediaEngine> {
        Arc::new(self.clone())
    }

    /// The `index`-th connection created (publishers and subscribers alike).
    #[must_use]
    pub fn connection(&self, index: usize) -> Arc<MockConnection> {
        self.inner
            .lock()
            .unwrap()
            .connections
            .get(index)
            .cloned()
            .unwrap_or_else(|| panic!("no connection #{index}"))
    }

    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.inner.lock().unwrap().connections.len()
    }

    /// Most recent fan-out created for `publisher_id`.
    #[must_use]
    pub fn fan_out(&self, publisher_id: &str) -> Arc<MockFanOut> {
        self.inner
            .lock()
            .unwrap()
            .fan_outs
            .iter()
            .rev()
            .find(|(id, _)| id.as_str() == publisher_id)
            .map(|(_, fan_out)| Arc::clone(fan_out))
            .unwrap_or_else(|| panic!("no fan-out for {publisher_id}"))
    }

    #[must_use]
    pub fn fan_out_count(&self) -> usize {
        self.inner.lock().unwrap().fan_outs.len()
    }

    #[must_use]
    pub fn external_inputs(&self) -> Vec<Arc<MockExternalEndpoint>> {
        self.inner.lock().unwrap().inputs.clone()
    }

    #[must_use]
    pub fn external_outputs(&self) -> Vec<Arc<MockExternalEndpoint>> {
        self.inner.lock().unwrap().outputs.clone()
    }
}

impl MediaEngine for MockEngine {
    fn create_connection(&self, options: ConnectionOptions) -> Arc<dyn EngineConnection> {
        let connection = Arc::new(MockConnection::new(options));
        self.inner
            .lock()
            .unwrap()
            .connections
            .push(Arc::clone(&connection));
        connection
    }

    fn create_fan_out(&self, publisher_id: &PublisherId) -> Arc<dyn FanOut> {
        let fan_out = Arc::new(MockFanOut::default());
        self.inner
            .lock()
            .unwrap()
            .fan_outs
            .push((publisher_id.clone(), Arc::clone(&fan_out)));
        fan_out
    }

    fn create_external_input(&self, url: &str) -> Arc<dyn ExternalInput> {
        let mut inner = self.inner.lock().unwrap();
        let input = Arc::new(MockExternalEndpoint::new(url, inner.input_init_code));
        inner.inputs.push(Arc::clone(&input));
        input
    }

    fn create_external_output(&self, url: &str) -> Arc<dyn ExternalOutput> {
        let mut inner = self.inner.lock().unwrap();
        let output = Arc::new(MockExternalEndpoint::new(url, inner.output_init_code));
        inner.outputs.push(Arc::clone(&output));
        output
    }
}
