//! Media Engine boundary.
//!
//! The engine owns the actual media plumbing (ICE, DTLS, SRTP, RTP
//! forwarding). The session controller only drives it through these traits.
//! Engine objects report asynchronous progress by pushing [`EngineEvent`]s
//! into the channel handed to [`EngineConnection::init`]; engine callbacks are
//! synchronous, so that channel is unbounded.

use common::signaling::{IceCandidate, SrtpSession};
use common::types::{PublisherId, SubscriberId};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Negotiation state of an engine connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Initial,
    Started,
    Ready,
    Finished,
    Failed,
}

impl ConnectionState {
    /// Numeric status code reported by the engine.
    #[must_use]
    pub const fn code(&self) -> u16 {
        match self {
            ConnectionState::Initial => 101,
            ConnectionState::Started => 102,
            ConnectionState::Ready => 103,
            ConnectionState::Finished => 104,
            ConnectionState::Failed => 500,
        }
    }

    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Initial => "initial",
            ConnectionState::Started => "started",
            ConnectionState::Ready => "ready",
            ConnectionState::Finished => "finished",
            ConnectionState::Failed => "failed",
        }
    }
}

/// Asynchronous notification from an engine connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineEvent {
    /// The connection moved to a new state.
    State(ConnectionState),
    /// Local session description is available (code 202).
    SdpReady(String),
    /// A local ICE candidate was gathered (code 201).
    Candidate(IceCandidate),
}

impl EngineEvent {
    /// Numeric status code reported by the engine.
    #[must_use]
    pub const fn code(&self) -> u16 {
        match self {
            EngineEvent::State(state) => state.code(),
            EngineEvent::Candidate(_) => 201,
            EngineEvent::SdpReady(_) => 202,
        }
    }

    /// Short name used in logs and metric labels.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            EngineEvent::State(state) => state.as_str(),
            EngineEvent::Candidate(_) => "candidate",
            EngineEvent::SdpReady(_) => "sdp_ready",
        }
    }
}

/// Parameters for a new engine connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionOptions {
    pub audio: bool,
    pub video: bool,
    pub stun_server: String,
    pub stun_port: u16,
    /// Lower bound of the UDP port range (0 lets the engine choose).
    pub min_port: u16,
    /// Upper bound of the UDP port range (0 lets the engine choose).
    pub max_port: u16,
}

/// A WebRTC connection object inside the engine.
pub trait EngineConnection: Send + Sync {
    /// Start negotiation; progress is reported through `events`.
    fn init(&self, events: mpsc::UnboundedSender<EngineEvent>);

    fn set_remote_sdp(&self, sdp: &str);

    fn add_remote_candidate(&self, candidate: &IceCandidate);

    fn srtp_session(&self) -> Option<SrtpSession>;

    fn set_srtp_session(&self, session: &SrtpSession);

    fn current_state(&self) -> ConnectionState;

    /// Deliver periodic statistics documents (JSON text) to `listener`.
    fn set_stats_listener(&self, listener: mpsc::UnboundedSender<String>);
}

/// Fan-out forwarding resource: one publisher feeding many subscribers and
/// external outputs.
pub trait FanOut: Send + Sync {
    /// Wire a WebRTC publisher's audio and video receivers into the fan-out.
    fn set_publisher(&self, publisher: Arc<dyn EngineConnection>);

    /// Wire an external input as the media source.
    fn set_external_publisher(&self, input: Arc<dyn ExternalInput>);

    fn add_subscriber(&self, subscriber_id: &SubscriberId, subscriber: Arc<dyn EngineConnection>);

    fn remove_subscriber(&self, subscriber_id: &SubscriberId);

    fn add_external_output(&self, url: &str, output: Arc<dyn ExternalOutput>);

    fn remove_external_output(&self, url: &str);

    fn publisher_state(&self) -> ConnectionState;

    /// Ask the publisher for a full intra frame.
    fn send_fir(&self);

    /// Tear down the fan-out, its publisher, every attached subscriber and
    /// external output.
    fn close(&self);
}

/// Ingest from a URL (e.g. RTSP).
pub trait ExternalInput: Send + Sync {
    /// Returns a negative code on failure.
    fn init(&self) -> i32;
}

/// Recording or re-streaming sink. Torn down by the fan-out it is attached to.
pub trait ExternalOutput: Send + Sync {
    /// Returns a negative code on failure.
    fn init(&self) -> i32;
}

/// Factory for engine objects.
pub trait MediaEngine: Send + Sync {
    fn create_connection(&self, options: ConnectionOptions) -> Arc<dyn EngineConnection>;

    fn create_fan_out(&self, publisher_id: &PublisherId) -> Arc<dyn FanOut>;

    fn create_external_input(&self, url: &str) -> Arc<dyn ExternalInput>;

    fn create_external_output(&self, url: &str) -> Arc<dyn ExternalOutput>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_codes_match_engine_status_codes() {
        assert_eq!(EngineEvent::State(ConnectionState::Initial).code(), 101);
        assert_eq!(EngineEvent::State(ConnectionState::Ready).code(), 103);
        assert_eq!(EngineEvent::State(ConnectionState::Failed).code(), 500);
        assert_eq!(
            EngineEvent::Candidate(IceCandidate::new("audio", "c")).code(),
            201
        );
        assert_eq!(EngineEvent::SdpReady(String::new()).code(), 202);
    }
}
