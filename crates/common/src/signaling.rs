//! Signaling messages exchanged between clients, the coordinator and workers.
//!
//! Messages travel as JSON objects discriminated by a `type` field:
//!
//! ```text
//! {"type":"started"}
//! {"type":"initializing"}
//! {"type":"offer","sdp":"v=0..."}
//! {"type":"answer","sdp":"v=0..."}
//! {"type":"candidate","candidate":{"sdpMid":"video","candidate":"a=candidate:..."}}
//! ```
//!
//! The coordinator keeps a [`SignalingContext`] per publisher: the last remote
//! offer, every remote candidate seen so far and, once a migration starts, the
//! SRTP material fetched from the old worker. The new worker uses it to rebuild
//! the session without a fresh offer/answer exchange.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::sync::mpsc;

/// Ordered stream of signaling messages produced by one worker call.
pub type SignalingStream = mpsc::Receiver<SignalingMessage>;

/// Sending half of a [`SignalingStream`].
pub type SignalingSink = mpsc::Sender<SignalingMessage>;

/// Buffer size of per-call signaling streams.
pub const SIGNALING_STREAM_BUFFER: usize = 64;

/// Create a signaling stream pair.
#[must_use]
pub fn signaling_channel() -> (SignalingSink, SignalingStream) {
    mpsc::channel(SIGNALING_STREAM_BUFFER)
}

/// A remote or local ICE candidate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    /// Media section the candidate belongs to.
    #[serde(rename = "sdpMid")]
    pub sdp_mid: String,
    /// Candidate line.
    pub candidate: String,
}

impl IceCandidate {
    #[must_use]
    pub fn new(sdp_mid: impl Into<String>, candidate: impl Into<String>) -> Self {
        Self {
            sdp_mid: sdp_mid.into(),
            candidate: candidate.into(),
        }
    }
}

/// A signaling message.
///
/// `Offer` only travels inbound (client to worker). `Started`, `Initializing`
/// and `Answer` only travel outbound. `Candidate` goes both ways.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum SignalingMessage {
    /// The connection object was created on the worker.
    Initializing,
    /// The engine began negotiating.
    Started,
    /// Remote session description.
    Offer { sdp: String },
    /// Local session description answering an offer.
    Answer { sdp: String },
    /// Trickled ICE candidate.
    Candidate { candidate: IceCandidate },
}

impl SignalingMessage {
    /// Short name used in logs and metric labels.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            SignalingMessage::Initializing => "initializing",
            SignalingMessage::Started => "started",
            SignalingMessage::Offer { .. } => "offer",
            SignalingMessage::Answer { .. } => "answer",
            SignalingMessage::Candidate { .. } => "candidate",
        }
    }
}

/// SRTP keying material of an established connection.
///
/// Key bytes are redacted in Debug output.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SrtpSession {
    /// Negotiated protection profile, e.g. `AES_CM_128_HMAC_SHA1_80`.
    pub crypto_suite: String,
    /// Local master key and salt.
    pub local_key: Bytes,
    /// Remote master key and salt.
    pub remote_key: Bytes,
}

impl fmt::Debug for SrtpSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SrtpSession")
            .field("crypto_suite", &self.crypto_suite)
            .field("local_key", &"[REDACTED]")
            .field("remote_key", &"[REDACTED]")
            .finish()
    }
}

/// Everything needed to rebuild a publisher's connection on another worker.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignalingContext {
    /// Last remote offer.
    pub remote_sdp: Option<String>,
    /// Remote candidates in arrival order.
    pub pending_candidates: Vec<IceCandidate>,
    /// SRTP material captured from the previous worker.
    pub srtp_session: Option<SrtpSession>,
    /// Whether `pending_candidates` were already applied to a restored connection.
    pub candidates_replayed: bool,
}

impl SignalingContext {
    /// Record an inbound message.
    ///
    /// An offer replaces the stored SDP, a candidate is appended. Other
    /// message types carry nothing worth keeping.
    pub fn record(&mut self, message: &SignalingMessage) {
        match message {
            SignalingMessage::Offer { sdp } => self.remote_sdp = Some(sdp.clone()),
            SignalingMessage::Candidate { candidate } => {
                self.pending_candidates.push(candidate.clone());
            }
            SignalingMessage::Initializing
            | SignalingMessage::Started
            | SignalingMessage::Answer { .. } => {}
        }
    }
}

/// Result of initializing an external input on a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", tag = "status")]
pub enum InitStatus {
    /// The engine accepted the input.
    Success,
    /// The engine rejected the input with a negative code.
    Failed { code: i32 },
}

impl InitStatus {
    /// Map an engine init return code (`>= 0` is success).
    #[must_use]
    pub const fn from_code(code: i32) -> Self {
        if code >= 0 {
            InitStatus::Success
        } else {
            InitStatus::Failed { code }
        }
    }

    #[must_use]
    pub const fn is_success(&self) -> bool {
        matches!(self, InitStatus::Success)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_candidate_message_wire_format() {
        let message = SignalingMessage::Candidate {
            candidate: IceCandidate::new("audio", "a=candidate:1 1 udp 2130706431 10.0.0.1 5000 typ host"),
        };

        let json = serde_json::to_value(&message).unwrap();
        assert_eq!(json["type"], "candidate");
        assert_eq!(json["candidate"]["sdpMid"], "audio");
    }

    #[test]
    fn test_unit_messages_carry_only_type() {
        let json = serde_json::to_string(&SignalingMessage::Started).unwrap();
        assert_eq!(json, r#"{"type":"started"}"#);

        let parsed: SignalingMessage = serde_json::from_str(r#"{"type":"initializing"}"#).unwrap();
        assert_eq!(parsed, SignalingMessage::Initializing);
    }

    #[test]
    fn test_context_records_offer_and_candidates() {
        let mut context = SignalingContext::default();

        context.record(&SignalingMessage::Offer { sdp: "v=0 first".to_string() });
        context.record(&SignalingMessage::Candidate {
            candidate: IceCandidate::new("video", "c1"),
        });
        context.record(&SignalingMessage::Offer { sdp: "v=0 second".to_string() });
        context.record(&SignalingMessage::Candidate {
            candidate: IceCandidate::new("video", "c2"),
        });

        assert_eq!(context.remote_sdp.as_deref(), Some("v=0 second"));
        let candidates: Vec<_> = context
            .pending_candidates
            .iter()
            .map(|c| c.candidate.as_str())
            .collect();
        assert_eq!(candidates, vec!["c1", "c2"]);
        assert!(!context.candidates_replayed);
    }

    #[test]
    fn test_srtp_session_debug_redacts_keys() {
        let session = SrtpSession {
            crypto_suite: "AES_CM_128_HMAC_SHA1_80".to_string(),
            local_key: Bytes::from_static(b"local-secret"),
            remote_key: Bytes::from_static(b"remote-secret"),
        };

        let debug = format!("{session:?}");
        assert!(debug.contains("AES_CM_128_HMAC_SHA1_80"));
        assert!(!debug.contains("local-secret"));
        assert!(!debug.contains("remote-secret"));
    }

    #[test]
    fn test_init_status_from_code() {
        assert_eq!(InitStatus::from_code(0), InitStatus::Success);
        assert_eq!(InitStatus::from_code(3), InitStatus::Success);
        assert_eq!(InitStatus::from_code(-2), InitStatus::Failed { code: -2 });
    }
}
