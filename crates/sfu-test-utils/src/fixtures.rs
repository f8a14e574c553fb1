//! Canned signaling data and configs.

use bytes::Bytes;
use common::signaling::{IceCandidate, SignalingContext, SignalingMessage, SrtpSession};
use session_controller::Config;

/// Host candidate number `n` on the video section.
#[must_use]
pub fn candidate(n: u32) -> IceCandidate {
    IceCandidate::new(
        "video",
        format!("a=candidate:{n} 1 udp 2130706431 10.0.0.{n} {port} typ host", port = 5000 + n),
    )
}

#[must_use]
pub fn candidate_message(n: u32) -> SignalingMessage {
    SignalingMessage::Candidate {
        candidate: candidate(n),
    }
}

#[must_use]
pub fn offer(sdp: &str) -> SignalingMessage {
    SignalingMessage::Offer {
        sdp: sdp.to_string(),
    }
}

/// Minimal SDP body tagged with `label` so tests can tell offers apart.
#[must_use]
pub fn test_sdp(label: &str) -> String {
    format!("v=0\r\no=- 0 0 IN IP4 127.0.0.1\r\ns={label}\r\nt=0 0\r\n")
}

#[must_use]
pub fn test_srtp_session() -> SrtpSession {
    SrtpSession {
        crypto_suite: "AES_CM_128_HMAC_SHA1_80".to_string(),
        local_key: Bytes::from_static(b"local-master-key-and-salt-0123"),
        remote_key: Bytes::from_static(b"remote-master-key-and-salt-012"),
    }
}

/// Context as the coordinator would hold it after an offer and `candidates`
/// remote candidates.
#[must_use]
pub fn test_context(sdp: &str, candidates: u32) -> SignalingContext {
    let mut context = SignalingContext::default();
    context.record(&offer(sdp));
    for n in 1..=candidates {
        context.record(&candidate_message(n));
    }
    context
}

/// Worker config with a fixed id and stats disabled.
#[must_use]
pub fn test_worker_config() -> Config {
    Config {
        worker_id: "worker-test".to_string(),
        ..Config::default()
    }
}

/// Worker config forwarding stats to `queue`.
#[must_use]
pub fn test_worker_config_with_stats(queue: &str) -> Config {
    Config {
        send_stats: true,
        stats_queue: queue.to_string(),
        ..test_worker_config()
    }
}
