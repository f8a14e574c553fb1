//! Legacy ROAP envelope support.
//!
//! Old clients wrapped session descriptions in a ROAP JSON envelope instead of
//! sending bare `offer`/`answer` messages. None of the current call paths use
//! this; it is kept for gateways that still translate for such clients.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Session id the answering side reports in every ROAP answer.
pub const ANSWERER_SESSION_ID: u64 = 106;

/// Sequence number of a ROAP answer.
pub const ANSWER_SEQ: u64 = 1;

#[derive(Debug, Error)]
pub enum RoapError {
    #[error("Malformed ROAP envelope: {0}")]
    Malformed(String),
}

impl From<serde_json::Error> for RoapError {
    fn from(err: serde_json::Error) -> Self {
        RoapError::Malformed(err.to_string())
    }
}

/// ROAP envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoapMessage {
    pub message_type: String,
    pub sdp: String,
    pub offerer_session_id: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub answerer_session_id: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seq: Option<u64>,
}

/// Extract the SDP of a ROAP envelope with line endings normalized to `\n`.
pub fn sdp_from_roap(roap: &str) -> Result<String, RoapError> {
    let message: RoapMessage = serde_json::from_str(roap)?;
    Ok(message.sdp.replace("\r\n", "\n"))
}

/// Wrap a local SDP in a ROAP `ANSWER` to the given offer envelope.
pub fn roap_answer(sdp: &str, offer_roap: &str) -> Result<String, RoapError> {
    let offer: RoapMessage = serde_json::from_str(offer_roap)?;
    let answer = RoapMessage {
        message_type: "ANSWER".to_string(),
        sdp: sdp.replace("\r\n", "\n").replace('\n', "\r\n"),
        offerer_session_id: offer.offerer_session_id,
        answerer_session_id: Some(ANSWERER_SESSION_ID),
        seq: Some(ANSWER_SEQ),
    };
    Ok(serde_json::to_string(&answer)?)
}
