use serde::{Deserialize, Serialize};

/// One signaling message per WebSocket text frame.
///
/// The wire encoding is internally tagged on `"type"`: offers and answers carry
/// the SDP under `description`, candidates carry the ICE candidate text plus an
/// optional media-line `mid`. Fields the remote adds beyond these are ignored.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum SignalMessage {
    Offer {
        description: String,
    },
    Answer {
        description: String,
    },
    Candidate {
        candidate: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        mid: Option<String>,
    },
}

impl SignalMessage {
    /// Parses a text frame. Malformed or unrecognised frames yield `None` and
    /// are dropped by the caller, never propagated as an error.
    pub fn parse(text: &str) -> Option<SignalMessage> {
        serde_json::from_str(text).ok()
    }

    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Builds the outbound signal for a locally gathered ICE candidate.
///
/// The gathering process terminates with an empty candidate; that sentinel is
/// swallowed here so it is never transmitted.
pub fn candidate_signal(candidate: String, mid: Option<String>) -> Option<SignalMessage> {
    if candidate.is_empty() {
        return None;
    }
    Some(SignalMessage::Candidate { candidate, mid })
}
