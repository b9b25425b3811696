//! JSON wire format for offer / answer / candidate messages

use crate::error::{DecodeError, Error, Result};
use crate::peer::types::{IceCandidate, SdpKind};
use serde::{Deserialize, Deserializer, Serialize};

/// Control message exchanged through the signaling relay
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum SignalingMessage {
    Offer {
        sdp: String,
    },
    Answer {
        sdp: String,
    },
    Candidate {
        candidate: String,
        #[serde(rename = "sdpMid", deserialize_with = "null_as_default")]
        sdp_mid: String,
        #[serde(
            rename = "sdpMLineIndex",
            default,
            deserialize_with = "null_as_default"
        )]
        sdp_mline_index: u16,
    },
}

impl SignalingMessage {
    pub fn description(kind: SdpKind, sdp: String) -> Self {
        match kind {
            SdpKind::Offer => SignalingMessage::Offer { sdp },
            SdpKind::Answer => SignalingMessage::Answer { sdp },
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            SignalingMessage::Offer { .. } => "offer",
            SignalingMessage::Answer { .. } => "answer",
            SignalingMessage::Candidate { .. } => "candidate",
        }
    }

    /// Serialize to wire text
    pub fn encode(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| Error::Encode(e.to_string()))
    }

    /// Parse wire text. Extra fields are ignored.
    pub fn decode(text: &str) -> std::result::Result<Self, DecodeError> {
        serde_json::from_str(text).map_err(|e| DecodeError::MalformedPayload(e.to_string()))
    }
}

impl From<IceCandidate> for SignalingMessage {
    fn from(c: IceCandidate) -> Self {
        SignalingMessage::Candidate {
            candidate: c.candidate,
            sdp_mid: c.sdp_mid,
            sdp_mline_index: c.sdp_mline_index,
        }
    }
}

// Browsers send `null` for absent mid/index; treat it like the field default.
fn null_as_default<'de, D, T>(d: D) -> std::result::Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de> + Default,
{
    Ok(Option::<T>::deserialize(d)?.unwrap_or_default())
}
