//! Error types for the negotiation core

use std::fmt;

/// Result type alias using the crate [`Error`]
pub type Result<T> = std::result::Result<T, Error>;

/// Named negotiation steps, retained in [`Error::Description`] for diagnostics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationStep {
    CreateOffer,
    CreateAnswer,
    SetLocalDescription,
    SetRemoteDescription,
    CreateDataChannel,
    AddTracks,
    CreatePeerConnection,
}

impl fmt::Display for NegotiationStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            NegotiationStep::CreateOffer => "create_offer",
            NegotiationStep::CreateAnswer => "create_answer",
            NegotiationStep::SetLocalDescription => "set_local_description",
            NegotiationStep::SetRemoteDescription => "set_remote_description",
            NegotiationStep::CreateDataChannel => "create_data_channel",
            NegotiationStep::AddTracks => "add_tracks",
            NegotiationStep::CreatePeerConnection => "create_peer_connection",
        };
        f.write_str(name)
    }
}

/// Failure reported by a peer-connection engine
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{0}")]
pub struct EngineError(pub String);

impl From<webrtc::Error> for EngineError {
    fn from(err: webrtc::Error) -> Self {
        EngineError(err.to_string())
    }
}

/// Signaling payload could not be decoded
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    /// Not a JSON object, missing/unknown `type`, or a required field is absent
    #[error("malformed signaling payload: {0}")]
    MalformedPayload(String),
}

/// Errors that can occur while negotiating or exchanging data
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    /// Signaling relay could not be reached
    #[error("signaling connect failed: {0}")]
    ChannelConnect(String),

    /// Signaling channel went away before the peer link was up
    #[error("signaling channel closed")]
    SignalingClosed,

    /// Signaling message could not be serialized
    #[error("failed to encode signaling message: {0}")]
    Encode(String),

    /// Malformed signaling message
    #[error(transparent)]
    Decode(#[from] DecodeError),

    /// Creating or applying a session description failed
    #[error("{step} failed: {source}")]
    Description {
        step: NegotiationStep,
        source: EngineError,
    },

    /// Remote ICE candidate was rejected by the engine
    #[error("failed to apply ICE candidate: {0}")]
    CandidateApply(EngineError),

    /// ICE connectivity checks failed before the link came up
    #[error("connectivity checks failed")]
    ConnectivityFailed,

    /// `Connected` was not reached in time
    #[error("negotiation did not complete within {0:?}")]
    NegotiationTimeout(std::time::Duration),

    /// Established link was lost without a local close
    #[error("peer disconnected unexpectedly")]
    UnexpectedDisconnect,

    /// Payload operation requested before the session is connected
    #[error("session is not connected")]
    NotConnected,

    /// Inbound transfer exceeded the reassembly cap
    #[error("payload exceeds reassembly cap of {limit} bytes")]
    PayloadTooLargeForBuffering { limit: usize },

    /// Chunk frame could not be parsed
    #[error("malformed chunk frame: {0}")]
    MalformedChunk(String),

    /// Chunk arrived with an unexpected sequence number
    #[error("chunk out of sequence: expected {expected}, got {got}")]
    ChunkOutOfSequence { expected: u32, got: u32 },

    /// Sending on the data channel failed
    #[error("data channel error: {0}")]
    DataChannel(EngineError),

    /// Session task is gone
    #[error("session has ended")]
    SessionEnded,

    /// Invalid configuration parameter
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

impl Error {
    /// Errors that move a session to `Failed`
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::ChannelConnect(_)
                | Error::SignalingClosed
                | Error::Encode(_)
                | Error::Description { .. }
                | Error::ConnectivityFailed
                | Error::NegotiationTimeout(_)
                | Error::UnexpectedDisconnect
        )
    }

    /// Whether a fresh session may succeed where this one failed
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::ChannelConnect(_)
                | Error::SignalingClosed
                | Error::ConnectivityFailed
                | Error::NegotiationTimeout(_)
                | Error::UnexpectedDisconnect
        )
    }
}
