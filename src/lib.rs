//! Peer-to-peer connection negotiation over a WebSocket signaling relay.
//!
//! A [`NegotiationSession`] connects to the relay, runs the offer/answer and
//! trickle-ICE exchange against a [`PeerEngine`], and once the peer link is
//! up moves application payloads over a data channel in framed chunks.
//!
//! ```no_run
//! use peerlink::{NegotiationSession, NegotiatorConfig, Phase, Role};
//!
//! # async fn demo() -> peerlink::Result<()> {
//! let config = NegotiatorConfig {
//!     signaling_url: "wss://relay.example.org/room/42".into(),
//!     ..Default::default()
//! };
//! let (mut session, _audio) = NegotiationSession::start(Role::Initiator, config).await?;
//! if session.wait_for_phase(Phase::Connected).await? == Phase::Connected {
//!     session.send_payload(std::fs::read("photo.jpg").unwrap_or_default()).await?;
//! }
//! session.close();
//! session.join().await
//! # }
//! ```

pub mod config;
pub mod error;
pub mod logger;
pub mod peer;
pub mod session;
pub mod signaling;
pub mod utils;

#[cfg(test)]
mod testing;

pub use config::{LoggingConfig, NegotiatorConfig, ServerConfig};
pub use error::{DecodeError, EngineError, Error, NegotiationStep, Result};
pub use peer::{
    DataExchange, EngineEvent, EngineEvents, IceCandidate, PeerEngine, PeerState, Phase, Role,
    SdpKind, WebRtcEngine,
};
pub use session::{NegotiationSession, SessionEvent, SessionHandle};
pub use signaling::{ChannelEvent, SignalingChannel, SignalingMessage, WsSignalingChannel};
