//! Seam between the negotiation state machine and a peer-connection engine

use crate::error::EngineError;
use crate::peer::types::{IceCandidate, PeerState, SdpKind};
use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

/// Something the engine reports on its own schedule.
///
/// Engines push these into the channel handed out at construction instead
/// of invoking callbacks on the session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineEvent {
    /// A local candidate was gathered and should be trickled to the peer
    LocalCandidate(IceCandidate),
    /// Local gathering finished
    GatheringComplete,
    ConnectionState(PeerState),
    DataChannelOpen,
    DataMessage(Bytes),
    DataChannelClosed,
}

pub type EngineEvents = mpsc::UnboundedReceiver<EngineEvent>;
pub type EngineEventSender = mpsc::UnboundedSender<EngineEvent>;

/// Peer-connection operations the session drives
#[async_trait]
pub trait PeerEngine: Send {
    async fn create_offer(&mut self) -> Result<String, EngineError>;

    async fn create_answer(&mut self) -> Result<String, EngineError>;

    async fn set_local_description(&mut self, kind: SdpKind, sdp: String)
        -> Result<(), EngineError>;

    async fn set_remote_description(
        &mut self,
        kind: SdpKind,
        sdp: String,
    ) -> Result<(), EngineError>;

    async fn add_ice_candidate(&mut self, candidate: IceCandidate) -> Result<(), EngineError>;

    /// Open an outbound data channel (initiator side)
    async fn create_data_channel(&mut self, label: &str) -> Result<(), EngineError>;

    /// Attach any configured media tracks before a description is created
    async fn add_tracks(&mut self) -> Result<(), EngineError>;

    /// Send one data-channel message
    async fn send_data(&mut self, data: Bytes) -> Result<(), EngineError>;

    async fn close(&mut self) -> Result<(), EngineError>;
}
