//! Signaling relay access: wire codec and the duplex text channel

pub mod codec;
pub mod websocket;

pub use codec::SignalingMessage;
pub use websocket::WsSignalingChannel;

use crate::error::Result;
use async_trait::async_trait;

/// Something the relay delivered
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    Message(String),
    Closed,
}

/// Duplex text transport to a signaling relay.
///
/// `recv` must be cancel-safe: the session polls it inside `select!`.
/// After `Closed` has been returned the session stops polling.
#[async_trait]
pub trait SignalingChannel: Send {
    async fn connect(&mut self, url: &str) -> Result<()>;

    async fn send(&mut self, text: String) -> Result<()>;

    async fn recv(&mut self) -> ChannelEvent;

    async fn close(&mut self);
}
