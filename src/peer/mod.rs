pub mod connection;
pub mod data_channel;
pub mod engine;
pub mod ice;
pub mod types;

pub use connection::WebRtcEngine;
pub use data_channel::{split_payload, DataExchange, Reassembler};
pub use engine::{EngineEvent, EngineEvents, PeerEngine};
pub use ice::CandidateBuffer;
pub use types::{IceCandidate, PeerState, Phase, Role, SdpKind};
