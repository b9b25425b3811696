use crate::config::{NegotiatorConfig, ServerConfig};
use crate::error::EngineError;
use crate::logger::{dump_candidate, dump_selected_pair};
use crate::peer::data_channel::attach_dc;
use crate::peer::engine::{EngineEvent, EngineEventSender, EngineEvents, PeerEngine};
use crate::peer::types::{IceCandidate, PeerState, SdpKind};
use crate::utils::add_ice_url_scheme;
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_OPUS};
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::policy::bundle_policy::RTCBundlePolicy;
use webrtc::peer_connection::policy::rtcp_mux_policy::RTCRtcpMuxPolicy;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;
use webrtc::{
    api::APIBuilder,
    data_channel::{data_channel_init::RTCDataChannelInit, RTCDataChannel},
    ice_transport::ice_server::RTCIceServer,
    peer_connection::{
        configuration::RTCConfiguration, peer_connection_state::RTCPeerConnectionState,
        sdp::session_description::RTCSessionDescription, RTCPeerConnection,
    },
};

type DataChannelSlot = Arc<Mutex<Option<Arc<RTCDataChannel>>>>;

/// [`PeerEngine`] backed by webrtc-rs
pub struct WebRtcEngine {
    pc: Arc<RTCPeerConnection>,
    data_channel: DataChannelSlot,
    events: EngineEventSender,
    audio_track: Option<Arc<TrackLocalStaticSample>>,
    tracks_added: bool,
}

impl WebRtcEngine {
    /// Build the peer connection and wire its callbacks into an event queue.
    ///
    /// The responder side adopts whatever data channel the remote opens.
    pub async fn new(config: &NegotiatorConfig) -> Result<(Self, EngineEvents), EngineError> {
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs()?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let pc = Arc::new(api.new_peer_connection(rtc_config(&config.ice_servers)).await?);
        let (tx, rx) = mpsc::unbounded_channel();

        let audio_track = config.audio_track.as_ref().map(|track_id| {
            Arc::new(TrackLocalStaticSample::new(
                RTCRtpCodecCapability {
                    mime_type: MIME_TYPE_OPUS.to_owned(),
                    clock_rate: 48000,
                    channels: 2,
                    ..Default::default()
                },
                track_id.clone(),
                "peerlink".to_owned(),
            ))
        });

        let engine = Self {
            pc,
            data_channel: Arc::new(Mutex::new(None)),
            events: tx,
            audio_track,
            tracks_added: false,
        };
        engine.register_handlers();
        Ok((engine, rx))
    }

    /// Sample writer for the configured audio track
    pub fn audio_track(&self) -> Option<Arc<TrackLocalStaticSample>> {
        self.audio_track.clone()
    }

    pub fn peer_connection(&self) -> Arc<RTCPeerConnection> {
        self.pc.clone()
    }

    fn register_handlers(&self) {
        let tx = self.events.clone();
        self.pc
            .on_ice_candidate(Box::new(move |cand: Option<RTCIceCandidate>| {
                match cand {
                    Some(c) => match c.to_json() {
                        Ok(init) => {
                            let candidate = IceCandidate {
                                candidate: init.candidate,
                                sdp_mid: init.sdp_mid.unwrap_or_default(),
                                sdp_mline_index: init.sdp_mline_index.unwrap_or(0),
                            };
                            dump_candidate("LOCAL", &candidate);
                            let _ = tx.send(EngineEvent::LocalCandidate(candidate));
                        }
                        Err(e) => warn!("Failed to serialize local candidate: {}", e),
                    },
                    None => {
                        debug!("ICE candidate gathering completed (null candidate received)");
                        let _ = tx.send(EngineEvent::GatheringComplete);
                    }
                }
                Box::pin(async {})
            }));

        let tx = self.events.clone();
        let pc_stats = Arc::downgrade(&self.pc);
        self.pc
            .on_peer_connection_state_change(Box::new(move |st: RTCPeerConnectionState| {
                debug!("Peer connection state changed to: {:?}", st);

                let state = match st {
                    RTCPeerConnectionState::Unspecified | RTCPeerConnectionState::New => {
                        PeerState::New
                    }
                    RTCPeerConnectionState::Connecting => PeerState::Connecting,
                    RTCPeerConnectionState::Connected => PeerState::Connected,
                    RTCPeerConnectionState::Disconnected => PeerState::Disconnected,
                    RTCPeerConnectionState::Failed => PeerState::Failed,
                    RTCPeerConnectionState::Closed => PeerState::Closed,
                };

                if matches!(state, PeerState::Disconnected | PeerState::Failed) {
                    if let Some(pc) = pc_stats.upgrade() {
                        tokio::spawn(async move {
                            dump_selected_pair(&pc, "BEFORE-FAIL").await;
                        });
                    }
                }

                let _ = tx.send(EngineEvent::ConnectionState(state));
                Box::pin(async {})
            }));

        let tx = self.events.clone();
        let slot = self.data_channel.clone();
        self.pc
            .on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
                info!("Remote opened data channel '{}'", dc.label());
                attach_dc(&dc, tx.clone());
                let slot = slot.clone();
                Box::pin(async move {
                    *slot.lock().await = Some(dc);
                })
            }));
    }
}

#[async_trait]
impl PeerEngine for WebRtcEngine {
    async fn create_offer(&mut self) -> Result<String, EngineError> {
        Ok(self.pc.create_offer(None).await?.sdp)
    }

    async fn create_answer(&mut self) -> Result<String, EngineError> {
        Ok(self.pc.create_answer(None).await?.sdp)
    }

    async fn set_local_description(
        &mut self,
        kind: SdpKind,
        sdp: String,
    ) -> Result<(), EngineError> {
        self.pc.set_local_description(description(kind, sdp)?).await?;
        Ok(())
    }

    async fn set_remote_description(
        &mut self,
        kind: SdpKind,
        sdp: String,
    ) -> Result<(), EngineError> {
        self.pc.set_remote_description(description(kind, sdp)?).await?;
        Ok(())
    }

    async fn add_ice_candidate(&mut self, candidate: IceCandidate) -> Result<(), EngineError> {
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate,
            sdp_mid: Some(candidate.sdp_mid).filter(|mid| !mid.is_empty()),
            sdp_mline_index: Some(candidate.sdp_mline_index),
            username_fragment: None,
        };
        self.pc.add_ice_candidate(init).await?;
        Ok(())
    }

    async fn create_data_channel(&mut self, label: &str) -> Result<(), EngineError> {
        let dc = self
            .pc
            .create_data_channel(label, Some(RTCDataChannelInit::default()))
            .await?;
        attach_dc(&dc, self.events.clone());
        *self.data_channel.lock().await = Some(dc);
        Ok(())
    }

    async fn add_tracks(&mut self) -> Result<(), EngineError> {
        if self.tracks_added {
            return Ok(());
        }
        if let Some(track) = &self.audio_track {
            let sender = self
                .pc
                .add_track(track.clone() as Arc<dyn TrackLocal + Send + Sync>)
                .await?;

            // RTCP has to be read for interceptors (NACK, reports) to work
            tokio::spawn(async move {
                let mut rtcp_buf = vec![0u8; 1500];
                while sender.read(&mut rtcp_buf).await.is_ok() {}
            });
            info!("Attached audio track '{}'", track.id());
        }
        self.tracks_added = true;
        Ok(())
    }

    async fn send_data(&mut self, data: Bytes) -> Result<(), EngineError> {
        let dc = self.data_channel.lock().await.clone();
        match dc {
            Some(dc) => {
                dc.send(&data).await?;
                Ok(())
            }
            None => Err(EngineError("no data channel available".into())),
        }
    }

    async fn close(&mut self) -> Result<(), EngineError> {
        if let Some(dc) = self.data_channel.lock().await.take() {
            let _ = dc.close().await;
        }
        self.pc.close().await?;
        Ok(())
    }
}

fn description(kind: SdpKind, sdp: String) -> Result<RTCSessionDescription, EngineError> {
    let desc = match kind {
        SdpKind::Offer => RTCSessionDescription::offer(sdp)?,
        SdpKind::Answer => RTCSessionDescription::answer(sdp)?,
    };
    Ok(desc)
}

/// Peer connection configuration from the configured ICE servers
fn rtc_config(servers: &[ServerConfig]) -> RTCConfiguration {
    RTCConfiguration {
        ice_servers: get_user_ice_servers(servers),
        ice_candidate_pool_size: 10,
        bundle_policy: RTCBundlePolicy::MaxBundle,
        rtcp_mux_policy: RTCRtcpMuxPolicy::Require,
        ..Default::default()
    }
}

pub fn get_user_ice_servers(servers: &[ServerConfig]) -> Vec<RTCIceServer> {
    servers
        .iter()
        .map(|config| RTCIceServer {
            urls: vec![add_ice_url_scheme(config)],
            username: config.username.clone().unwrap_or_default(),
            credential: config.credential.clone().unwrap_or_default(),
        })
        .collect()
}
