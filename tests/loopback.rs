//! Two sessions negotiating through an in-memory relay, with engines that
//! link up as soon as the answer is applied.

use async_trait::async_trait;
use bytes::Bytes;
use peerlink::peer::engine::EngineEventSender;
use peerlink::{
    ChannelEvent, EngineError, EngineEvent, IceCandidate, NegotiationSession, NegotiatorConfig,
    PeerEngine, PeerState, Phase, Role, SdpKind, SessionEvent, SessionHandle, SignalingChannel,
};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

struct RelayEnd {
    inbound: mpsc::UnboundedReceiver<String>,
    outbound: mpsc::UnboundedSender<String>,
}

#[async_trait]
impl SignalingChannel for RelayEnd {
    async fn connect(&mut self, _url: &str) -> peerlink::Result<()> {
        Ok(())
    }

    async fn send(&mut self, text: String) -> peerlink::Result<()> {
        self.outbound
            .send(text)
            .map_err(|_| peerlink::Error::SignalingClosed)
    }

    async fn recv(&mut self) -> ChannelEvent {
        match self.inbound.recv().await {
            Some(text) => ChannelEvent::Message(text),
            None => ChannelEvent::Closed,
        }
    }

    async fn close(&mut self) {}
}

fn relay() -> (RelayEnd, RelayEnd) {
    let (a_tx, a_rx) = mpsc::unbounded_channel();
    let (b_tx, b_rx) = mpsc::unbounded_channel();
    (
        RelayEnd {
            inbound: a_rx,
            outbound: b_tx,
        },
        RelayEnd {
            inbound: b_rx,
            outbound: a_tx,
        },
    )
}

/// Engine half whose data goes straight to the other half
struct LinkedEngine {
    own: EngineEventSender,
    peer: EngineEventSender,
    candidates: Arc<Mutex<Vec<String>>>,
}

impl LinkedEngine {
    fn link_up(&self) {
        for tx in [&self.own, &self.peer] {
            let _ = tx.send(EngineEvent::ConnectionState(PeerState::Connected));
            let _ = tx.send(EngineEvent::DataChannelOpen);
        }
    }
}

#[async_trait]
impl PeerEngine for LinkedEngine {
    async fn create_offer(&mut self) -> Result<String, EngineError> {
        Ok("v=0 offer".into())
    }

    async fn create_answer(&mut self) -> Result<String, EngineError> {
        Ok("v=0 answer".into())
    }

    async fn set_local_description(
        &mut self,
        _kind: SdpKind,
        _sdp: String,
    ) -> Result<(), EngineError> {
        let _ = self.own.send(EngineEvent::LocalCandidate(IceCandidate {
            candidate: "candidate:1 1 udp 2122260223 127.0.0.1 50000 typ host".into(),
            sdp_mid: "0".into(),
            sdp_mline_index: 0,
        }));
        let _ = self.own.send(EngineEvent::GatheringComplete);
        Ok(())
    }

    async fn set_remote_description(
        &mut self,
        kind: SdpKind,
        _sdp: String,
    ) -> Result<(), EngineError> {
        if kind == SdpKind::Answer {
            self.link_up();
        }
        Ok(())
    }

    async fn add_ice_candidate(&mut self, candidate: IceCandidate) -> Result<(), EngineError> {
        self.candidates.lock().unwrap().push(candidate.candidate);
        Ok(())
    }

    async fn create_data_channel(&mut self, _label: &str) -> Result<(), EngineError> {
        Ok(())
    }

    async fn add_tracks(&mut self) -> Result<(), EngineError> {
        Ok(())
    }

    async fn send_data(&mut self, data: Bytes) -> Result<(), EngineError> {
        self.peer
            .send(EngineEvent::DataMessage(data))
            .map_err(|_| EngineError("peer gone".into()))
    }

    async fn close(&mut self) -> Result<(), EngineError> {
        let _ = self
            .peer
            .send(EngineEvent::ConnectionState(PeerState::Disconnected));
        Ok(())
    }
}

struct Pair {
    initiator: SessionHandle,
    responder: SessionHandle,
    initiator_candidates: Arc<Mutex<Vec<String>>>,
    responder_candidates: Arc<Mutex<Vec<String>>>,
}

fn pair() -> Pair {
    let (relay_a, relay_b) = relay();
    let (a_tx, a_rx) = mpsc::unbounded_channel();
    let (b_tx, b_rx) = mpsc::unbounded_channel();
    let initiator_candidates = Arc::new(Mutex::new(Vec::new()));
    let responder_candidates = Arc::new(Mutex::new(Vec::new()));

    let engine_a = LinkedEngine {
        own: a_tx.clone(),
        peer: b_tx.clone(),
        candidates: initiator_candidates.clone(),
    };
    let engine_b = LinkedEngine {
        own: b_tx,
        peer: a_tx,
        candidates: responder_candidates.clone(),
    };

    let initiator = NegotiationSession::spawn(
        Role::Initiator,
        NegotiatorConfig::default(),
        relay_a,
        engine_a,
        a_rx,
    );
    let responder = NegotiationSession::spawn(
        Role::Responder,
        NegotiatorConfig::default(),
        relay_b,
        engine_b,
        b_rx,
    );

    Pair {
        initiator,
        responder,
        initiator_candidates,
        responder_candidates,
    }
}

async fn next_payload(handle: &mut SessionHandle) -> Bytes {
    loop {
        match handle.next_event().await {
            Some(SessionEvent::PayloadReceived(payload)) => return payload,
            Some(_) => continue,
            None => panic!("session ended before a payload arrived"),
        }
    }
}

#[tokio::test]
async fn both_sides_reach_connected() {
    let mut p = pair();

    assert_eq!(
        p.initiator.wait_for_phase(Phase::Connected).await,
        Ok(Phase::Connected)
    );
    assert_eq!(
        p.responder.wait_for_phase(Phase::Connected).await,
        Ok(Phase::Connected)
    );
    // each side trickled one host candidate to the other
    for _ in 0..100 {
        let applied = (
            p.initiator_candidates.lock().unwrap().len(),
            p.responder_candidates.lock().unwrap().len(),
        );
        if applied == (1, 1) {
            return;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    panic!("trickled candidates were not applied on both sides");
}

#[tokio::test]
async fn image_sized_payload_arrives_intact() {
    let mut p = pair();
    p.initiator.wait_for_phase(Phase::Connected).await.unwrap();
    p.responder.wait_for_phase(Phase::Connected).await.unwrap();

    let image: Vec<u8> = (0..1024 * 1024u32).map(|i| (i * 31 % 256) as u8).collect();
    p.initiator.send_payload(image.clone()).await.unwrap();

    let received = next_payload(&mut p.responder).await;
    assert_eq!(received.len(), image.len());
    assert_eq!(&received[..], &image[..]);
}

#[tokio::test]
async fn payloads_flow_both_ways_in_order() {
    let mut p = pair();
    p.initiator.wait_for_phase(Phase::Connected).await.unwrap();
    p.responder.wait_for_phase(Phase::Connected).await.unwrap();

    p.responder.send_payload(&b"first"[..]).await.unwrap();
    p.responder.send_payload(vec![7u8; 40_000]).await.unwrap();
    p.initiator.send_payload(&b"reply"[..]).await.unwrap();

    assert_eq!(&next_payload(&mut p.initiator).await[..], b"first");
    assert_eq!(next_payload(&mut p.initiator).await.len(), 40_000);
    assert_eq!(&next_payload(&mut p.responder).await[..], b"reply");
}

#[tokio::test]
async fn closing_one_side_leaves_it_closed() {
    let mut p = pair();
    p.initiator.wait_for_phase(Phase::Connected).await.unwrap();
    p.responder.wait_for_phase(Phase::Connected).await.unwrap();

    p.initiator.close();
    assert_eq!(p.initiator.join().await, Ok(()));

    // the responder only sees a transient disconnect and keeps waiting
    assert_eq!(p.responder.phase(), Phase::Connected);
    p.responder.close();
    assert_eq!(
        p.responder.wait_for_phase(Phase::Closed).await,
        Ok(Phase::Closed)
    );
}
