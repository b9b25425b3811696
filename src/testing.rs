//! Scripted collaborators for driving a session without network or ICE

use crate::config::{LoggingConfig, NegotiatorConfig};
use crate::error::{EngineError, Error, NegotiationStep, Result};
use crate::logger::init_logging;
use crate::peer::engine::{EngineEvent, EngineEventSender, PeerEngine};
use crate::peer::types::{IceCandidate, Role, SdpKind};
use crate::session::{NegotiationSession, SessionHandle};
use crate::signaling::{ChannelEvent, SignalingChannel, SignalingMessage};
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

/// Relay stand-in: the test feeds inbound text and reads what the session sent
pub struct ScriptedChannel {
    connect_error: Option<String>,
    connect_hangs: bool,
    /// Sends beyond this count fail as if the relay went away
    send_limit: Option<usize>,
    sent: usize,
    inbound: mpsc::UnboundedReceiver<ChannelEvent>,
    outbound: mpsc::UnboundedSender<String>,
    closes: Arc<AtomicUsize>,
}

#[async_trait]
impl SignalingChannel for ScriptedChannel {
    async fn connect(&mut self, _url: &str) -> Result<()> {
        if self.connect_hangs {
            std::future::pending::<()>().await;
        }
        match &self.connect_error {
            Some(reason) => Err(Error::ChannelConnect(reason.clone())),
            None => Ok(()),
        }
    }

    async fn send(&mut self, text: String) -> Result<()> {
        if self.send_limit.is_some_and(|limit| self.sent >= limit) {
            return Err(Error::SignalingClosed);
        }
        self.sent += 1;
        self.outbound.send(text).map_err(|_| Error::SignalingClosed)
    }

    async fn recv(&mut self) -> ChannelEvent {
        self.inbound.recv().await.unwrap_or(ChannelEvent::Closed)
    }

    async fn close(&mut self) {
        self.closes.fetch_add(1, Ordering::SeqCst);
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineCall {
    CreateOffer,
    CreateAnswer,
    SetLocal(SdpKind, String),
    SetRemote(SdpKind, String),
    AddCandidate(String),
    CreateDataChannel(String),
    AddTracks,
    SendData(Bytes),
    Close,
}

/// Engine that records every call and can be told to fail one step
pub struct RecordingEngine {
    calls: Arc<Mutex<Vec<EngineCall>>>,
    fail_step: Option<NegotiationStep>,
    reject_candidates: bool,
}

impl RecordingEngine {
    fn record(&self, call: EngineCall) {
        self.calls.lock().unwrap().push(call);
    }

    fn check(&self, step: NegotiationStep) -> std::result::Result<(), EngineError> {
        if self.fail_step == Some(step) {
            return Err(EngineError(format!("scripted {step} failure")));
        }
        Ok(())
    }
}

#[async_trait]
impl PeerEngine for RecordingEngine {
    async fn create_offer(&mut self) -> std::result::Result<String, EngineError> {
        self.record(EngineCall::CreateOffer);
        self.check(NegotiationStep::CreateOffer)?;
        Ok("offer-sdp".into())
    }

    async fn create_answer(&mut self) -> std::result::Result<String, EngineError> {
        self.record(EngineCall::CreateAnswer);
        self.check(NegotiationStep::CreateAnswer)?;
        Ok("answer-sdp".into())
    }

    async fn set_local_description(
        &mut self,
        kind: SdpKind,
        sdp: String,
    ) -> std::result::Result<(), EngineError> {
        self.record(EngineCall::SetLocal(kind, sdp));
        self.check(NegotiationStep::SetLocalDescription)
    }

    async fn set_remote_description(
        &mut self,
        kind: SdpKind,
        sdp: String,
    ) -> std::result::Result<(), EngineError> {
        self.record(EngineCall::SetRemote(kind, sdp));
        self.check(NegotiationStep::SetRemoteDescription)
    }

    async fn add_ice_candidate(
        &mut self,
        candidate: IceCandidate,
    ) -> std::result::Result<(), EngineError> {
        self.record(EngineCall::AddCandidate(candidate.candidate));
        if self.reject_candidates {
            return Err(EngineError("candidate rejected".into()));
        }
        Ok(())
    }

    async fn create_data_channel(&mut self, label: &str) -> std::result::Result<(), EngineError> {
        self.record(EngineCall::CreateDataChannel(label.to_owned()));
        self.check(NegotiationStep::CreateDataChannel)
    }

    async fn add_tracks(&mut self) -> std::result::Result<(), EngineError> {
        self.record(EngineCall::AddTracks);
        self.check(NegotiationStep::AddTracks)
    }

    async fn send_data(&mut self, data: Bytes) -> std::result::Result<(), EngineError> {
        self.record(EngineCall::SendData(data));
        Ok(())
    }

    async fn close(&mut self) -> std::result::Result<(), EngineError> {
        self.record(EngineCall::Close);
        Ok(())
    }
}

#[derive(Debug, Clone, Default)]
pub struct HarnessOptions {
    pub connect_error: Option<String>,
    pub connect_hangs: bool,
    pub send_limit: Option<usize>,
    pub no_data_channel: bool,
    pub fail_step: Option<NegotiationStep>,
    pub reject_candidates: bool,
}

/// A spawned session plus the test's ends of its collaborators
pub struct Harness {
    pub handle: SessionHandle,
    pub calls: Arc<Mutex<Vec<EngineCall>>>,
    pub channel_closed: Arc<AtomicUsize>,
    relay_in: mpsc::UnboundedSender<ChannelEvent>,
    relay_out: mpsc::UnboundedReceiver<String>,
    engine_events: EngineEventSender,
}

impl Harness {
    pub fn start(role: Role, options: HarnessOptions) -> Self {
        init_logging(&LoggingConfig {
            enabled: true,
            level: "debug".into(),
        });

        let (relay_in, inbound) = mpsc::unbounded_channel();
        let (outbound, relay_out) = mpsc::unbounded_channel();
        let (engine_events, events_rx) = mpsc::unbounded_channel();
        let calls = Arc::new(Mutex::new(Vec::new()));
        let channel_closed = Arc::new(AtomicUsize::new(0));

        let channel = ScriptedChannel {
            connect_error: options.connect_error,
            connect_hangs: options.connect_hangs,
            send_limit: options.send_limit,
            sent: 0,
            inbound,
            outbound,
            closes: channel_closed.clone(),
        };
        let engine = RecordingEngine {
            calls: calls.clone(),
            fail_step: options.fail_step,
            reject_candidates: options.reject_candidates,
        };

        let mut config = NegotiatorConfig::default();
        if options.no_data_channel {
            config.data_channel_label = None;
        }

        let handle = NegotiationSession::spawn(
            role,
            config,
            channel,
            engine,
            events_rx,
        );

        Self {
            handle,
            calls,
            channel_closed,
            relay_in,
            relay_out,
            engine_events,
        }
    }

    /// Deliver raw text as if the relay forwarded it
    pub fn deliver(&self, text: &str) {
        let _ = self.relay_in.send(ChannelEvent::Message(text.to_owned()));
    }

    pub fn relay_close(&self) {
        let _ = self.relay_in.send(ChannelEvent::Closed);
    }

    pub fn engine_event(&self, event: EngineEvent) {
        let _ = self.engine_events.send(event);
    }

    /// Next message the session pushed to the relay, decoded
    pub async fn next_sent(&mut self) -> SignalingMessage {
        let text = tokio::time::timeout(Duration::from_secs(5), self.relay_out.recv())
            .await
            .expect("session sent nothing")
            .expect("relay output closed");
        SignalingMessage::decode(&text).expect("session sent undecodable text")
    }

    pub fn calls(&self) -> Vec<EngineCall> {
        self.calls.lock().unwrap().clone()
    }
}

/// Wire text of a candidate message
pub fn candidate_wire(candidate: &str, mline: u16) -> String {
    SignalingMessage::Candidate {
        candidate: candidate.to_owned(),
        sdp_mid: mline.to_string(),
        sdp_mline_index: mline,
    }
    .encode()
    .unwrap()
}

/// Poll until at least `n` engine calls were recorded
pub async fn wait_for_calls(calls: &Arc<Mutex<Vec<EngineCall>>>, n: usize) {
    for _ in 0..500 {
        if calls.lock().unwrap().len() >= n {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!(
        "expected {} engine calls, got {:?}",
        n,
        calls.lock().unwrap()
    );
}
