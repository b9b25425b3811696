//! Negotiation state machine.
//!
//! One session runs as one task. Signaling-channel events, engine events and
//! application commands are merged in a single `select!` loop, so session
//! state is only ever touched from that task.

use crate::config::NegotiatorConfig;
use crate::error::{DecodeError, EngineError, Error, NegotiationStep, Result};
use crate::logger::{analyze_candidates, dump_candidate, init_logging};
use crate::peer::data_channel::DataExchange;
use crate::peer::engine::{EngineEvent, EngineEvents, PeerEngine};
use crate::peer::ice::CandidateBuffer;
use crate::peer::types::{IceCandidate, PeerState, Phase, Role, SdpKind};
use crate::peer::WebRtcEngine;
use crate::signaling::{ChannelEvent, SignalingChannel, SignalingMessage, WsSignalingChannel};
use crate::utils::random_id;
use bytes::Bytes;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, timeout_at, Instant};
use tracing::{debug, error, info, warn};
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

/// Diagnostics and data reported by a running session
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    PhaseChanged(Phase),
    /// A signaling message was dropped because it did not decode
    DecodeFailed(DecodeError),
    /// A well-formed message that makes no sense in the current state
    MessageIgnored(&'static str),
    /// The engine refused a remote candidate; negotiation continues
    CandidateRejected(Error),
    PayloadReceived(Bytes),
    /// An inbound or outbound transfer was abandoned; the session continues
    TransferFailed(Error),
    /// Peer link reported a transient disconnect
    ConnectionProblem,
    ConnectionRecovered,
    /// Terminal error, followed by `PhaseChanged(Failed)`
    Failed(Error),
}

enum Command {
    Send {
        payload: Bytes,
        reply: oneshot::Sender<Result<()>>,
    },
    Close,
}

/// Caller side of a spawned session.
///
/// Dropping the handle closes the session.
///
/// [`SessionEvent`]s, received payloads included, stay queued until taken with
/// [`SessionHandle::next_event`]. A caller that only watches the phase still
/// holds every received payload in memory; drain the events, or drop the
/// handle once done.
pub struct SessionHandle {
    id: String,
    commands: mpsc::UnboundedSender<Command>,
    phase: watch::Receiver<Phase>,
    events: mpsc::UnboundedReceiver<SessionEvent>,
    task: JoinHandle<Result<()>>,
}

impl SessionHandle {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn phase(&self) -> Phase {
        *self.phase.borrow()
    }

    /// Wait until the session reaches `target` or a terminal phase; returns the phase reached
    pub async fn wait_for_phase(&mut self, target: Phase) -> Result<Phase> {
        self.phase
            .wait_for(|p| *p == target || p.is_terminal())
            .await
            .map(|p| *p)
            .map_err(|_| Error::SessionEnded)
    }

    /// Queue a payload for the peer. Fails with `NotConnected` before `Connected`.
    pub async fn send_payload(&self, payload: impl Into<Bytes>) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::Send {
                payload: payload.into(),
                reply,
            })
            .map_err(|_| Error::SessionEnded)?;
        rx.await.map_err(|_| Error::SessionEnded)?
    }

    /// Ask the session to close; it ends in `Closed`
    pub fn close(&self) {
        let _ = self.commands.send(Command::Close);
    }

    pub async fn next_event(&mut self) -> Option<SessionEvent> {
        self.events.recv().await
    }

    /// Wait for the session task and return its terminal result
    pub async fn join(self) -> Result<()> {
        let SessionHandle { task, commands, .. } = self;
        let result = task.await.map_err(|e| {
            error!("Session task panicked or was aborted: {}", e);
            Error::SessionEnded
        })?;
        drop(commands);
        result
    }
}

/// One peer-to-peer negotiation attempt
pub struct NegotiationSession {
    id: String,
    role: Role,
    config: NegotiatorConfig,
    phase: Phase,
    phase_tx: watch::Sender<Phase>,

    channel: Box<dyn SignalingChannel>,
    engine: Box<dyn PeerEngine>,
    engine_events: EngineEvents,
    commands: mpsc::UnboundedReceiver<Command>,
    events: mpsc::UnboundedSender<SessionEvent>,

    local_description_set: bool,
    candidates: CandidateBuffer,
    local_candidates: Vec<IceCandidate>,
    data: Option<DataExchange>,
    data_channel_open: bool,

    deadline: Option<Instant>,
    grace_deadline: Option<Instant>,
    signaling_open: bool,
    engine_open: bool,
    released: bool,
}

impl NegotiationSession {
    /// Spawn a session over the given collaborators and start negotiating
    pub fn spawn<C, E>(
        role: Role,
        config: NegotiatorConfig,
        channel: C,
        engine: E,
        engine_events: EngineEvents,
    ) -> SessionHandle
    where
        C: SignalingChannel + 'static,
        E: PeerEngine + 'static,
    {
        let id = random_id();
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (phase_tx, phase_rx) = watch::channel(Phase::Idle);

        let session = NegotiationSession {
            id: id.clone(),
            role,
            config,
            phase: Phase::Idle,
            phase_tx,
            channel: Box::new(channel),
            engine: Box::new(engine),
            engine_events,
            commands: cmd_rx,
            events: event_tx,
            local_description_set: false,
            candidates: CandidateBuffer::new(),
            local_candidates: Vec::new(),
            data: None,
            data_channel_open: false,
            deadline: None,
            grace_deadline: None,
            signaling_open: false,
            engine_open: true,
            released: false,
        };

        let task = tokio::spawn(session.run());

        SessionHandle {
            id,
            commands: cmd_tx,
            phase: phase_rx,
            events: event_rx,
            task,
        }
    }

    /// Build a webrtc-rs engine and a WebSocket channel from `config` and spawn a session.
    ///
    /// Also returns the audio track to write samples into, when one is configured.
    pub async fn start(
        role: Role,
        config: NegotiatorConfig,
    ) -> Result<(SessionHandle, Option<Arc<TrackLocalStaticSample>>)> {
        config.validate()?;
        init_logging(&config.logging);

        let (engine, engine_events) =
            WebRtcEngine::new(&config)
                .await
                .map_err(|source| Error::Description {
                    step: NegotiationStep::CreatePeerConnection,
                    source,
                })?;
        let audio_track = engine.audio_track();

        let handle = Self::spawn(role, config, WsSignalingChannel::new(), engine, engine_events);
        Ok((handle, audio_track))
    }

    async fn run(mut self) -> Result<()> {
        info!(session = %self.id, role = %self.role, "Starting negotiation session");

        let result = match self.start_negotiation().await {
            Ok(true) => self.event_loop().await,
            Ok(false) => Ok(()),
            Err(e) => Err(e),
        };
        self.release().await;

        match &result {
            Ok(()) => {
                info!(session = %self.id, "Session closed");
                self.set_phase(Phase::Closed);
            }
            Err(e) => {
                error!(session = %self.id, phase = ?self.phase, "Session failed: {}", e);
                self.emit(SessionEvent::Failed(e.clone()));
                self.set_phase(Phase::Failed);
            }
        }
        result
    }

    /// Connect to the relay and, as initiator, send the offer.
    /// Returns `false` when the caller closed the session first.
    async fn start_negotiation(&mut self) -> Result<bool> {
        self.set_phase(Phase::ChannelConnecting);
        let deadline = Instant::now() + self.config.negotiation_timeout;
        self.deadline = Some(deadline);

        let url = self.config.signaling_url.clone();
        let outcome = {
            let connect = timeout_at(deadline, self.channel.connect(&url));
            tokio::pin!(connect);

            loop {
                tokio::select! {
                    biased;

                    cmd = self.commands.recv() => match cmd {
                        Some(Command::Send { reply, .. }) => {
                            let _ = reply.send(Err(Error::NotConnected));
                        }
                        Some(Command::Close) | None => break None,
                    },

                    result = &mut connect => break Some(result),
                }
            }
        };

        match outcome {
            None => {
                info!(session = %self.id, "Closed while connecting to signaling");
                return Ok(false);
            }
            Some(Ok(Ok(()))) => {}
            Some(Ok(Err(Error::ChannelConnect(reason)))) => {
                return Err(Error::ChannelConnect(reason))
            }
            Some(Ok(Err(other))) => return Err(Error::ChannelConnect(other.to_string())),
            Some(Err(_)) => return Err(Error::NegotiationTimeout(self.config.negotiation_timeout)),
        }
        self.signaling_open = true;
        self.set_phase(Phase::Negotiating);

        if self.close_requested() {
            info!(session = %self.id, "Closed before negotiation started");
            return Ok(false);
        }
        if self.role == Role::Initiator {
            self.send_offer().await?;
        }
        Ok(true)
    }

    /// Drain commands that arrived while connecting; payloads are refused
    fn close_requested(&mut self) -> bool {
        loop {
            match self.commands.try_recv() {
                Ok(Command::Send { reply, .. }) => {
                    let _ = reply.send(Err(Error::NotConnected));
                }
                Ok(Command::Close) | Err(mpsc::error::TryRecvError::Disconnected) => return true,
                Err(mpsc::error::TryRecvError::Empty) => return false,
            }
        }
    }

    async fn event_loop(&mut self) -> Result<()> {
        loop {
            let deadline = self.deadline;
            let grace = self.grace_deadline;

            tokio::select! {
                biased;

                cmd = self.commands.recv() => match cmd {
                    Some(Command::Close) => {
                        info!(session = %self.id, "Close requested");
                        return Ok(());
                    }
                    Some(Command::Send { payload, reply }) => {
                        let _ = reply.send(self.send_payload(payload).await);
                    }
                    None => {
                        debug!(session = %self.id, "All handles dropped, closing");
                        return Ok(());
                    }
                },

                event = self.channel.recv(), if self.signaling_open => {
                    self.on_channel_event(event).await?;
                }

                event = self.engine_events.recv(), if self.engine_open => match event {
                    Some(event) => self.on_engine_event(event).await?,
                    None => {
                        debug!(session = %self.id, "Engine event queue closed");
                        self.engine_open = false;
                    }
                },

                _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    return Err(Error::NegotiationTimeout(self.config.negotiation_timeout));
                }

                _ = sleep_until(grace.unwrap_or_else(Instant::now)), if grace.is_some() => {
                    warn!(session = %self.id, "Connection did not recover within grace period");
                    return Err(Error::UnexpectedDisconnect);
                }
            }
        }
    }

    // ---- signaling ----

    async fn on_channel_event(&mut self, event: ChannelEvent) -> Result<()> {
        match event {
            ChannelEvent::Closed => {
                self.signaling_open = false;
                if self.phase == Phase::Connected {
                    info!(session = %self.id, "Signaling channel closed, peer link stays up");
                    Ok(())
                } else {
                    Err(Error::SignalingClosed)
                }
            }
            ChannelEvent::Message(text) => match SignalingMessage::decode(&text) {
                Ok(msg) => self.on_signal(msg).await,
                Err(e) => {
                    warn!(session = %self.id, "Dropping signaling message: {}", e);
                    self.emit(SessionEvent::DecodeFailed(e));
                    Ok(())
                }
            },
        }
    }

    async fn on_signal(&mut self, msg: SignalingMessage) -> Result<()> {
        debug!(session = %self.id, kind = msg.kind(), "Signaling message received");

        match msg {
            SignalingMessage::Offer { sdp } if self.role == Role::Responder => {
                if self.candidates.is_open() {
                    self.ignore("offer", "remote description already set");
                    return Ok(());
                }
                self.on_offer(sdp).await
            }
            SignalingMessage::Answer { sdp } if self.role == Role::Initiator => {
                if self.candidates.is_open() {
                    self.ignore("answer", "remote description already set");
                    return Ok(());
                }
                if !self.local_description_set {
                    self.ignore("answer", "no offer outstanding");
                    return Ok(());
                }
                self.apply_remote_description(SdpKind::Answer, sdp).await
            }
            SignalingMessage::Candidate {
                candidate,
                sdp_mid,
                sdp_mline_index,
            } => {
                let candidate = IceCandidate {
                    candidate,
                    sdp_mid,
                    sdp_mline_index,
                };
                dump_candidate("REMOTE", &candidate);

                if self.candidates.is_open() {
                    self.apply_candidate(candidate).await;
                } else {
                    self.candidates.push(candidate);
                }
                Ok(())
            }
            other => {
                self.ignore(other.kind(), "not expected for this role");
                Ok(())
            }
        }
    }

    fn ignore(&mut self, kind: &'static str, why: &str) {
        warn!(session = %self.id, role = %self.role, "Ignoring {}: {}", kind, why);
        self.emit(SessionEvent::MessageIgnored(kind));
    }

    async fn send_offer(&mut self) -> Result<()> {
        if let Some(label) = self.config.data_channel_label.clone() {
            self.engine
                .create_data_channel(&label)
                .await
                .map_err(step(NegotiationStep::CreateDataChannel))?;
        }
        self.engine
            .add_tracks()
            .await
            .map_err(step(NegotiationStep::AddTracks))?;

        debug!(session = %self.id, "Creating offer");
        let sdp = self
            .engine
            .create_offer()
            .await
            .map_err(step(NegotiationStep::CreateOffer))?;
        self.engine
            .set_local_description(SdpKind::Offer, sdp.clone())
            .await
            .map_err(step(NegotiationStep::SetLocalDescription))?;
        self.local_description_set = true;

        self.signal(SignalingMessage::Offer { sdp }).await
    }

    async fn on_offer(&mut self, sdp: String) -> Result<()> {
        self.apply_remote_description(SdpKind::Offer, sdp).await?;

        self.engine
            .add_tracks()
            .await
            .map_err(step(NegotiationStep::AddTracks))?;

        debug!(session = %self.id, "Creating answer");
        let sdp = self
            .engine
            .create_answer()
            .await
            .map_err(step(NegotiationStep::CreateAnswer))?;
        self.engine
            .set_local_description(SdpKind::Answer, sdp.clone())
            .await
            .map_err(step(NegotiationStep::SetLocalDescription))?;
        self.local_description_set = true;

        self.signal(SignalingMessage::Answer { sdp }).await
    }

    /// Apply the remote description, then flush candidates queued before it
    async fn apply_remote_description(&mut self, kind: SdpKind, sdp: String) -> Result<()> {
        self.engine
            .set_remote_description(kind, sdp)
            .await
            .map_err(step(NegotiationStep::SetRemoteDescription))?;
        self.candidates.open();

        let pending = self.candidates.drain_if_ready();
        if !pending.is_empty() {
            debug!(session = %self.id, "Applying {} buffered candidates", pending.len());
        }
        for candidate in pending {
            self.apply_candidate(candidate).await;
        }
        Ok(())
    }

    async fn apply_candidate(&mut self, candidate: IceCandidate) {
        if let Err(e) = self.engine.add_ice_candidate(candidate).await {
            warn!(session = %self.id, "Failed to add ICE candidate: {}", e);
            self.emit(SessionEvent::CandidateRejected(Error::CandidateApply(e)));
        }
    }

    /// Send through the relay. Once connected, losing the relay is not fatal.
    async fn signal(&mut self, msg: SignalingMessage) -> Result<()> {
        debug!(session = %self.id, kind = msg.kind(), "Sending signaling message");
        match self.channel.send(msg.encode()?).await {
            Err(e) if self.phase == Phase::Connected => {
                warn!(session = %self.id, "Signaling send failed ({}), peer link stays up", e);
                self.signaling_open = false;
                Ok(())
            }
            result => result,
        }
    }

    // ---- engine ----

    async fn on_engine_event(&mut self, event: EngineEvent) -> Result<()> {
        match event {
            EngineEvent::LocalCandidate(candidate) => {
                self.local_candidates.push(candidate.clone());
                if self.signaling_open {
                    self.signal(candidate.into()).await?;
                } else {
                    debug!(session = %self.id, "Signaling closed, not trickling local candidate");
                }
            }
            EngineEvent::GatheringComplete => {
                analyze_candidates(&self.local_candidates);
            }
            EngineEvent::ConnectionState(state) => self.on_peer_state(state).await?,
            EngineEvent::DataChannelOpen => {
                self.data_channel_open = true;
                if let Some(data) = self.data.as_mut() {
                    data.set_channel_open(true);
                }
                if let Err(e) = self.flush_outbound().await {
                    self.emit(SessionEvent::TransferFailed(e));
                }
            }
            EngineEvent::DataMessage(frame) => match self.data.as_mut() {
                Some(data) => match data.receive(&frame) {
                    Ok(Some(payload)) => {
                        info!(session = %self.id, "Received payload ({} bytes)", payload.len());
                        self.emit(SessionEvent::PayloadReceived(payload));
                    }
                    Ok(None) => {}
                    Err(e) => {
                        warn!(session = %self.id, "Inbound transfer abandoned: {}", e);
                        self.emit(SessionEvent::TransferFailed(e));
                    }
                },
                None => warn!(session = %self.id, "Data message before connected, dropped"),
            },
            EngineEvent::DataChannelClosed => {
                self.data_channel_open = false;
                if let Some(data) = self.data.as_mut() {
                    data.set_channel_open(false);
                }
            }
        }
        Ok(())
    }

    async fn on_peer_state(&mut self, state: PeerState) -> Result<()> {
        match (state, self.phase) {
            (PeerState::Connected, Phase::Negotiating) => {
                self.deadline = None;
                let mut data = DataExchange::new(
                    self.config.max_message_size,
                    self.config.max_reassembly_bytes,
                );
                data.set_channel_open(self.data_channel_open);
                self.data = Some(data);
                self.set_phase(Phase::Connected);
                if let Err(e) = self.flush_outbound().await {
                    self.emit(SessionEvent::TransferFailed(e));
                }
            }
            (PeerState::Connected, Phase::Connected) => {
                if self.grace_deadline.take().is_some() {
                    info!(session = %self.id, "Connection recovered");
                    self.emit(SessionEvent::ConnectionRecovered);
                }
            }
            (PeerState::Disconnected, Phase::Connected) => {
                if self.grace_deadline.is_none() {
                    warn!(
                        session = %self.id,
                        "Peer link disconnected, waiting {:?} for recovery",
                        self.config.disconnect_grace_period
                    );
                    self.grace_deadline =
                        Some(Instant::now() + self.config.disconnect_grace_period);
                    self.emit(SessionEvent::ConnectionProblem);
                }
            }
            (PeerState::Failed, Phase::Negotiating) => return Err(Error::ConnectivityFailed),
            (PeerState::Failed | PeerState::Closed, Phase::Connected)
            | (PeerState::Closed, Phase::Negotiating) => return Err(Error::UnexpectedDisconnect),
            (state, phase) => {
                debug!(session = %self.id, "Peer state {:?} in {:?}, nothing to do", state, phase);
            }
        }
        Ok(())
    }

    // ---- data exchange ----

    async fn send_payload(&mut self, payload: Bytes) -> Result<()> {
        let data = self.data.as_mut().ok_or(Error::NotConnected)?;
        // the initiator only gets a data channel if it opened one
        if self.role == Role::Initiator && self.config.data_channel_label.is_none() {
            return Err(Error::DataChannel(EngineError(
                "no data channel configured".into(),
            )));
        }
        debug!(session = %self.id, "Queueing payload ({} bytes)", payload.len());
        data.enqueue(payload);
        self.flush_outbound().await
    }

    /// Transmit queued payloads in order while the data channel is open.
    /// A failed payload is dropped and reported; the rest stay queued.
    async fn flush_outbound(&mut self) -> Result<()> {
        while let Some(frames) = self.data.as_mut().and_then(|d| d.next_outbound()) {
            let count = frames.len();
            for frame in frames {
                if let Err(e) = self.engine.send_data(frame).await {
                    warn!(session = %self.id, "Payload transmission failed: {}", e);
                    return Err(Error::DataChannel(e));
                }
            }
            debug!(session = %self.id, "Sent payload in {} chunk(s)", count);
        }
        Ok(())
    }

    // ---- bookkeeping ----

    fn set_phase(&mut self, phase: Phase) {
        if self.phase == phase {
            return;
        }
        info!(session = %self.id, "Phase {:?} -> {:?}", self.phase, phase);
        self.phase = phase;
        self.phase_tx.send_replace(phase);
        self.emit(SessionEvent::PhaseChanged(phase));
    }

    fn emit(&self, event: SessionEvent) {
        let _ = self.events.send(event);
    }

    /// Release the engine, the channel and all buffers. Runs once.
    async fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;

        self.candidates.clear();
        self.local_candidates.clear();
        if let Some(mut data) = self.data.take() {
            data.clear();
        }
        self.deadline = None;
        self.grace_deadline = None;

        if let Err(e) = self.engine.close().await {
            warn!(session = %self.id, "Failed to close peer connection: {}", e);
        }
        self.channel.close().await;
        self.signaling_open = false;
        self.engine_open = false;
        debug!(session = %self.id, "Session resources released");
    }
}

fn step(step: NegotiationStep) -> impl FnOnce(EngineError) -> Error {
    move |source| Error::Description { step, source }
}
