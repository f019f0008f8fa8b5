//! Per-peer session state machine.
//!
//! The coordinator is an actor: signaling events, WebRTC callbacks and
//! commands all arrive through channels and are handled one at a time, so
//! the session table and the capture reference count have a single writer.

use crate::input::InputExecutor;
use crate::pipeline::{CaptureFrame, CapturePipeline, CaptureSettings};
use crate::policy::{AcceptPolicy, Decision};
use crate::rtc::{LinkState, RtcEngine, RtcEvent, RtcPeer, SessionKey};
use crate::signaling::{ChannelEvent, SignalSender};

use anyhow::Context;
use std::collections::HashMap;
use std::sync::Arc;
use tether_protocol::{
    ConnectRequest, FrameCodec, IceCandidate, InboundSignal, OutboundSignal, PeerSignal,
    Rejection, SessionDescription,
};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

const RTC_EVENT_CAPACITY: usize = 256;
const COMMAND_CAPACITY: usize = 16;
const EVENT_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Requested,
    Negotiating,
    Active,
    Closed,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("invalid session transition {from:?} -> {to:?}")]
pub struct InvalidTransition {
    pub from: SessionState,
    pub to: SessionState,
}

impl SessionState {
    /// `Closed` is terminal; everything else may close.
    pub fn advance(self, to: SessionState) -> Result<SessionState, InvalidTransition> {
        use SessionState::*;
        match (self, to) {
            (Requested, Negotiating) | (Negotiating, Active) => Ok(to),
            (Requested | Negotiating | Active, Closed) => Ok(to),
            (from, to) => Err(InvalidTransition { from, to }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CoordinatorEvent {
    SessionCreated {
        peer_id: String,
        client_ip: Option<String>,
    },
    PeerConnectionClosed {
        peer_id: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSummary {
    pub peer_id: String,
    pub key: SessionKey,
    pub state: SessionState,
    pub control: bool,
}

struct PeerSession {
    key: SessionKey,
    state: SessionState,
    created_at: Instant,
    control: bool,
    /// Remote candidates that arrived before the remote description.
    pending_candidates: Vec<IceCandidate>,
    remote_set: bool,
    handle: Arc<dyn RtcPeer>,
    forwarder: Option<JoinHandle<()>>,
}

impl PeerSession {
    fn transition(&mut self, to: SessionState) -> Result<(), InvalidTransition> {
        self.state = self.state.advance(to)?;
        Ok(())
    }
}

enum Command {
    Sessions(oneshot::Sender<Vec<SessionSummary>>),
    Shutdown(oneshot::Sender<()>),
}

/// Cloneable front door to a running coordinator.
#[derive(Clone)]
pub struct CoordinatorHandle {
    commands: mpsc::Sender<Command>,
}

impl CoordinatorHandle {
    pub async fn sessions(&self) -> Vec<SessionSummary> {
        let (tx, rx) = oneshot::channel();
        if self.commands.send(Command::Sessions(tx)).await.is_err() {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }

    /// Close every session and stop the actor. Returns once teardown is done.
    pub async fn shutdown(&self) {
        let (tx, rx) = oneshot::channel();
        if self.commands.send(Command::Shutdown(tx)).await.is_ok() {
            let _ = rx.await;
        }
    }
}

/// External capabilities the coordinator drives.
pub struct CoordinatorDeps {
    pub engine: Arc<dyn RtcEngine>,
    pub signals: Arc<dyn SignalSender>,
    pub pipeline: Arc<CapturePipeline>,
    pub capture: CaptureSettings,
    pub policy: Box<dyn AcceptPolicy>,
    pub input: Arc<dyn InputExecutor>,
}

pub struct SessionCoordinator {
    core: Core,
    rtc_events: mpsc::Receiver<RtcEvent>,
    commands: mpsc::Receiver<Command>,
}

impl SessionCoordinator {
    pub fn new(
        deps: CoordinatorDeps,
    ) -> (Self, CoordinatorHandle, mpsc::Receiver<CoordinatorEvent>) {
        let (rtc_tx, rtc_events) = mpsc::channel(RTC_EVENT_CAPACITY);
        let (command_tx, commands) = mpsc::channel(COMMAND_CAPACITY);
        let (events_tx, events_rx) = mpsc::channel(EVENT_CAPACITY);
        let core = Core {
            deps,
            sessions: HashMap::new(),
            keys: HashMap::new(),
            capture_refs: 0,
            rtc_tx,
            events: events_tx,
            input_errors: 0,
        };
        (
            Self {
                core,
                rtc_events,
                commands,
            },
            CoordinatorHandle {
                commands: command_tx,
            },
            events_rx,
        )
    }

    /// Run until shutdown. WebRTC callbacks are drained before signaling
    /// events, and both before commands.
    pub async fn run(self, mut channel: mpsc::Receiver<ChannelEvent>) {
        let Self {
            mut core,
            mut rtc_events,
            mut commands,
        } = self;
        let mut channel_open = true;

        loop {
            tokio::select! {
                biased;
                Some(event) = rtc_events.recv() => core.on_rtc_event(event).await,
                event = channel.recv(), if channel_open => match event {
                    Some(event) => core.on_channel_event(event).await,
                    None => {
                        debug!("Signaling event stream ended");
                        channel_open = false;
                    }
                },
                command = commands.recv() => match command {
                    Some(Command::Sessions(reply)) => {
                        let _ = reply.send(core.summaries());
                    }
                    Some(Command::Shutdown(reply)) => {
                        core.close_all("shutdown").await;
                        let _ = reply.send(());
                        break;
                    }
                    None => {
                        core.close_all("shutdown").await;
                        break;
                    }
                },
            }
        }
        info!("Session coordinator stopped");
    }
}

struct Core {
    deps: CoordinatorDeps,
    sessions: HashMap<String, PeerSession>,
    /// Live session keys back to their peer id.
    keys: HashMap<SessionKey, String>,
    /// Number of `Active` sessions; capture runs while non-zero.
    capture_refs: usize,
    rtc_tx: mpsc::Sender<RtcEvent>,
    events: mpsc::Sender<CoordinatorEvent>,
    input_errors: u64,
}

impl Core {
    async fn on_channel_event(&mut self, event: ChannelEvent) {
        match event {
            ChannelEvent::MessageReceived(inbound) => self.on_signal(inbound).await,
            ChannelEvent::ConnectionStatusChanged { connected, reason } => {
                // Established peer links outlive a signaling outage.
                info!(
                    connected,
                    reason = %reason,
                    sessions = self.sessions.len(),
                    "Signaling status changed"
                );
            }
            ChannelEvent::SessionEstablished(info) => {
                info!(sid = %info.sid, resumed = info.resumed, "Signaling session established");
            }
        }
    }

    async fn on_signal(&mut self, inbound: InboundSignal) {
        let InboundSignal { peer_id, signal } = inbound;
        match signal {
            PeerSignal::ConnectRequest(request) => self.on_connect_request(peer_id, request).await,
            PeerSignal::Offer(offer) => self.on_offer(peer_id, offer).await,
            PeerSignal::Answer(answer) => self.on_answer(peer_id, answer).await,
            PeerSignal::IceCandidate(candidate) => self.on_remote_candidate(peer_id, candidate).await,
            PeerSignal::Disconnect => self.close_session(&peer_id, "peer-disconnect").await,
            PeerSignal::ConnectRejected(rejection) => {
                warn!(peer_id = %peer_id, reason = %rejection.reason, "Unexpected connect-rejected from viewer");
            }
        }
    }

    async fn on_connect_request(&mut self, peer_id: String, request: ConnectRequest) {
        if let Some(existing) = self.sessions.get(&peer_id) {
            debug!(peer_id = %peer_id, state = ?existing.state, "Duplicate connect-request ignored");
            return;
        }
        if !self.open_session(&peer_id, &request).await {
            return;
        }
        if let Err(e) = self.send_offer(&peer_id).await {
            self.fail_session(&peer_id, e).await;
        }
    }

    async fn on_offer(&mut self, peer_id: String, offer: SessionDescription) {
        if !self.sessions.contains_key(&peer_id) {
            // An offer without a prior request asks for the full session.
            if !self.open_session(&peer_id, &ConnectRequest::default()).await {
                return;
            }
        }
        if let Err(e) = self.answer_offer(&peer_id, offer).await {
            self.fail_session(&peer_id, e).await;
        }
    }

    async fn on_answer(&mut self, peer_id: String, answer: SessionDescription) {
        let Some(handle) = self.handle_of(&peer_id) else {
            warn!(peer_id = %peer_id, "Answer for unknown peer dropped");
            return;
        };
        let result = handle
            .set_remote_description(answer)
            .await
            .context("Failed to apply remote answer");
        match result {
            Ok(()) => self.flush_candidates(&peer_id).await,
            Err(e) => self.fail_session(&peer_id, e).await,
        }
    }

    async fn on_remote_candidate(&mut self, peer_id: String, candidate: IceCandidate) {
        let Some(session) = self.sessions.get_mut(&peer_id) else {
            warn!(peer_id = %peer_id, "ICE candidate for unknown peer dropped");
            return;
        };
        if !session.remote_set {
            session.pending_candidates.push(candidate);
            debug!(
                peer_id = %peer_id,
                queued = session.pending_candidates.len(),
                "ICE candidate queued until remote description"
            );
            return;
        }
        let handle = Arc::clone(&session.handle);
        if let Err(e) = handle.add_ice_candidate(candidate).await {
            warn!(peer_id = %peer_id, error = %format!("{e:#}"), "Failed to add ICE candidate");
        }
    }

    /// Apply the policy and create the session in `Negotiating`. Returns
    /// false when the peer was rejected or the handle could not be built.
    async fn open_session(&mut self, peer_id: &str, request: &ConnectRequest) -> bool {
        let control = match self.deps.policy.decide(peer_id, request) {
            Decision::Accept { control } => control,
            Decision::Reject { reason } => {
                info!(peer_id = %peer_id, reason = %reason, "Connection rejected by policy");
                self.send(peer_id, PeerSignal::ConnectRejected(Rejection { reason }))
                    .await;
                return false;
            }
        };

        let key = Uuid::new_v4();
        let handle = match self.deps.engine.create_peer(key, self.rtc_tx.clone()).await {
            Ok(handle) => handle,
            Err(e) => {
                warn!(peer_id = %peer_id, error = %format!("{e:#}"), "Failed to create peer connection");
                return false;
            }
        };

        let mut session = PeerSession {
            key,
            state: SessionState::Requested,
            created_at: Instant::now(),
            control,
            pending_candidates: Vec::new(),
            remote_set: false,
            handle,
            forwarder: None,
        };
        info!(
            peer_id = %peer_id,
            %key,
            client_ip = request.client_ip.as_deref().unwrap_or("unknown"),
            name = request.name.as_deref().unwrap_or(""),
            control,
            "Session created"
        );
        self.emit(CoordinatorEvent::SessionCreated {
            peer_id: peer_id.to_string(),
            client_ip: request.client_ip.clone(),
        })
        .await;

        if let Err(e) = session.transition(SessionState::Negotiating) {
            warn!(peer_id = %peer_id, error = %e, "Session not negotiable");
        }
        self.keys.insert(key, peer_id.to_string());
        self.sessions.insert(peer_id.to_string(), session);
        true
    }

    async fn send_offer(&mut self, peer_id: &str) -> anyhow::Result<()> {
        let handle = self.handle_of(peer_id).context("Session vanished")?;
        let offer = handle.create_offer().await.context("Failed to create offer")?;
        handle
            .set_local_description(offer.clone())
            .await
            .context("Failed to set local offer")?;
        self.send(peer_id, PeerSignal::Offer(offer)).await;
        Ok(())
    }

    async fn answer_offer(&mut self, peer_id: &str, offer: SessionDescription) -> anyhow::Result<()> {
        let handle = self.handle_of(peer_id).context("Session vanished")?;
        handle
            .set_remote_description(offer)
            .await
            .context("Failed to apply remote offer")?;
        let answer = handle.create_answer().await.context("Failed to create answer")?;
        handle
            .set_local_description(answer.clone())
            .await
            .context("Failed to set local answer")?;
        self.send(peer_id, PeerSignal::Answer(answer)).await;
        self.flush_candidates(peer_id).await;
        Ok(())
    }

    /// Mark the remote description as applied and replay queued candidates
    /// in arrival order.
    async fn flush_candidates(&mut self, peer_id: &str) {
        let Some(session) = self.sessions.get_mut(peer_id) else {
            return;
        };
        session.remote_set = true;
        let queued = std::mem::take(&mut session.pending_candidates);
        let handle = Arc::clone(&session.handle);
        if !queued.is_empty() {
            debug!(peer_id = %peer_id, count = queued.len(), "Applying queued ICE candidates");
        }
        for candidate in queued {
            if let Err(e) = handle.add_ice_candidate(candidate).await {
                warn!(peer_id = %peer_id, error = %format!("{e:#}"), "Failed to add queued ICE candidate");
            }
        }
    }

    async fn on_rtc_event(&mut self, event: RtcEvent) {
        let Some(peer_id) = self.keys.get(&event.key()).cloned() else {
            debug!(key = %event.key(), "Callback from a closed session ignored");
            return;
        };
        match event {
            RtcEvent::LocalCandidate { candidate, .. } => {
                self.send(&peer_id, PeerSignal::IceCandidate(candidate)).await;
            }
            RtcEvent::StateChanged { state, .. } => self.on_link_state(&peer_id, state).await,
            RtcEvent::InputReceived { data, .. } => self.on_input(&peer_id, &data),
            RtcEvent::KeyframeRequested { .. } => {
                debug!(peer_id = %peer_id, "Viewer requested a keyframe");
                self.deps.pipeline.request_keyframe();
            }
        }
    }

    async fn on_link_state(&mut self, peer_id: &str, state: LinkState) {
        match state {
            LinkState::Connecting => debug!(peer_id = %peer_id, "Peer connecting"),
            LinkState::Connected => self.activate(peer_id).await,
            LinkState::Disconnected => {
                info!(peer_id = %peer_id, "Peer link disconnected, waiting for ICE to recover");
            }
            LinkState::Failed => self.close_session(peer_id, "ice-failed").await,
            LinkState::Closed => self.close_session(peer_id, "peer-closed").await,
        }
    }

    async fn activate(&mut self, peer_id: &str) {
        let Some(session) = self.sessions.get_mut(peer_id) else {
            return;
        };
        if session.state == SessionState::Active {
            debug!(peer_id = %peer_id, "Link reconnected");
            self.deps.pipeline.request_keyframe();
            return;
        }
        if let Err(e) = session.transition(SessionState::Active) {
            warn!(peer_id = %peer_id, error = %e, "Ignoring connected callback");
            return;
        }
        let handle = Arc::clone(&session.handle);
        let setup_ms = session.created_at.elapsed().as_millis() as u64;

        self.acquire_capture().await;
        let frames = self.deps.pipeline.subscribe();
        let forwarder = tokio::spawn(forward_frames(
            peer_id.to_string(),
            handle,
            frames,
            Arc::clone(&self.deps.pipeline),
        ));
        self.deps.pipeline.request_keyframe();
        if let Some(session) = self.sessions.get_mut(peer_id) {
            session.forwarder = Some(forwarder);
        }
        info!(
            peer_id = %peer_id,
            setup_ms,
            active = self.capture_refs,
            "Session active"
        );
    }

    fn on_input(&mut self, peer_id: &str, data: &str) {
        let Some(session) = self.sessions.get(peer_id) else {
            return;
        };
        if !session.control || session.state != SessionState::Active {
            debug!(peer_id = %peer_id, "Input from viewer without control ignored");
            return;
        }
        if !self.deps.input.is_enabled() {
            return;
        }
        if let Err(e) = self.deps.input.execute(data) {
            self.input_errors += 1;
            if self.input_errors <= 3 || self.input_errors.is_multiple_of(100) {
                warn!(
                    peer_id = %peer_id,
                    error = %format!("{e:#}"),
                    count = self.input_errors,
                    "Input command failed"
                );
            }
        }
    }

    async fn acquire_capture(&mut self) {
        self.capture_refs += 1;
        if self.capture_refs == 1 {
            self.deps.pipeline.start(self.deps.capture).await;
            self.deps.input.enable();
        }
    }

    async fn release_capture(&mut self) {
        self.capture_refs = self.capture_refs.saturating_sub(1);
        if self.capture_refs == 0 {
            self.deps.pipeline.stop().await;
            self.deps.input.disable();
        }
    }

    async fn fail_session(&mut self, peer_id: &str, error: anyhow::Error) {
        warn!(peer_id = %peer_id, error = %format!("{error:#}"), "Negotiation failed");
        self.close_session(peer_id, "negotiation-failed").await;
    }

    async fn close_session(&mut self, peer_id: &str, reason: &str) {
        let Some(mut session) = self.sessions.remove(peer_id) else {
            debug!(peer_id = %peer_id, reason, "No session to close");
            return;
        };
        self.keys.remove(&session.key);
        let was_active = session.state == SessionState::Active;
        if let Err(e) = session.transition(SessionState::Closed) {
            warn!(peer_id = %peer_id, error = %e, "Closing session in unexpected state");
        }

        if let Some(forwarder) = session.forwarder.take() {
            forwarder.abort();
        }
        if let Err(e) = session.handle.close().await {
            debug!(peer_id = %peer_id, error = %format!("{e:#}"), "Error closing peer connection");
        }
        if was_active {
            self.release_capture().await;
        }

        info!(
            peer_id = %peer_id,
            reason,
            lifetime_secs = session.created_at.elapsed().as_secs(),
            remaining = self.sessions.len(),
            "Session closed"
        );
        self.emit(CoordinatorEvent::PeerConnectionClosed {
            peer_id: peer_id.to_string(),
        })
        .await;
    }

    async fn close_all(&mut self, reason: &str) {
        let peers: Vec<String> = self.sessions.keys().cloned().collect();
        for peer_id in peers {
            self.close_session(&peer_id, reason).await;
        }
    }

    fn handle_of(&self, peer_id: &str) -> Option<Arc<dyn RtcPeer>> {
        self.sessions.get(peer_id).map(|s| Arc::clone(&s.handle))
    }

    fn summaries(&self) -> Vec<SessionSummary> {
        let mut out: Vec<SessionSummary> = self
            .sessions
            .iter()
            .map(|(peer_id, s)| SessionSummary {
                peer_id: peer_id.clone(),
                key: s.key,
                state: s.state,
                control: s.control,
            })
            .collect();
        out.sort_by(|a, b| a.peer_id.cmp(&b.peer_id));
        out
    }

    /// Signaling failures are logged; the peer link may still complete over
    /// candidates already exchanged.
    async fn send(&self, peer_id: &str, signal: PeerSignal) {
        let kind = signal.kind();
        if let Err(e) = self
            .deps
            .signals
            .send_signal(OutboundSignal::new(peer_id, signal))
            .await
        {
            warn!(peer_id = %peer_id, kind = kind.as_str(), error = %e, "Failed to send peer signal");
        }
    }

    async fn emit(&self, event: CoordinatorEvent) {
        let _ = self.events.send(event).await;
    }
}

/// Copy pipeline frames to one peer. H.264 delta frames are held back
/// until the first IDR, and again after the receiver lags.
async fn forward_frames(
    peer_id: String,
    handle: Arc<dyn RtcPeer>,
    mut frames: broadcast::Receiver<Arc<CaptureFrame>>,
    pipeline: Arc<CapturePipeline>,
) {
    let mut awaiting_idr = true;
    let mut last_codec: Option<FrameCodec> = None;
    let mut sent: u64 = 0;
    let mut failures: u64 = 0;

    loop {
        let frame = match frames.recv().await {
            Ok(frame) => frame,
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                debug!(peer_id = %peer_id, skipped, "Frame forwarder lagged");
                awaiting_idr = true;
                pipeline.request_keyframe();
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => break,
        };

        if last_codec != Some(frame.codec) {
            debug!(peer_id = %peer_id, codec = ?frame.codec, "Forwarding codec changed");
            last_codec = Some(frame.codec);
            awaiting_idr = true;
        }
        if frame.codec == FrameCodec::H264 && awaiting_idr && !frame.keyframe {
            continue;
        }
        awaiting_idr = false;

        match handle.send_frame(&frame).await {
            Ok(()) => {
                sent += 1;
                if sent == 1 {
                    info!(peer_id = %peer_id, codec = ?frame.codec, "First frame sent to viewer");
                }
            }
            Err(e) => {
                failures += 1;
                if failures <= 3 || failures.is_multiple_of(100) {
                    warn!(peer_id = %peer_id, error = %format!("{e:#}"), failures, "Failed to send frame");
                }
            }
        }
    }
    debug!(peer_id = %peer_id, sent, "Frame forwarder stopped");
}
