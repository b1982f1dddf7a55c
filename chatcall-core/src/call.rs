//! Call session controller
//!
//! A [`CallManager`] serves one chat session. It owns at most one call at a
//! time and drives it through the lifecycle:
//!
//! ```text
//!   Idle ──start_call──► RingingOutgoing ──offer sent──► Connecting
//!   Idle ──call-offer──► RingingIncoming ──accept_call──► Connecting
//!   Connecting ──connected──► Active ◄──connected── Reconnecting
//!   Active/Connecting ──disconnected/failed──► Reconnecting
//!   any ──end_call / call-end / timeout / exhausted──► Ended ─► Idle
//! ```
//!
//! Every negotiation attempt carries a [`Generation`]. Async work captures
//! the generation it started under and re-checks it after each suspension
//! point; results that arrive for a superseded attempt are released
//! instead of attached.
//!
//! Remote events (signaling messages, connection callbacks and timers) are
//! funnelled through a single event loop so they are handled one at a time
//! in arrival order.

use crate::media::{
    AudioRoute, MediaAcquirer, MediaDevices, MediaError, MediaSinks,
    MediaStreamHandle, TrackKind,
};
use crate::peer::{
    IceServer, PeerConfig, PeerConnectionFactory, PeerConnectionState, PeerError, PeerEvent,
    PeerEventSink, PeerSession,
};
use crate::quality::{QualityMonitor, QualitySample, StatsSource};
use crate::signaling::{
    apply_inbound_answer, route_inbound_candidate, AnswerDisposition, CandidateSend,
    SignalingBridge, SignalingError, SignalingMessage, SignalingSubscriber, SignalingTransport,
};
use crate::types::{
    CallEvent, CallFailure, CallId, CallRole, CallSnapshot, CallState, CallType, CameraFacing,
    EndReason, Generation, IceCandidate, IncomingCallOffer, LocalMediaState, PeerId,
    QualityClass, SdpKind, SessionDescription,
};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

/// Call management errors
#[derive(Error, Debug)]
pub enum CallError {
    /// No chat partner to call
    #[error("No chat partner")]
    NoPartner,

    /// A call already exists
    #[error("A call is already in progress")]
    CallInProgress,

    /// No offer is waiting for a decision
    #[error("No incoming call")]
    NoIncomingCall,

    /// Operation needs a call with media
    #[error("No active call")]
    NoActiveCall,

    /// Operation only applies to video calls
    #[error("Not a video call")]
    NotVideoCall,

    /// Operation only applies to audio calls
    #[error("Not an audio call")]
    NotAudioCall,

    /// The attempt was superseded while in flight
    #[error("Call attempt cancelled")]
    Cancelled,

    /// Configuration error
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Local media failure
    #[error(transparent)]
    Media(#[from] MediaError),

    /// Peer connection failure
    #[error(transparent)]
    Peer(#[from] PeerError),

    /// Signaling failure
    #[error(transparent)]
    Signaling(#[from] SignalingError),
}

impl CallError {
    fn is_cancellation(&self) -> bool {
        matches!(
            self,
            Self::Cancelled | Self::Signaling(SignalingError::StaleAttempt(_))
        )
    }
}

/// Public STUN servers used when none are configured
pub const DEFAULT_STUN_SERVERS: [&str; 2] = [
    "stun:stun.l.google.com:19302",
    "stun:stun1.l.google.com:19302",
];

/// Call manager configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CallManagerConfig {
    /// ICE servers handed to every peer connection
    pub ice_servers: Vec<IceServer>,
    /// How long an incoming offer rings before it is auto-rejected
    pub incoming_call_timeout: Duration,
    /// Fixed spacing between reconnection attempts
    pub reconnect_delay: Duration,
    /// Connection failures tolerated before the call is ended
    pub max_reconnect_attempts: u32,
    /// Overall limit on time spent reconnecting
    pub reconnect_timeout: Duration,
    /// Quality sampling period
    pub quality_sample_interval: Duration,
    /// Capacity of the event broadcast channel
    pub event_channel_capacity: usize,
    /// Label shown for an incoming caller
    pub caller_display_name: String,
}

impl Default for CallManagerConfig {
    fn default() -> Self {
        Self {
            ice_servers: DEFAULT_STUN_SERVERS
                .iter()
                .map(|url| IceServer::stun(*url))
                .collect(),
            incoming_call_timeout: Duration::from_secs(30),
            reconnect_delay: Duration::from_secs(2),
            max_reconnect_attempts: 3,
            reconnect_timeout: Duration::from_secs(20),
            quality_sample_interval: Duration::from_secs(3),
            event_channel_capacity: 100,
            caller_display_name: "Anonymous Stranger".to_string(),
        }
    }
}

#[derive(Debug)]
enum Phase {
    RingingOutgoing,
    RingingIncoming(IncomingCallOffer),
    Connecting,
    Active,
    Reconnecting,
}

impl Phase {
    fn state(&self) -> CallState {
        match self {
            Self::RingingOutgoing => CallState::RingingOutgoing,
            Self::RingingIncoming(_) => CallState::RingingIncoming,
            Self::Connecting => CallState::Connecting,
            Self::Active => CallState::Active,
            Self::Reconnecting => CallState::Reconnecting,
        }
    }

    fn is_connected_phase(&self) -> bool {
        matches!(self, Self::Connecting | Self::Active | Self::Reconnecting)
    }
}

/// Aborts its task when dropped
#[derive(Debug)]
struct TaskGuard(JoinHandle<()>);

impl Drop for TaskGuard {
    fn drop(&mut self) {
        self.0.abort();
    }
}

struct CallSession {
    id: CallId,
    generation: Generation,
    call_type: CallType,
    role: CallRole,
    remote_peer: PeerId,
    phase: Phase,
    media: LocalMediaState,
    speaker_enabled: bool,
    camera_facing: CameraFacing,
    quality: QualityClass,
    created_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    reconnect_failures: u32,
    last_failed_generation: Option<Generation>,
    stream: Option<MediaStreamHandle>,
    peer: Option<Arc<PeerSession>>,
    early_candidates: Vec<IceCandidate>,
    answered_offers: Vec<String>,
    ring_timer: Option<TaskGuard>,
    reconnect_timer: Option<TaskGuard>,
    reconnect_deadline: Option<TaskGuard>,
    quality_monitor: Option<QualityMonitor>,
}

impl CallSession {
    fn new(
        generation: Generation,
        call_type: CallType,
        role: CallRole,
        remote_peer: PeerId,
        phase: Phase,
    ) -> Self {
        Self {
            id: CallId::new(),
            generation,
            call_type,
            role,
            remote_peer,
            phase,
            media: LocalMediaState {
                video: call_type.has_video(),
                audio: true,
            },
            speaker_enabled: true,
            camera_facing: CameraFacing::Front,
            quality: QualityClass::Good,
            created_at: Utc::now(),
            started_at: None,
            reconnect_failures: 0,
            last_failed_generation: None,
            stream: None,
            peer: None,
            early_candidates: Vec::new(),
            answered_offers: Vec::new(),
            ring_timer: None,
            reconnect_timer: None,
            reconnect_deadline: None,
            quality_monitor: None,
        }
    }

    fn state(&self) -> CallState {
        self.phase.state()
    }

    fn snapshot(&self) -> CallSnapshot {
        CallSnapshot {
            call_id: self.id,
            call_type: self.call_type,
            role: self.role,
            state: self.state(),
            remote_peer: self.remote_peer.clone(),
            local_media: self.media,
            speaker_enabled: self.speaker_enabled,
            camera_facing: self.camera_facing,
            quality: self.quality,
            reconnect_attempts: self.reconnect_failures,
            created_at: self.created_at,
            started_at: self.started_at,
        }
    }
}

#[derive(Default)]
struct Slot {
    partner: Option<PeerId>,
    session: Option<CallSession>,
}

#[derive(Debug)]
enum LoopEvent {
    Signal {
        from: PeerId,
        message: SignalingMessage,
    },
    Peer {
        generation: Generation,
        event: PeerEvent,
    },
    Quality {
        generation: Generation,
        sample: QualitySample,
    },
    RingTimeout(Generation),
    ReconnectDue(Generation),
    ReconnectDeadline(CallId),
}

struct LoopSubscriber(mpsc::UnboundedSender<LoopEvent>);

impl SignalingSubscriber for LoopSubscriber {
    fn on_signal(&self, from: PeerId, message: SignalingMessage) {
        let _ = self.0.send(LoopEvent::Signal { from, message });
    }
}

enum LossAction {
    Ignore,
    Retry { call_id: CallId, failures: u32, changed: bool },
    GiveUp(CallId),
}

fn media_failure(error: &MediaError) -> CallFailure {
    match error {
        MediaError::PermissionDenied(_) => CallFailure::PermissionDenied,
        MediaError::DeviceUnavailable(_) => CallFailure::DeviceUnavailable,
        MediaError::Platform(msg) => CallFailure::MediaPlatform(msg.clone()),
    }
}

struct ManagerInner<T: SignalingTransport> {
    config: CallManagerConfig,
    bridge: Arc<SignalingBridge<T>>,
    media: MediaAcquirer,
    peers: Arc<dyn PeerConnectionFactory>,
    slot: Mutex<Slot>,
    sinks: Arc<MediaSinks>,
    generations: AtomicU64,
    events: broadcast::Sender<CallEvent>,
    loop_tx: mpsc::UnboundedSender<LoopEvent>,
    loop_rx: Mutex<Option<mpsc::UnboundedReceiver<LoopEvent>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl<T: SignalingTransport> Drop for ManagerInner<T> {
    fn drop(&mut self) {
        for task in self.tasks.get_mut().drain(..) {
            task.abort();
        }
    }
}

impl<T: SignalingTransport> ManagerInner<T> {
    fn emit(&self, event: CallEvent) {
        let _ = self.events.send(event);
    }

    fn emit_state(&self, call_id: CallId, state: CallState) {
        tracing::debug!(%call_id, ?state, "Call state changed");
        self.emit(CallEvent::StateChanged { call_id, state });
    }

    fn next_generation(&self) -> Generation {
        Generation(self.generations.fetch_add(1, Ordering::SeqCst) + 1)
    }

    fn with_session<R>(
        &self,
        generation: Generation,
        f: impl FnOnce(&mut CallSession) -> R,
    ) -> Option<R> {
        let mut slot = self.slot.lock();
        slot.session
            .as_mut()
            .filter(|s| s.generation == generation)
            .map(f)
    }

    fn with_call<R>(&self, call_id: CallId, f: impl FnOnce(&mut CallSession) -> R) -> Option<R> {
        let mut slot = self.slot.lock();
        slot.session.as_mut().filter(|s| s.id == call_id).map(f)
    }

    fn ensure_current(&self, generation: Generation) -> Result<(), CallError> {
        self.with_session(generation, |_| ())
            .ok_or(CallError::Cancelled)
    }

    fn schedule(&self, after: Duration, event: LoopEvent) -> TaskGuard {
        let tx = self.loop_tx.clone();
        TaskGuard(tokio::spawn(async move {
            tokio::time::sleep(after).await;
            let _ = tx.send(event);
        }))
    }

    fn peer_sink(&self, generation: Generation) -> PeerEventSink {
        let tx = self.loop_tx.clone();
        Arc::new(move |event| {
            let _ = tx.send(LoopEvent::Peer { generation, event });
        })
    }

    fn spawn_quality(&self, generation: Generation, peer: Arc<PeerSession>) -> QualityMonitor {
        let tx = self.loop_tx.clone();
        let source: Arc<dyn StatsSource> = peer;
        QualityMonitor::spawn(source, self.config.quality_sample_interval, move |sample| {
            let _ = tx.send(LoopEvent::Quality { generation, sample });
        })
    }

    fn install_stream(
        &self,
        generation: Generation,
        stream: MediaStreamHandle,
    ) -> Result<MediaStreamHandle, CallError> {
        let installed = self.with_session(generation, |session| {
            session.stream = Some(stream.clone());
        });
        match installed {
            Some(()) => {
                self.sinks.set_local_preview(stream.video_track());
                Ok(stream)
            }
            None => {
                tracing::debug!(%generation, "Media arrived for a finished attempt, releasing");
                stream.stop_all();
                Err(CallError::Cancelled)
            }
        }
    }

    async fn open_peer(
        &self,
        generation: Generation,
        role: CallRole,
        remote: &PeerId,
        stream: &MediaStreamHandle,
    ) -> Result<Arc<PeerSession>, CallError> {
        let config = PeerConfig {
            ice_servers: self.config.ice_servers.clone(),
            role,
            remote_peer: remote.clone(),
        };
        let peer = self.peers.create(&config, self.peer_sink(generation)).await?;

        let installed = self.with_session(generation, |session| {
            let early = std::mem::take(&mut session.early_candidates);
            let wrapped = Arc::new(PeerSession::from_peer(Arc::clone(&peer), early));
            session.peer = Some(Arc::clone(&wrapped));
            wrapped
        });
        let Some(session) = installed else {
            if let Err(e) = peer.close().await {
                tracing::debug!(error = %e, "closing superseded peer failed");
            }
            return Err(CallError::Cancelled);
        };

        session.attach_local_tracks(stream).await?;
        Ok(session)
    }

    async fn offer_call(
        &self,
        generation: Generation,
        remote: &PeerId,
        call_type: CallType,
        stream: &MediaStreamHandle,
    ) -> Result<(), CallError> {
        let peer = self
            .open_peer(generation, CallRole::Initiator, remote, stream)
            .await?;
        let offer = peer.create_offer().await?;
        self.ensure_current(generation)?;
        self.bridge.send_offer(generation, offer, call_type).await?;
        tracing::debug!(%generation, "Offer sent");
        Ok(())
    }

    async fn answer_offer(
        &self,
        generation: Generation,
        remote: &PeerId,
        offer: SessionDescription,
        stream: &MediaStreamHandle,
    ) -> Result<(), CallError> {
        let peer = self
            .open_peer(generation, CallRole::Responder, remote, stream)
            .await?;
        let flushed = peer.set_remote_description(offer).await?;
        self.ensure_current(generation)?;
        let answer = peer.create_answer().await?;
        self.ensure_current(generation)?;
        self.bridge.send_answer(generation, answer).await?;
        tracing::debug!(%generation, flushed, "Answer sent");
        Ok(())
    }

    async fn prepare_outgoing(
        &self,
        generation: Generation,
        remote: &PeerId,
        call_type: CallType,
    ) -> Result<(), CallError> {
        let stream = self.media.acquire(call_type, CameraFacing::Front).await?;
        let stream = self.install_stream(generation, stream)?;
        self.offer_call(generation, remote, call_type, &stream).await
    }

    async fn prepare_incoming(
        &self,
        generation: Generation,
        offer: &IncomingCallOffer,
    ) -> Result<(), CallError> {
        let stream = self
            .media
            .acquire(offer.call_type, CameraFacing::Front)
            .await?;
        let stream = self.install_stream(generation, stream)?;
        self.answer_offer(
            generation,
            &offer.from_peer,
            offer.session_descriptor.clone(),
            &stream,
        )
        .await
    }

    /// End the attempt after a failed start/accept
    async fn fail_attempt(&self, generation: Generation, role: CallRole, error: &CallError) {
        if error.is_cancellation() {
            tracing::debug!(%generation, "Attempt superseded");
            return;
        }
        let (reason, failure) = match error {
            CallError::Media(e) => (EndReason::MediaFailure, media_failure(e)),
            other => (
                EndReason::NegotiationFailed,
                CallFailure::NegotiationFailed(other.to_string()),
            ),
        };
        let Some(call_id) = self.with_session(generation, |s| s.id) else {
            return;
        };
        tracing::warn!(%call_id, %generation, error = %error, "Call attempt failed");
        self.emit(CallEvent::Failure { call_id, failure });

        // An initiator that never got media never sent an offer.
        let notify = !(role == CallRole::Initiator && reason == EndReason::MediaFailure);
        self.teardown(Some(generation), reason, notify).await;
    }

    /// Release every resource of the current call.
    ///
    /// With `generation` set, only that attempt is torn down. Returns false
    /// when there was nothing to tear down.
    async fn teardown(&self, generation: Option<Generation>, reason: EndReason, notify: bool) -> bool {
        let session = {
            let mut slot = self.slot.lock();
            let targeted = match (&slot.session, generation) {
                (Some(s), Some(g)) => s.generation == g,
                _ => true,
            };
            if targeted {
                slot.session.take()
            } else {
                None
            }
        };
        let Some(mut session) = session else {
            return false;
        };

        self.bridge.end_attempt(session.generation);
        session.ring_timer = None;
        session.reconnect_timer = None;
        session.reconnect_deadline = None;
        session.quality_monitor = None;
        if let Some(stream) = session.stream.take() {
            stream.stop_all();
        }
        self.sinks.clear();

        let call_id = session.id;
        let duration_secs = session
            .started_at
            .map(|start| (Utc::now() - start).num_seconds());
        tracing::info!(%call_id, ?reason, ?duration_secs, "Call ended");
        self.emit_state(call_id, CallState::Ended);
        self.emit(CallEvent::CallEnded {
            call_id,
            reason,
            duration_secs,
        });

        if let Some(peer) = session.peer.take() {
            peer.close().await;
        }
        if notify {
            if let Err(e) = self.bridge.send_hangup(&session.remote_peer).await {
                tracing::warn!(%call_id, error = %e, "Failed to send hangup");
            }
        }
        true
    }

    #[tracing::instrument(skip(self))]
    async fn start_call(&self, call_type: CallType) -> Result<CallId, CallError> {
        let (generation, call_id, remote) = {
            let mut slot = self.slot.lock();
            let remote = slot.partner.clone().ok_or(CallError::NoPartner)?;
            if slot.session.as_ref().is_some_and(|s| s.state().is_busy()) {
                return Err(CallError::CallInProgress);
            }
            let generation = self.next_generation();
            let session = CallSession::new(
                generation,
                call_type,
                CallRole::Initiator,
                remote.clone(),
                Phase::RingingOutgoing,
            );
            let call_id = session.id;
            slot.session = Some(session);
            (generation, call_id, remote)
        };
        tracing::info!(%call_id, %generation, peer = %remote, "Starting call");
        self.emit_state(call_id, CallState::RingingOutgoing);
        self.bridge
            .begin_attempt(generation, remote.clone(), SdpKind::Offer);

        if let Err(e) = self.prepare_outgoing(generation, &remote, call_type).await {
            self.fail_attempt(generation, CallRole::Initiator, &e).await;
            return Err(e);
        }

        let advanced = self
            .with_session(generation, |s| {
                let ringing = matches!(s.phase, Phase::RingingOutgoing);
                if ringing {
                    s.phase = Phase::Connecting;
                }
                ringing
            })
            .ok_or(CallError::Cancelled)?;
        if advanced {
            self.emit_state(call_id, CallState::Connecting);
        }
        Ok(call_id)
    }

    #[tracing::instrument(skip(self))]
    async fn accept_call(&self) -> Result<(), CallError> {
        let (generation, call_id, offer) = {
            let mut slot = self.slot.lock();
            let session = slot.session.as_mut().ok_or(CallError::NoIncomingCall)?;
            let Phase::RingingIncoming(offer) = &session.phase else {
                return Err(CallError::NoIncomingCall);
            };
            let offer = offer.clone();
            session.ring_timer = None;
            session.phase = Phase::Connecting;
            (session.generation, session.id, offer)
        };
        tracing::info!(%call_id, %generation, peer = %offer.from_peer, "Accepting call");
        self.emit_state(call_id, CallState::Connecting);
        self.bridge
            .begin_attempt(generation, offer.from_peer.clone(), SdpKind::Answer);

        if let Err(e) = self.prepare_incoming(generation, &offer).await {
            self.fail_attempt(generation, CallRole::Responder, &e).await;
            return Err(e);
        }
        Ok(())
    }

    #[tracing::instrument(skip(self))]
    async fn reject_call(&self) -> Result<(), CallError> {
        let generation = {
            let slot = self.slot.lock();
            match &slot.session {
                Some(s) if matches!(s.phase, Phase::RingingIncoming(_)) => s.generation,
                _ => return Err(CallError::NoIncomingCall),
            }
        };
        tracing::info!(%generation, "Rejecting call");
        self.teardown(Some(generation), EndReason::Rejected, true)
            .await;
        Ok(())
    }

    #[tracing::instrument(skip(self))]
    async fn end_call(&self) {
        let target = {
            let slot = self.slot.lock();
            slot.session.as_ref().map(|s| {
                let reason = match s.phase {
                    Phase::RingingIncoming(_) => EndReason::Rejected,
                    _ => EndReason::LocalHangup,
                };
                (s.generation, reason)
            })
        };
        match target {
            Some((generation, reason)) => {
                self.teardown(Some(generation), reason, true).await;
            }
            None => tracing::debug!("end_call with no call, nothing to do"),
        }
    }

    async fn set_remote_peer(&self, partner: Option<PeerId>) {
        let stale = {
            let mut slot = self.slot.lock();
            slot.partner = partner.clone();
            slot.session
                .as_ref()
                .filter(|s| Some(&s.remote_peer) != partner.as_ref())
                .map(|s| s.generation)
        };
        if let Some(generation) = stale {
            tracing::info!(%generation, "Chat partner changed, ending call");
            self.teardown(Some(generation), EndReason::PartnerChanged, true)
                .await;
        }
    }

    fn toggle_track(&self, kind: TrackKind) -> Option<bool> {
        let (call_id, enabled, local_media) = {
            let mut slot = self.slot.lock();
            let session = slot.session.as_mut()?;
            let track = session
                .stream
                .as_ref()?
                .tracks()
                .iter()
                .find(|t| t.kind() == kind)
                .cloned()?;
            let enabled = !track.is_enabled();
            track.set_enabled(enabled);
            match kind {
                TrackKind::Video => session.media.video = enabled,
                TrackKind::Audio => session.media.audio = enabled,
            }
            (session.id, enabled, session.media)
        };
        tracing::debug!(%call_id, ?kind, enabled, "Local track toggled");
        self.emit(CallEvent::MediaToggled {
            call_id,
            local_media,
        });
        Some(enabled)
    }

    #[tracing::instrument(skip(self))]
    async fn toggle_speaker(&self) -> Result<bool, CallError> {
        let (call_id, current) = {
            let slot = self.slot.lock();
            let session = slot.session.as_ref().ok_or(CallError::NoActiveCall)?;
            if session.call_type != CallType::Audio {
                return Err(CallError::NotAudioCall);
            }
            (session.id, session.speaker_enabled)
        };
        let wanted = !current;
        let route = AudioRoute::from_speaker(wanted);
        if let Err(e) = self.media.set_audio_route(route).await {
            tracing::debug!(%call_id, ?route, error = %e, "Audio route unchanged");
            return Ok(current);
        }
        self.with_call(call_id, |s| s.speaker_enabled = wanted)
            .ok_or(CallError::Cancelled)?;
        self.sinks.set_audio_output(route, route.volume());
        self.emit(CallEvent::SpeakerChanged {
            call_id,
            speaker_enabled: wanted,
        });
        Ok(wanted)
    }

    #[tracing::instrument(skip(self))]
    async fn switch_camera(&self) -> Result<CameraFacing, CallError> {
        let (call_id, target, peer) = {
            let slot = self.slot.lock();
            let session = slot.session.as_ref().ok_or(CallError::NoActiveCall)?;
            if !session.call_type.has_video() {
                return Err(CallError::NotVideoCall);
            }
            let has_camera = session
                .stream
                .as_ref()
                .and_then(MediaStreamHandle::video_track)
                .is_some();
            let peer = session.peer.clone().filter(|_| has_camera);
            let peer = peer.ok_or(CallError::NoActiveCall)?;
            (session.id, session.camera_facing.opposite(), peer)
        };

        let track = self.media.acquire_camera(target).await.map_err(|e| {
            tracing::warn!(%call_id, ?target, error = %e, "Camera switch failed, keeping current camera");
            CallError::from(e)
        })?;
        if let Err(e) = peer.replace_outgoing_track(Arc::clone(&track)).await {
            tracing::warn!(%call_id, error = %e, "Outgoing track replacement failed");
            track.stop();
            return Err(e.into());
        }

        let swapped = self.with_call(call_id, |s| {
            track.set_enabled(s.media.video);
            s.camera_facing = target;
            s.stream
                .as_mut()
                .and_then(|stream| stream.replace_track(Arc::clone(&track)))
        });
        let Some(old) = swapped else {
            track.stop();
            return Err(CallError::Cancelled);
        };
        if let Some(old) = old {
            old.stop();
        }
        self.sinks.set_local_preview(Some(track));
        tracing::info!(%call_id, facing = ?target, "Camera switched");
        self.emit(CallEvent::CameraSwitched {
            call_id,
            facing: target,
        });
        Ok(target)
    }

    async fn handle_event(self: &Arc<Self>, event: LoopEvent) {
        match event {
            LoopEvent::Signal { from, message } => self.on_signal(from, message).await,
            LoopEvent::Peer { generation, event } => self.on_peer_event(generation, event).await,
            LoopEvent::Quality { generation, sample } => self.on_quality(generation, sample),
            LoopEvent::RingTimeout(generation) => self.on_ring_timeout(generation).await,
            LoopEvent::ReconnectDue(generation) => self.on_reconnect_due(generation),
            LoopEvent::ReconnectDeadline(call_id) => self.on_reconnect_deadline(call_id).await,
        }
    }

    async fn on_signal(self: &Arc<Self>, from: PeerId, message: SignalingMessage) {
        let from_partner = self.slot.lock().partner.as_ref() == Some(&from);
        if !from_partner {
            tracing::warn!(peer = %from, message_type = message.message_type(), "Discarding message from non-partner");
            return;
        }

        match message {
            SignalingMessage::CallOffer {
                session_descriptor,
                call_type,
                ..
            } => self.on_offer(from, session_descriptor, call_type),
            SignalingMessage::CallAnswer {
                session_descriptor, ..
            } => self.on_answer(session_descriptor).await,
            SignalingMessage::IceCandidate { candidate, .. } => {
                self.on_remote_candidate(candidate).await;
            }
            SignalingMessage::CallEnd { .. } => {
                if !self.teardown(None, EndReason::RemoteHangup, false).await {
                    tracing::debug!(peer = %from, "Hangup with no call, ignored");
                }
            }
            SignalingMessage::CallFailed { reason } => {
                let call_id = self.slot.lock().session.as_ref().map(|s| s.id);
                if let Some(call_id) = call_id {
                    tracing::warn!(%call_id, %reason, "Relay reported call failure");
                    self.emit(CallEvent::Failure {
                        call_id,
                        failure: CallFailure::RemoteFailure(reason),
                    });
                    self.teardown(None, EndReason::RemoteFailure, false).await;
                }
            }
            SignalingMessage::CallConnectionLost { message } => self.emit(CallEvent::Notice {
                message: message.unwrap_or_else(|| "Call connection lost".to_string()),
            }),
            SignalingMessage::CallReconnectNeeded { message } => self.emit(CallEvent::Notice {
                message: message.unwrap_or_else(|| "Call is reconnecting".to_string()),
            }),
        }
    }

    fn on_offer(self: &Arc<Self>, from: PeerId, offer: SessionDescription, call_type: CallType) {
        let mut slot = self.slot.lock();
        if slot.session.is_none() {
            let generation = self.next_generation();
            let remote_offer = offer.sdp.clone();
            let incoming = IncomingCallOffer {
                call_type,
                from_peer: from.clone(),
                session_descriptor: offer,
                received_at: Utc::now(),
            };
            let mut session = CallSession::new(
                generation,
                call_type,
                CallRole::Responder,
                from.clone(),
                Phase::RingingIncoming(incoming),
            );
            session.answered_offers.push(remote_offer);
            session.ring_timer = Some(self.schedule(
                self.config.incoming_call_timeout,
                LoopEvent::RingTimeout(generation),
            ));
            let call_id = session.id;
            slot.session = Some(session);
            drop(slot);

            tracing::info!(%call_id, %generation, peer = %from, %call_type, "Incoming call");
            self.emit_state(call_id, CallState::RingingIncoming);
            self.emit(CallEvent::IncomingCall {
                call_id,
                call_type,
                from_peer: from,
                caller_name: self.config.caller_display_name.clone(),
            });
            return;
        }
        let Some(session) = slot.session.as_mut() else {
            return;
        };

        if matches!(session.phase, Phase::RingingIncoming(_))
            || session.answered_offers.contains(&offer.sdp)
        {
            tracing::debug!(peer = %from, state = ?session.state(), "Redelivered offer, ignored");
            return;
        }

        let can_reanswer = session.role == CallRole::Responder
            && session.phase.is_connected_phase()
            && session.peer.is_some();
        let stream = session.stream.clone().filter(|_| can_reanswer);
        let Some(stream) = stream else {
            tracing::warn!(peer = %from, state = ?session.state(), "Offer while busy, discarded");
            return;
        };

        let generation = self.next_generation();
        session.generation = generation;
        session.answered_offers.push(offer.sdp.clone());
        session.early_candidates.clear();
        session.quality_monitor = None;
        let old_peer = session.peer.take();
        let call_id = session.id;
        drop(slot);

        tracing::info!(%call_id, %generation, "Answering reconnection offer");
        self.bridge
            .begin_attempt(generation, from.clone(), SdpKind::Answer);
        let inner = Arc::clone(self);
        tokio::spawn(async move {
            if let Some(old) = old_peer {
                old.close().await;
            }
            if let Err(e) = inner.answer_offer(generation, &from, offer, &stream).await {
                if !e.is_cancellation() {
                    tracing::warn!(%call_id, error = %e, "Reconnection answer failed");
                    inner.on_connection_lost(generation).await;
                }
            }
        });
    }

    async fn on_answer(&self, answer: SessionDescription) {
        let peer = {
            let slot = self.slot.lock();
            slot.session
                .as_ref()
                .filter(|s| s.role == CallRole::Initiator)
                .and_then(|s| s.peer.clone())
        };
        let Some(peer) = peer else {
            tracing::warn!("Answer with no outgoing negotiation, discarded");
            return;
        };
        match apply_inbound_answer(&peer, answer).await {
            Ok(AnswerDisposition::Applied) => tracing::debug!("Remote answer applied"),
            Ok(AnswerDisposition::Duplicate) => tracing::debug!("Duplicate answer ignored"),
            Err(e) => tracing::warn!(error = %e, "Failed to apply remote answer"),
        }
    }

    async fn on_remote_candidate(&self, candidate: IceCandidate) {
        let peer = {
            let mut slot = self.slot.lock();
            let Some(session) = slot.session.as_mut() else {
                tracing::debug!("Candidate with no call, discarded");
                return;
            };
            match &session.peer {
                Some(peer) => Arc::clone(peer),
                None => {
                    session.early_candidates.push(candidate);
                    return;
                }
            }
        };
        if let Err(e) = route_inbound_candidate(&peer, candidate).await {
            tracing::warn!(error = %e, "Remote candidate rejected");
        }
    }

    async fn on_peer_event(&self, generation: Generation, event: PeerEvent) {
        match event {
            PeerEvent::LocalCandidate(candidate) => {
                if self.ensure_current(generation).is_err() {
                    return;
                }
                match self.bridge.send_candidate(generation, candidate).await {
                    Ok(CandidateSend::Held) => {
                        tracing::trace!(%generation, "Local candidate held until descriptor is sent");
                    }
                    Ok(CandidateSend::Sent) => {}
                    Err(e) => tracing::debug!(%generation, error = %e, "Local candidate not sent"),
                }
            }
            PeerEvent::RemoteTrack(track) => {
                let Some(call_id) = self.with_session(generation, |s| s.id) else {
                    return;
                };
                let kind = track.kind;
                self.sinks.attach_remote(track);
                tracing::debug!(%call_id, ?kind, "Remote track attached");
                self.emit(CallEvent::RemoteTrackAttached { call_id, kind });
            }
            PeerEvent::ConnectionState(state) => match state {
                PeerConnectionState::Connected => self.on_connected(generation),
                PeerConnectionState::Disconnected | PeerConnectionState::Failed => {
                    self.on_connection_lost(generation).await;
                }
                other => tracing::trace!(%generation, state = ?other, "Peer connection state"),
            },
        }
    }

    fn on_connected(&self, generation: Generation) {
        let update = self
            .with_session(generation, |s| {
                if matches!(s.phase, Phase::RingingIncoming(_)) {
                    return None;
                }
                let changed = s.state() != CallState::Active;
                s.phase = Phase::Active;
                s.started_at.get_or_insert_with(Utc::now);
                s.reconnect_failures = 0;
                s.last_failed_generation = None;
                s.reconnect_timer = None;
                s.reconnect_deadline = None;
                if s.quality_monitor.is_none() {
                    if let Some(peer) = &s.peer {
                        s.quality_monitor = Some(self.spawn_quality(generation, Arc::clone(peer)));
                    }
                }
                Some((s.id, changed))
            })
            .flatten();
        if let Some((call_id, changed)) = update {
            if changed {
                tracing::info!(%call_id, %generation, "Call connected");
                self.emit_state(call_id, CallState::Active);
            }
        }
    }

    async fn on_connection_lost(&self, generation: Generation) {
        let max = self.config.max_reconnect_attempts;
        let action = self
            .with_session(generation, |s| {
                if !s.phase.is_connected_phase() || s.last_failed_generation == Some(generation) {
                    return LossAction::Ignore;
                }
                s.last_failed_generation = Some(generation);
                s.reconnect_failures += 1;
                s.quality_monitor = None;
                if s.reconnect_failures >= max {
                    return LossAction::GiveUp(s.id);
                }
                let changed = s.state() != CallState::Reconnecting;
                s.phase = Phase::Reconnecting;
                if s.role == CallRole::Initiator {
                    s.reconnect_timer = Some(self.schedule(
                        self.config.reconnect_delay,
                        LoopEvent::ReconnectDue(generation),
                    ));
                }
                if s.reconnect_deadline.is_none() {
                    s.reconnect_deadline = Some(self.schedule(
                        self.config.reconnect_timeout,
                        LoopEvent::ReconnectDeadline(s.id),
                    ));
                }
                LossAction::Retry {
                    call_id: s.id,
                    failures: s.reconnect_failures,
                    changed,
                }
            })
            .unwrap_or(LossAction::Ignore);

        match action {
            LossAction::Ignore => {}
            LossAction::Retry {
                call_id,
                failures,
                changed,
            } => {
                tracing::warn!(%call_id, %generation, failures, "Connection lost, reconnecting");
                if changed {
                    self.emit_state(call_id, CallState::Reconnecting);
                }
            }
            LossAction::GiveUp(call_id) => {
                tracing::warn!(%call_id, %generation, "Reconnection attempts exhausted");
                self.emit(CallEvent::Failure {
                    call_id,
                    failure: CallFailure::ReconnectExhausted,
                });
                self.teardown(Some(generation), EndReason::ReconnectExhausted, true)
                    .await;
            }
        }
    }

    fn on_reconnect_due(self: &Arc<Self>, generation: Generation) {
        let prepared = self
            .with_session(generation, |s| {
                if !matches!(s.phase, Phase::Reconnecting) || s.role != CallRole::Initiator {
                    return None;
                }
                let stream = s.stream.clone()?;
                let next = self.next_generation();
                s.generation = next;
                s.reconnect_timer = None;
                s.early_candidates.clear();
                let old_peer = s.peer.take();
                Some((
                    s.id,
                    next,
                    s.remote_peer.clone(),
                    s.call_type,
                    stream,
                    old_peer,
                ))
            })
            .flatten();
        let Some((call_id, next, remote, call_type, stream, old_peer)) = prepared else {
            return;
        };

        tracing::info!(%call_id, generation = %next, "Re-offering");
        self.bridge.begin_attempt(next, remote.clone(), SdpKind::Offer);
        let inner = Arc::clone(self);
        tokio::spawn(async move {
            if let Some(old) = old_peer {
                old.close().await;
            }
            if let Err(e) = inner.offer_call(next, &remote, call_type, &stream).await {
                if !e.is_cancellation() {
                    tracing::warn!(%call_id, error = %e, "Re-offer failed");
                    inner.on_connection_lost(next).await;
                }
            }
        });
    }

    async fn on_reconnect_deadline(&self, call_id: CallId) {
        let generation = self
            .with_call(call_id, |s| {
                matches!(s.phase, Phase::Reconnecting).then_some(s.generation)
            })
            .flatten();
        if let Some(generation) = generation {
            tracing::warn!(%call_id, "Reconnection deadline passed");
            self.emit(CallEvent::Failure {
                call_id,
                failure: CallFailure::ReconnectExhausted,
            });
            self.teardown(Some(generation), EndReason::ReconnectExhausted, true)
                .await;
        }
    }

    async fn on_ring_timeout(&self, generation: Generation) {
        let call_id = self
            .with_session(generation, |s| {
                matches!(s.phase, Phase::RingingIncoming(_)).then_some(s.id)
            })
            .flatten();
        if let Some(call_id) = call_id {
            tracing::info!(%call_id, "Incoming call unanswered");
            self.emit(CallEvent::Failure {
                call_id,
                failure: CallFailure::SignalingTimeout,
            });
            self.teardown(Some(generation), EndReason::Unanswered, true)
                .await;
        }
    }

    fn on_quality(&self, generation: Generation, sample: QualitySample) {
        let changed = self
            .with_session(generation, |s| {
                let changed = s.quality != sample.class;
                s.quality = sample.class;
                changed.then_some(s.id)
            })
            .flatten();
        tracing::trace!(%generation, loss_ratio = sample.loss_ratio, "Quality sample");
        if let Some(call_id) = changed {
            tracing::debug!(%call_id, quality = ?sample.class, "Call quality changed");
            self.emit(CallEvent::QualityChanged {
                call_id,
                quality: sample.class,
                loss_ratio: sample.loss_ratio,
            });
        }
    }
}

async fn run_event_loop<T: SignalingTransport>(
    weak: Weak<ManagerInner<T>>,
    mut rx: mpsc::UnboundedReceiver<LoopEvent>,
) {
    while let Some(event) = rx.recv().await {
        let Some(inner) = weak.upgrade() else {
            break;
        };
        inner.handle_event(event).await;
    }
    tracing::debug!("Call event loop stopped");
}

/// Call manager
///
/// Cheap to clone; all clones drive the same call.
pub struct CallManager<T: SignalingTransport> {
    inner: Arc<ManagerInner<T>>,
}

impl<T: SignalingTransport> Clone for CallManager<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: SignalingTransport> CallManager<T> {
    /// Create a call manager
    #[must_use]
    pub fn new(
        config: CallManagerConfig,
        transport: Arc<T>,
        local_peer: PeerId,
        media_devices: Arc<dyn MediaDevices>,
        peer_factory: Arc<dyn PeerConnectionFactory>,
    ) -> Self {
        let (events, _) = broadcast::channel(config.event_channel_capacity.max(1));
        let (loop_tx, loop_rx) = mpsc::unbounded_channel();
        Self {
            inner: Arc::new(ManagerInner {
                bridge: Arc::new(SignalingBridge::new(transport, local_peer)),
                media: MediaAcquirer::new(media_devices),
                peers: peer_factory,
                slot: Mutex::new(Slot::default()),
                sinks: Arc::new(MediaSinks::new()),
                generations: AtomicU64::new(0),
                events,
                loop_tx,
                loop_rx: Mutex::new(Some(loop_rx)),
                tasks: Mutex::new(Vec::new()),
                config,
            }),
        }
    }

    /// Create a builder
    #[must_use]
    pub fn builder(transport: Arc<T>, local_peer: PeerId) -> CallManagerBuilder<T> {
        CallManagerBuilder::new(transport, local_peer)
    }

    /// Subscribe to signaling and start processing events
    ///
    /// # Errors
    ///
    /// Returns `AlreadySubscribed` if the manager was already started
    pub fn start(&self) -> Result<(), CallError> {
        let rx = self
            .inner
            .loop_rx
            .lock()
            .take()
            .ok_or(SignalingError::AlreadySubscribed)?;
        self.inner
            .bridge
            .subscribe(Arc::new(LoopSubscriber(self.inner.loop_tx.clone())))?;

        let event_loop = tokio::spawn(run_event_loop(Arc::downgrade(&self.inner), rx));
        let receiver = self.inner.bridge.spawn_receiver();
        self.inner.tasks.lock().extend([event_loop, receiver]);
        tracing::info!(peer = %self.inner.bridge.local_peer(), "Call manager started");
        Ok(())
    }

    /// End any call and stop processing events
    pub async fn shutdown(&self) {
        self.inner.end_call().await;
        self.inner.bridge.unsubscribe();
        for task in self.inner.tasks.lock().drain(..) {
            task.abort();
        }
        tracing::info!("Call manager stopped");
    }

    /// Set the current chat partner. A call with anyone else is ended.
    pub async fn set_remote_peer(&self, partner: Option<PeerId>) {
        self.inner.set_remote_peer(partner).await;
    }

    /// Current chat partner
    #[must_use]
    pub fn remote_peer(&self) -> Option<PeerId> {
        self.inner.slot.lock().partner.clone()
    }

    /// Local identity
    #[must_use]
    pub fn local_peer(&self) -> &PeerId {
        self.inner.bridge.local_peer()
    }

    /// Call the current chat partner
    ///
    /// # Errors
    ///
    /// `NoPartner`, `CallInProgress`, a media/peer/signaling failure (the
    /// call is torn down), or `Cancelled` if the call ended meanwhile
    pub async fn start_call(&self, call_type: CallType) -> Result<CallId, CallError> {
        self.inner.start_call(call_type).await
    }

    /// Accept the ringing incoming call
    ///
    /// # Errors
    ///
    /// `NoIncomingCall`, a media/peer/signaling failure (the call is torn
    /// down), or `Cancelled` if the call ended meanwhile
    pub async fn accept_call(&self) -> Result<(), CallError> {
        self.inner.accept_call().await
    }

    /// Decline the ringing incoming call
    ///
    /// # Errors
    ///
    /// `NoIncomingCall` if nothing is ringing
    pub async fn reject_call(&self) -> Result<(), CallError> {
        self.inner.reject_call().await
    }

    /// Hang up. No-op when idle.
    pub async fn end_call(&self) {
        self.inner.end_call().await;
    }

    /// Flip the camera track, `None` without a local video track
    pub fn toggle_video(&self) -> Option<bool> {
        self.inner.toggle_track(TrackKind::Video)
    }

    /// Flip the microphone track, `None` without a local audio track
    pub fn toggle_audio(&self) -> Option<bool> {
        self.inner.toggle_track(TrackKind::Audio)
    }

    /// Switch between loudspeaker and earpiece on audio calls.
    ///
    /// Returns the speaker flag now in effect; a failed route change keeps
    /// the previous route.
    ///
    /// # Errors
    ///
    /// `NoActiveCall` or `NotAudioCall`
    pub async fn toggle_speaker(&self) -> Result<bool, CallError> {
        self.inner.toggle_speaker().await
    }

    /// Swap to the other camera without renegotiating
    ///
    /// # Errors
    ///
    /// `NotVideoCall`, `NoActiveCall`, or the acquisition/replacement error;
    /// the previous camera stays in effect on error
    pub async fn switch_camera(&self) -> Result<CameraFacing, CallError> {
        self.inner.switch_camera().await
    }

    /// Current lifecycle state, `Idle` without a call
    #[must_use]
    pub fn state(&self) -> CallState {
        self.inner
            .slot
            .lock()
            .session
            .as_ref()
            .map_or(CallState::Idle, CallSession::state)
    }

    /// Copy of the current call's observable fields
    #[must_use]
    pub fn snapshot(&self) -> Option<CallSnapshot> {
        self.inner
            .slot
            .lock()
            .session
            .as_ref()
            .map(CallSession::snapshot)
    }

    /// The offer waiting for accept/reject
    #[must_use]
    pub fn incoming_call(&self) -> Option<IncomingCallOffer> {
        let slot = self.inner.slot.lock();
        match slot.session.as_ref().map(|s| &s.phase) {
            Some(Phase::RingingIncoming(offer)) => Some(offer.clone()),
            _ => None,
        }
    }

    /// Render targets for local preview and remote media
    #[must_use]
    pub fn sinks(&self) -> Arc<MediaSinks> {
        Arc::clone(&self.inner.sinks)
    }

    /// Subscribe to call events
    #[must_use]
    pub fn subscribe_events(&self) -> broadcast::Receiver<CallEvent> {
        self.inner.events.subscribe()
    }

    /// Active configuration
    #[must_use]
    pub fn config(&self) -> &CallManagerConfig {
        &self.inner.config
    }
}

/// Call manager builder
pub struct CallManagerBuilder<T: SignalingTransport> {
    transport: Arc<T>,
    local_peer: PeerId,
    config: CallManagerConfig,
    media_devices: Option<Arc<dyn MediaDevices>>,
    peer_factory: Option<Arc<dyn PeerConnectionFactory>>,
}

impl<T: SignalingTransport> CallManagerBuilder<T> {
    /// Create new builder
    #[must_use]
    pub fn new(transport: Arc<T>, local_peer: PeerId) -> Self {
        Self {
            transport,
            local_peer,
            config: CallManagerConfig::default(),
            media_devices: None,
            peer_factory: None,
        }
    }

    /// Set configuration
    #[must_use]
    pub fn with_config(mut self, config: CallManagerConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the capture stack
    #[must_use]
    pub fn with_media_devices(mut self, devices: Arc<dyn MediaDevices>) -> Self {
        self.media_devices = Some(devices);
        self
    }

    /// Set the peer connection factory
    #[must_use]
    pub fn with_peer_factory(mut self, factory: Arc<dyn PeerConnectionFactory>) -> Self {
        self.peer_factory = Some(factory);
        self
    }

    /// Build the manager
    ///
    /// Without the `webrtc-backend` feature both the capture stack and the
    /// peer factory must be set.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if a required component is missing
    pub fn build(self) -> Result<CallManager<T>, CallError> {
        let media_devices = match self.media_devices {
            Some(devices) => devices,
            None => default_media_devices()?,
        };
        let peer_factory = match self.peer_factory {
            Some(factory) => factory,
            None => default_peer_factory()?,
        };
        Ok(CallManager::new(
            self.config,
            self.transport,
            self.local_peer,
            media_devices,
            peer_factory,
        ))
    }
}

#[cfg(feature = "webrtc-backend")]
fn default_media_devices() -> Result<Arc<dyn MediaDevices>, CallError> {
    Ok(Arc::new(crate::webrtc_backend::SampleMediaDevices::new()))
}

#[cfg(not(feature = "webrtc-backend"))]
fn default_media_devices() -> Result<Arc<dyn MediaDevices>, CallError> {
    Err(CallError::ConfigError("no media devices configured".into()))
}

#[cfg(feature = "webrtc-backend")]
fn default_peer_factory() -> Result<Arc<dyn PeerConnectionFactory>, CallError> {
    Ok(Arc::new(crate::webrtc_backend::WebRtcPeerFactory::new()))
}

#[cfg(not(feature = "webrtc-backend"))]
fn default_peer_factory() -> Result<Arc<dyn PeerConnectionFactory>, CallError> {
    Err(CallError::ConfigError("no peer factory configured".into()))
}
