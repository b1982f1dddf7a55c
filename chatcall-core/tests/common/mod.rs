//! Shared mocks for the call manager integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use chatcall_core::media::{AudioRoute, LocalTrack, MediaDevices, MediaError, MediaRequest, RemoteTrack, TrackKind};
use chatcall_core::peer::{
    PeerConfig, PeerConnectionFactory, PeerConnectionState, PeerError, PeerEvent, PeerEventSink,
    RtcPeer, SenderId, SignalingState,
};
use chatcall_core::quality::{InboundRtpSample, TransportStats};
use chatcall_core::signaling::{SignalingMessage, SignalingTransport};
use chatcall_core::types::{
    CallEvent, CallRole, CallState, CallType, CameraFacing, IceCandidate, PeerId, SdpKind,
    SessionDescription,
};
use chatcall_core::{CallManager, CallManagerConfig};
use parking_lot::Mutex;
use std::any::Any;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, Notify};

pub const ME: &str = "alice";
pub const PARTNER: &str = "bob";

#[derive(Debug, thiserror::Error)]
#[error("mock transport error")]
pub struct MockTransportError;

/// In-memory relay end: records what is sent, replays what is injected
pub struct MockTransport {
    sent: Mutex<Vec<(PeerId, SignalingMessage)>>,
    send_gate: Mutex<Option<Arc<Notify>>>,
    inbound_tx: mpsc::UnboundedSender<(PeerId, SignalingMessage)>,
    inbound_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<(PeerId, SignalingMessage)>>,
}

impl MockTransport {
    pub fn new() -> Arc<Self> {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            sent: Mutex::new(Vec::new()),
            send_gate: Mutex::new(None),
            inbound_tx,
            inbound_rx: tokio::sync::Mutex::new(inbound_rx),
        })
    }

    pub fn inject(&self, from: &str, message: SignalingMessage) {
        self.inbound_tx.send((PeerId::new(from), message)).unwrap();
    }

    pub fn sent(&self) -> Vec<(PeerId, SignalingMessage)> {
        self.sent.lock().clone()
    }

    pub fn sent_types(&self) -> Vec<&'static str> {
        self.sent.lock().iter().map(|(_, m)| m.message_type()).collect()
    }

    pub fn count(&self, message_type: &str) -> usize {
        self.sent_types().iter().filter(|t| **t == message_type).count()
    }

    /// Record sends but do not complete them until [`release_sends`](Self::release_sends)
    pub fn hold_sends(&self) {
        *self.send_gate.lock() = Some(Arc::new(Notify::new()));
    }

    pub fn release_sends(&self) {
        if let Some(gate) = self.send_gate.lock().take() {
            gate.notify_waiters();
        }
    }
}

#[async_trait]
impl SignalingTransport for MockTransport {
    type Error = MockTransportError;

    async fn send_message(
        &self,
        peer: &PeerId,
        message: SignalingMessage,
    ) -> Result<(), Self::Error> {
        self.sent.lock().push((peer.clone(), message));
        let gate = self.send_gate.lock().clone();
        if let Some(gate) = gate {
            gate.notified().await;
        }
        Ok(())
    }

    async fn receive_message(&self) -> Result<(PeerId, SignalingMessage), Self::Error> {
        match self.inbound_rx.lock().await.recv().await {
            Some(received) => Ok(received),
            None => std::future::pending().await,
        }
    }
}

#[derive(Debug)]
pub struct MockTrack {
    pub id: String,
    pub kind: TrackKind,
    pub facing: Option<CameraFacing>,
    enabled: AtomicBool,
    live: AtomicBool,
}

impl MockTrack {
    pub fn new(id: impl Into<String>, kind: TrackKind, facing: Option<CameraFacing>) -> Arc<Self> {
        Arc::new(Self {
            id: id.into(),
            kind,
            facing,
            enabled: AtomicBool::new(true),
            live: AtomicBool::new(true),
        })
    }
}

impl LocalTrack for MockTrack {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> TrackKind {
        self.kind
    }

    fn facing(&self) -> Option<CameraFacing> {
        self.facing
    }

    fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    fn stop(&self) {
        self.live.store(false, Ordering::SeqCst);
    }

    fn is_live(&self) -> bool {
        self.live.load(Ordering::SeqCst)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Capture stack with scripted failures and an optional hold on acquisition
#[derive(Default)]
pub struct MockMediaDevices {
    failure: Mutex<Option<MediaError>>,
    camera_failure: Mutex<Option<MediaError>>,
    gate: Mutex<Option<Arc<Notify>>>,
    issued: Mutex<Vec<Arc<MockTrack>>>,
    route_supported: AtomicBool,
    routes: Mutex<Vec<AudioRoute>>,
    counter: AtomicUsize,
}

impl MockMediaDevices {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            route_supported: AtomicBool::new(true),
            ..Default::default()
        })
    }

    pub fn fail_with(&self, error: MediaError) {
        *self.failure.lock() = Some(error);
    }

    pub fn fail_camera_with(&self, error: MediaError) {
        *self.camera_failure.lock() = Some(error);
    }

    /// Park every acquisition until [`release`](Self::release)
    pub fn hold(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        *self.gate.lock() = Some(Arc::clone(&gate));
        gate
    }

    /// Let every parked acquisition through
    pub fn release(&self) {
        if let Some(gate) = self.gate.lock().take() {
            gate.notify_waiters();
        }
    }

    pub fn set_route_supported(&self, supported: bool) {
        self.route_supported.store(supported, Ordering::SeqCst);
    }

    pub fn routes(&self) -> Vec<AudioRoute> {
        self.routes.lock().clone()
    }

    pub fn issued(&self) -> Vec<Arc<MockTrack>> {
        self.issued.lock().clone()
    }

    pub fn live_tracks(&self) -> usize {
        self.issued.lock().iter().filter(|t| t.is_live()).count()
    }
}

#[async_trait]
impl MediaDevices for MockMediaDevices {
    async fn get_user_media(
        &self,
        request: MediaRequest,
    ) -> Result<Vec<Arc<dyn LocalTrack>>, MediaError> {
        let gate = self.gate.lock().clone();
        if let Some(gate) = gate {
            gate.notified().await;
        }

        let camera_only = request.audio.is_none() && request.video.is_some();
        if camera_only {
            if let Some(e) = self.camera_failure.lock().clone() {
                return Err(e);
            }
        }
        if let Some(e) = self.failure.lock().clone() {
            return Err(e);
        }

        let mut tracks = Vec::new();
        if request.audio.is_some() {
            let n = self.counter.fetch_add(1, Ordering::SeqCst);
            tracks.push(MockTrack::new(format!("mic-{n}"), TrackKind::Audio, None));
        }
        if let Some(facing) = request.video {
            let n = self.counter.fetch_add(1, Ordering::SeqCst);
            tracks.push(MockTrack::new(
                format!("cam-{n}"),
                TrackKind::Video,
                Some(facing),
            ));
        }
        self.issued.lock().extend(tracks.iter().cloned());
        Ok(tracks.into_iter().map(|t| t as Arc<dyn LocalTrack>).collect())
    }

    async fn set_audio_route(&self, route: AudioRoute) -> Result<(), MediaError> {
        if !self.route_supported.load(Ordering::SeqCst) {
            return Err(MediaError::Platform("route unavailable".into()));
        }
        self.routes.lock().push(route);
        Ok(())
    }
}

/// Peer connection with an offer/answer state machine and recorded calls
pub struct MockPeer {
    pub index: usize,
    pub role: CallRole,
    sink: PeerEventSink,
    state: Mutex<SignalingState>,
    remote_descriptions: Mutex<Vec<SessionDescription>>,
    candidates: Mutex<Vec<IceCandidate>>,
    senders: Mutex<Vec<String>>,
    replaced: Mutex<Vec<(SenderId, String)>>,
    stats: Mutex<TransportStats>,
    stats_calls: AtomicUsize,
    closed: AtomicBool,
}

impl MockPeer {
    pub fn emit(&self, event: PeerEvent) {
        (self.sink)(event);
    }

    pub fn emit_state(&self, state: PeerConnectionState) {
        self.emit(PeerEvent::ConnectionState(state));
    }

    pub fn emit_remote_track(&self, kind: TrackKind) {
        self.emit(PeerEvent::RemoteTrack(RemoteTrack {
            id: format!("remote-{kind:?}"),
            kind,
            handle: None,
        }));
    }

    pub fn set_loss(&self, received: u64, lost: u64) {
        *self.stats.lock() = TransportStats {
            inbound: vec![InboundRtpSample {
                kind: Some(TrackKind::Audio),
                packets_received: received,
                packets_lost: lost,
            }],
        };
    }

    pub fn remote_descriptions(&self) -> Vec<SessionDescription> {
        self.remote_descriptions.lock().clone()
    }

    pub fn applied_candidates(&self) -> Vec<String> {
        self.candidates
            .lock()
            .iter()
            .map(|c| c.candidate.clone())
            .collect()
    }

    pub fn senders(&self) -> Vec<String> {
        self.senders.lock().clone()
    }

    pub fn replaced(&self) -> Vec<(SenderId, String)> {
        self.replaced.lock().clone()
    }

    pub fn stats_calls(&self) -> usize {
        self.stats_calls.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn check_open(&self) -> Result<(), PeerError> {
        if self.is_closed() {
            Err(PeerError::Closed)
        } else {
            Ok(())
        }
    }

    fn gathered(&self) {
        self.emit(PeerEvent::LocalCandidate(IceCandidate::new(format!(
            "candidate:local-{}",
            self.index
        ))));
    }
}

#[async_trait]
impl RtcPeer for MockPeer {
    async fn add_track(&self, track: Arc<dyn LocalTrack>) -> Result<SenderId, PeerError> {
        self.check_open()?;
        let mut senders = self.senders.lock();
        senders.push(track.id().to_string());
        Ok(SenderId(senders.len() - 1))
    }

    async fn replace_track(
        &self,
        sender: SenderId,
        track: Arc<dyn LocalTrack>,
    ) -> Result<(), PeerError> {
        self.check_open()?;
        let mut senders = self.senders.lock();
        let slot = senders
            .get_mut(sender.0)
            .ok_or_else(|| PeerError::Track("unknown sender".into()))?;
        *slot = track.id().to_string();
        self.replaced.lock().push((sender, track.id().to_string()));
        Ok(())
    }

    async fn create_offer(&self) -> Result<SessionDescription, PeerError> {
        self.check_open()?;
        *self.state.lock() = SignalingState::HaveLocalOffer;
        self.gathered();
        Ok(SessionDescription::offer(format!("v=0 offer {}", self.index)))
    }

    async fn create_answer(&self) -> Result<SessionDescription, PeerError> {
        self.check_open()?;
        let mut state = self.state.lock();
        if *state != SignalingState::HaveRemoteOffer {
            return Err(PeerError::Negotiation("no remote offer".into()));
        }
        *state = SignalingState::Stable;
        drop(state);
        self.gathered();
        Ok(SessionDescription::answer(format!("v=0 answer {}", self.index)))
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), PeerError> {
        self.check_open()?;
        {
            let mut state = self.state.lock();
            *state = match (desc.kind, *state) {
                (SdpKind::Offer, SignalingState::Stable) => SignalingState::HaveRemoteOffer,
                (SdpKind::Answer, SignalingState::HaveLocalOffer) => SignalingState::Stable,
                (kind, current) => {
                    return Err(PeerError::Negotiation(format!(
                        "{kind:?} not allowed in {current:?}"
                    )))
                }
            };
        }
        self.remote_descriptions.lock().push(desc);
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), PeerError> {
        self.check_open()?;
        if self.remote_descriptions.lock().is_empty() {
            return Err(PeerError::Candidate("no remote description".into()));
        }
        self.candidates.lock().push(candidate);
        Ok(())
    }

    fn signaling_state(&self) -> SignalingState {
        if self.is_closed() {
            SignalingState::Closed
        } else {
            *self.state.lock()
        }
    }

    async fn stats(&self) -> Result<TransportStats, PeerError> {
        self.check_open()?;
        self.stats_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.stats.lock().clone())
    }

    async fn close(&self) -> Result<(), PeerError> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

#[derive(Default)]
pub struct MockPeerFactory {
    peers: Mutex<Vec<Arc<MockPeer>>>,
    fail: AtomicBool,
}

impl MockPeerFactory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn fail_creation(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub fn count(&self) -> usize {
        self.peers.lock().len()
    }

    pub fn peer(&self, index: usize) -> Arc<MockPeer> {
        Arc::clone(&self.peers.lock()[index])
    }

    pub fn last(&self) -> Arc<MockPeer> {
        let peers = self.peers.lock();
        Arc::clone(peers.last().unwrap())
    }
}

#[async_trait]
impl PeerConnectionFactory for MockPeerFactory {
    async fn create(
        &self,
        config: &PeerConfig,
        events: PeerEventSink,
    ) -> Result<Arc<dyn RtcPeer>, PeerError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(PeerError::Create("factory offline".into()));
        }
        let mut peers = self.peers.lock();
        let peer = Arc::new(MockPeer {
            index: peers.len(),
            role: config.role,
            sink: events,
            state: Mutex::new(SignalingState::Stable),
            remote_descriptions: Mutex::new(Vec::new()),
            candidates: Mutex::new(Vec::new()),
            senders: Mutex::new(Vec::new()),
            replaced: Mutex::new(Vec::new()),
            stats: Mutex::new(TransportStats::default()),
            stats_calls: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
        });
        peers.push(Arc::clone(&peer));
        Ok(peer)
    }
}

/// Let the event loop and receiver drain under paused time
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(100)).await;
}

pub fn offer_from_partner(call_type: CallType) -> SignalingMessage {
    SignalingMessage::CallOffer {
        session_descriptor: SessionDescription::offer("v=0 remote offer"),
        from_peer_id: PeerId::new(PARTNER),
        call_type,
    }
}

/// A fresh offer from the partner, as sent when it restarts negotiation
pub fn reoffer_from_partner(call_type: CallType, sdp: &str) -> SignalingMessage {
    SignalingMessage::CallOffer {
        session_descriptor: SessionDescription::offer(sdp),
        from_peer_id: PeerId::new(PARTNER),
        call_type,
    }
}

pub fn answer_to_me() -> SignalingMessage {
    SignalingMessage::CallAnswer {
        session_descriptor: SessionDescription::answer("v=0 remote answer"),
        to_peer_id: PeerId::new(ME),
    }
}

pub fn candidate_to_me(candidate: &str) -> SignalingMessage {
    SignalingMessage::IceCandidate {
        candidate: IceCandidate::new(candidate),
        to_peer_id: PeerId::new(ME),
    }
}

pub fn hangup_to_me() -> SignalingMessage {
    SignalingMessage::CallEnd {
        to_peer_id: PeerId::new(ME),
    }
}

pub struct Harness {
    pub manager: CallManager<MockTransport>,
    pub transport: Arc<MockTransport>,
    pub devices: Arc<MockMediaDevices>,
    pub factory: Arc<MockPeerFactory>,
    pub events: broadcast::Receiver<CallEvent>,
}

impl Harness {
    pub async fn new() -> Self {
        Self::with_config(CallManagerConfig::default()).await
    }

    pub async fn with_config(config: CallManagerConfig) -> Self {
        let transport = MockTransport::new();
        let devices = MockMediaDevices::new();
        let factory = MockPeerFactory::new();
        let manager = CallManager::builder(Arc::clone(&transport), PeerId::new(ME))
            .with_config(config)
            .with_media_devices(devices.clone())
            .with_peer_factory(factory.clone())
            .build()
            .unwrap();
        let events = manager.subscribe_events();
        manager.start().unwrap();
        manager.set_remote_peer(Some(PeerId::new(PARTNER))).await;
        Self {
            manager,
            transport,
            devices,
            factory,
            events,
        }
    }

    pub fn inject(&self, message: SignalingMessage) {
        self.transport.inject(PARTNER, message);
    }

    pub fn drain_events(&mut self) -> Vec<CallEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            events.push(event);
        }
        events
    }

    pub fn drain_states(&mut self) -> Vec<CallState> {
        self.drain_events()
            .into_iter()
            .filter_map(|e| match e {
                CallEvent::StateChanged { state, .. } => Some(state),
                _ => None,
            })
            .collect()
    }

    /// Outgoing call taken all the way to `Active`
    pub async fn establish_outgoing(&mut self, call_type: CallType) -> Arc<MockPeer> {
        self.manager.start_call(call_type).await.unwrap();
        self.inject(answer_to_me());
        settle().await;
        let peer = self.factory.last();
        peer.emit_state(PeerConnectionState::Connected);
        settle().await;
        assert_eq!(self.manager.state(), CallState::Active);
        peer
    }

    /// Incoming call accepted and taken to `Active`
    pub async fn establish_incoming(&mut self, call_type: CallType) -> Arc<MockPeer> {
        self.inject(offer_from_partner(call_type));
        settle().await;
        self.manager.accept_call().await.unwrap();
        let peer = self.factory.last();
        peer.emit_state(PeerConnectionState::Connected);
        settle().await;
        assert_eq!(self.manager.state(), CallState::Active);
        peer
    }
}
