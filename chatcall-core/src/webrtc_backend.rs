//! webrtc-rs bindings for the peer and media seams
//!
//! [`WebRtcPeerFactory`] builds an `RTCPeerConnection` per call attempt with
//! the default codecs and interceptors. [`SampleMediaDevices`] hands out
//! [`SampleTrack`]s backed by `TrackLocalStaticSample`; the application's
//! capture pipeline feeds encoded frames into them.

use crate::media::{
    AudioRoute, LocalTrack, MediaDevices, MediaError, MediaRequest, RemoteTrack, TrackKind,
};
use crate::peer::{
    PeerConfig, PeerConnectionFactory, PeerConnectionState, PeerError, PeerEvent, PeerEventSink,
    RtcPeer, SenderId, SignalingState,
};
use crate::quality::{InboundRtpSample, TransportStats};
use crate::types::{CameraFacing, IceCandidate, SdpKind, SessionDescription};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::any::Any;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::media::Sample;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::signaling_state::RTCSignalingState;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::rtp_transceiver::RTCRtpTransceiver;
use webrtc::stats::StatsReportType;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

const STREAM_ID: &str = "chatcall";

fn negotiation(e: webrtc::Error) -> PeerError {
    PeerError::Negotiation(e.to_string())
}

/// Creates webrtc-rs peer connections
#[derive(Debug, Default, Clone)]
pub struct WebRtcPeerFactory;

impl WebRtcPeerFactory {
    /// Create a factory
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl PeerConnectionFactory for WebRtcPeerFactory {
    #[tracing::instrument(skip(self, events), fields(peer = %config.remote_peer, role = ?config.role))]
    async fn create(
        &self,
        config: &PeerConfig,
        events: PeerEventSink,
    ) -> Result<Arc<dyn RtcPeer>, PeerError> {
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(|e| PeerError::Create(e.to_string()))?;
        let registry = register_default_interceptors(Registry::new(), &mut media_engine)
            .map_err(|e| PeerError::Create(e.to_string()))?;
        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let rtc_config = RTCConfiguration {
            ice_servers: config
                .ice_servers
                .iter()
                .map(|server| RTCIceServer {
                    urls: server.urls.clone(),
                    username: server.username.clone().unwrap_or_default(),
                    credential: server.credential.clone().unwrap_or_default(),
                    ..Default::default()
                })
                .collect(),
            ..Default::default()
        };
        let pc = Arc::new(
            api.new_peer_connection(rtc_config)
                .await
                .map_err(|e| PeerError::Create(e.to_string()))?,
        );

        wire_callbacks(&pc, events);
        tracing::debug!("Peer connection created");
        Ok(Arc::new(WebRtcPeer {
            pc,
            senders: Mutex::new(Vec::new()),
        }))
    }
}

fn wire_callbacks(pc: &RTCPeerConnection, events: PeerEventSink) {
    let on_candidate = Arc::clone(&events);
    pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
        if let Some(candidate) = candidate {
            match candidate.to_json() {
                Ok(init) => on_candidate(PeerEvent::LocalCandidate(IceCandidate {
                    candidate: init.candidate,
                    sdp_mid: init.sdp_mid,
                    sdp_mline_index: init.sdp_mline_index,
                    username_fragment: init.username_fragment,
                })),
                Err(e) => tracing::warn!(error = %e, "Could not serialize local candidate"),
            }
        }
        Box::pin(async {})
    }));

    let on_track = Arc::clone(&events);
    pc.on_track(Box::new(
        move |track: Arc<TrackRemote>,
              _receiver: Arc<RTCRtpReceiver>,
              _transceiver: Arc<RTCRtpTransceiver>| {
            let kind = match track.kind() {
                RTPCodecType::Audio => Some(TrackKind::Audio),
                RTPCodecType::Video => Some(TrackKind::Video),
                _ => None,
            };
            if let Some(kind) = kind {
                let id = track.id().to_string();
                on_track(PeerEvent::RemoteTrack(RemoteTrack {
                    id,
                    kind,
                    handle: Some(track as Arc<dyn Any + Send + Sync>),
                }));
            }
            Box::pin(async {})
        },
    ));

    pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
        let mapped = match state {
            RTCPeerConnectionState::New => Some(PeerConnectionState::New),
            RTCPeerConnectionState::Connecting => Some(PeerConnectionState::Connecting),
            RTCPeerConnectionState::Connected => Some(PeerConnectionState::Connected),
            RTCPeerConnectionState::Disconnected => Some(PeerConnectionState::Disconnected),
            RTCPeerConnectionState::Failed => Some(PeerConnectionState::Failed),
            RTCPeerConnectionState::Closed => Some(PeerConnectionState::Closed),
            _ => None,
        };
        if let Some(mapped) = mapped {
            events(PeerEvent::ConnectionState(mapped));
        }
        Box::pin(async {})
    }));
}

/// Label each per-kind counter set with its track kind
fn transport_stats(per_kind: BTreeMap<String, InboundRtpSample>) -> TransportStats {
    TransportStats {
        inbound: per_kind
            .into_iter()
            .map(|(kind, mut sample)| {
                sample.kind = match kind.as_str() {
                    "audio" => Some(TrackKind::Audio),
                    "video" => Some(TrackKind::Video),
                    _ => None,
                };
                sample
            })
            .collect(),
    }
}

/// An `RTCPeerConnection` behind the [`RtcPeer`] seam
pub struct WebRtcPeer {
    pc: Arc<RTCPeerConnection>,
    senders: Mutex<Vec<Arc<RTCRtpSender>>>,
}

impl WebRtcPeer {
    fn rtc_track(track: &Arc<dyn LocalTrack>) -> Result<Arc<dyn TrackLocal + Send + Sync>, PeerError> {
        track
            .as_any()
            .downcast_ref::<SampleTrack>()
            .map(|sample| Arc::clone(&sample.rtc) as Arc<dyn TrackLocal + Send + Sync>)
            .ok_or_else(|| PeerError::Track(format!("track {} is not a sample track", track.id())))
    }
}

#[async_trait]
impl RtcPeer for WebRtcPeer {
    async fn add_track(&self, track: Arc<dyn LocalTrack>) -> Result<SenderId, PeerError> {
        let rtc = Self::rtc_track(&track)?;
        let sender = self
            .pc
            .add_track(rtc)
            .await
            .map_err(|e| PeerError::Track(e.to_string()))?;
        let mut senders = self.senders.lock();
        senders.push(sender);
        Ok(SenderId(senders.len() - 1))
    }

    async fn replace_track(
        &self,
        sender: SenderId,
        track: Arc<dyn LocalTrack>,
    ) -> Result<(), PeerError> {
        let rtc = Self::rtc_track(&track)?;
        let sender = self
            .senders
            .lock()
            .get(sender.0)
            .cloned()
            .ok_or_else(|| PeerError::Track(format!("unknown sender {}", sender.0)))?;
        sender
            .replace_track(Some(rtc))
            .await
            .map_err(|e| PeerError::Track(e.to_string()))
    }

    async fn create_offer(&self) -> Result<SessionDescription, PeerError> {
        let offer = self.pc.create_offer(None).await.map_err(negotiation)?;
        self.pc
            .set_local_description(offer.clone())
            .await
            .map_err(negotiation)?;
        Ok(SessionDescription::offer(offer.sdp))
    }

    async fn create_answer(&self) -> Result<SessionDescription, PeerError> {
        let answer = self.pc.create_answer(None).await.map_err(negotiation)?;
        self.pc
            .set_local_description(answer.clone())
            .await
            .map_err(negotiation)?;
        Ok(SessionDescription::answer(answer.sdp))
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), PeerError> {
        let rtc = match desc.kind {
            SdpKind::Offer => RTCSessionDescription::offer(desc.sdp),
            SdpKind::Answer => RTCSessionDescription::answer(desc.sdp),
        }
        .map_err(negotiation)?;
        self.pc.set_remote_description(rtc).await.map_err(negotiation)
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), PeerError> {
        self.pc
            .add_ice_candidate(RTCIceCandidateInit {
                candidate: candidate.candidate,
                sdp_mid: candidate.sdp_mid,
                sdp_mline_index: candidate.sdp_mline_index,
                username_fragment: candidate.username_fragment,
            })
            .await
            .map_err(|e| PeerError::Candidate(e.to_string()))
    }

    fn signaling_state(&self) -> SignalingState {
        match self.pc.signaling_state() {
            RTCSignalingState::Stable => SignalingState::Stable,
            RTCSignalingState::HaveLocalOffer => SignalingState::HaveLocalOffer,
            RTCSignalingState::HaveRemoteOffer => SignalingState::HaveRemoteOffer,
            RTCSignalingState::Closed => SignalingState::Closed,
            _ => SignalingState::Other,
        }
    }

    /// Per-kind packet counters for quality classification.
    ///
    /// webrtc-rs does not report loss on inbound streams, so the lost count
    /// comes from the remote peer's receiver reports, which describe loss on
    /// our outbound stream of the same kind. The resulting ratio pairs that
    /// with our inbound `packets_received`: two directions of one path, used
    /// as an estimate of how lossy the path is.
    async fn stats(&self) -> Result<TransportStats, PeerError> {
        let report = self.pc.get_stats().await;
        let mut per_kind: BTreeMap<String, InboundRtpSample> = BTreeMap::new();
        for stat in report.reports.values() {
            match stat {
                StatsReportType::InboundRTP(inbound) => {
                    let entry = per_kind.entry(inbound.kind.to_string()).or_default();
                    entry.packets_received += inbound.packets_received;
                }
                StatsReportType::RemoteInboundRTP(remote) => {
                    let entry = per_kind.entry(remote.kind.to_string()).or_default();
                    entry.packets_lost += u64::try_from(remote.packets_lost).unwrap_or(0);
                }
                _ => {}
            }
        }
        Ok(transport_stats(per_kind))
    }

    async fn close(&self) -> Result<(), PeerError> {
        self.pc
            .close()
            .await
            .map_err(|e| PeerError::Negotiation(e.to_string()))
    }
}

static TRACK_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Local track fed with encoded samples by the application
#[derive(Debug)]
pub struct SampleTrack {
    id: String,
    kind: TrackKind,
    facing: Option<CameraFacing>,
    rtc: Arc<TrackLocalStaticSample>,
    enabled: AtomicBool,
    live: AtomicBool,
}

impl SampleTrack {
    /// Opus audio track
    #[must_use]
    pub fn audio() -> Arc<Self> {
        Self::build(TrackKind::Audio, MIME_TYPE_OPUS, None)
    }

    /// VP8 video track for a camera
    #[must_use]
    pub fn video(facing: CameraFacing) -> Arc<Self> {
        Self::build(TrackKind::Video, MIME_TYPE_VP8, Some(facing))
    }

    fn build(kind: TrackKind, mime_type: &str, facing: Option<CameraFacing>) -> Arc<Self> {
        let n = TRACK_COUNTER.fetch_add(1, Ordering::Relaxed);
        let id = match kind {
            TrackKind::Audio => format!("audio-{n}"),
            TrackKind::Video => format!("video-{n}"),
        };
        let rtc = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: mime_type.to_owned(),
                ..Default::default()
            },
            id.clone(),
            STREAM_ID.to_owned(),
        ));
        Arc::new(Self {
            id,
            kind,
            facing,
            rtc,
            enabled: AtomicBool::new(true),
            live: AtomicBool::new(true),
        })
    }

    /// Write one encoded frame. Muted or stopped tracks drop it.
    ///
    /// Returns whether the frame was sent.
    ///
    /// # Errors
    ///
    /// Returns error if the packetizer rejects the frame
    pub async fn write_sample(&self, data: Vec<u8>, duration: Duration) -> Result<bool, MediaError> {
        if !self.is_live() || !self.is_enabled() {
            return Ok(false);
        }
        self.rtc
            .write_sample(&Sample {
                data: data.into(),
                duration,
                ..Default::default()
            })
            .await
            .map_err(|e| MediaError::Platform(e.to_string()))?;
        Ok(true)
    }
}

impl LocalTrack for SampleTrack {
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

/// Capture stack that hands out [`SampleTrack`]s
#[derive(Debug, Default)]
pub struct SampleMediaDevices {
    issued: Mutex<Vec<Weak<SampleTrack>>>,
    route: Mutex<Option<AudioRoute>>,
}

impl SampleMediaDevices {
    /// Create an empty device set
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Tracks handed out and not yet stopped, for the capture pipeline
    pub fn live_tracks(&self) -> Vec<Arc<SampleTrack>> {
        let mut issued = self.issued.lock();
        issued.retain(|weak| weak.upgrade().is_some_and(|t| t.is_live()));
        issued.iter().filter_map(Weak::upgrade).collect()
    }

    /// Last route selected
    pub fn audio_route(&self) -> Option<AudioRoute> {
        *self.route.lock()
    }
}

#[async_trait]
impl MediaDevices for SampleMediaDevices {
    async fn get_user_media(
        &self,
        request: MediaRequest,
    ) -> Result<Vec<Arc<dyn LocalTrack>>, MediaError> {
        let mut created = Vec::new();
        if request.audio.is_some() {
            created.push(SampleTrack::audio());
        }
        if let Some(facing) = request.video {
            created.push(SampleTrack::video(facing));
        }

        self.issued
            .lock()
            .extend(created.iter().map(Arc::downgrade));
        tracing::debug!(tracks = created.len(), "Sample tracks issued");
        Ok(created
            .into_iter()
            .map(|t| t as Arc<dyn LocalTrack>)
            .collect())
    }

    async fn set_audio_route(&self, route: AudioRoute) -> Result<(), MediaError> {
        *self.route.lock() = Some(route);
        Ok(())
    }
}
