//! Call types and data structures

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier for a call session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CallId(pub Uuid);

impl CallId {
    /// Create a new random call ID
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for CallId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for CallId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identity of a chat participant as known to the relay
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PeerId(pub String);

impl PeerId {
    /// Create a new peer identity
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    /// Get the inner string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for PeerId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for PeerId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Identifier of one call attempt.
///
/// Every offer or answer negotiation gets a fresh generation. Async work
/// captures the generation it started under and discards its result when
/// the controller has moved on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Generation(pub u64);

impl std::fmt::Display for Generation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "g{}", self.0)
    }
}

/// Kind of call requested by the user
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallType {
    /// Microphone only
    Audio,
    /// Camera and microphone
    Video,
}

impl CallType {
    /// Whether this call carries an outgoing video track
    pub fn has_video(&self) -> bool {
        matches!(self, Self::Video)
    }
}

impl std::fmt::Display for CallType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Audio => write!(f, "audio"),
            Self::Video => write!(f, "video"),
        }
    }
}

/// Which side of the negotiation this endpoint plays.
///
/// Fixed at session creation. Only the initiator re-offers when the
/// connection drops.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallRole {
    /// Sent the offer
    Initiator,
    /// Answered the offer
    Responder,
}

/// Call lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CallState {
    /// No call
    Idle,
    /// Local user is calling, offer not yet on the wire
    RingingOutgoing,
    /// Remote offer received, waiting for the local user
    RingingIncoming,
    /// Negotiation in progress
    Connecting,
    /// Media is flowing
    Active,
    /// Connection dropped, recovery in progress
    Reconnecting,
    /// Session torn down
    Ended,
}

impl CallState {
    /// Whether a session in this state blocks a new call
    pub fn is_busy(&self) -> bool {
        !matches!(self, Self::Idle | Self::Ended)
    }
}

/// Which physical camera feeds the outgoing video track
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CameraFacing {
    /// User-facing camera
    Front,
    /// Environment-facing camera
    Back,
}

impl CameraFacing {
    /// The other camera
    pub fn opposite(self) -> Self {
        match self {
            Self::Front => Self::Back,
            Self::Back => Self::Front,
        }
    }
}

impl Default for CameraFacing {
    fn default() -> Self {
        Self::Front
    }
}

/// Advisory call quality derived from inbound packet loss
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QualityClass {
    /// Loss at or below 5%
    Good,
    /// Loss above 5%
    Fair,
    /// Loss above 10%
    Poor,
}

impl Default for QualityClass {
    fn default() -> Self {
        Self::Good
    }
}

/// Whether each local track is currently sending.
///
/// Independent of track liveness: a disabled track stays allocated but muted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalMediaState {
    /// Camera track enabled
    pub video: bool,
    /// Microphone track enabled
    pub audio: bool,
}

impl Default for LocalMediaState {
    fn default() -> Self {
        Self {
            video: true,
            audio: true,
        }
    }
}

/// SDP type of a session descriptor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    /// Offer
    Offer,
    /// Answer
    Answer,
}

/// Session descriptor as exchanged over signaling
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    /// Offer or answer
    #[serde(rename = "type")]
    pub kind: SdpKind,
    /// SDP body
    pub sdp: String,
}

impl SessionDescription {
    /// Build an offer descriptor
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Offer,
            sdp: sdp.into(),
        }
    }

    /// Build an answer descriptor
    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Answer,
            sdp: sdp.into(),
        }
    }
}

/// Trickled ICE candidate
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    /// Candidate line
    pub candidate: String,
    /// SDP media ID
    #[serde(default)]
    pub sdp_mid: Option<String>,
    /// SDP media line index
    #[serde(default, rename = "sdpMLineIndex")]
    pub sdp_mline_index: Option<u16>,
    /// ICE username fragment
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username_fragment: Option<String>,
}

impl IceCandidate {
    /// Candidate with only the candidate line set
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: None,
            sdp_mline_index: None,
            username_fragment: None,
        }
    }
}

/// Call proposal received while idle.
///
/// Lives only until the user accepts, rejects, or the ring timer fires.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IncomingCallOffer {
    /// Requested call type
    pub call_type: CallType,
    /// Who is calling
    pub from_peer: PeerId,
    /// Remote offer
    pub session_descriptor: SessionDescription,
    /// When the offer arrived
    pub received_at: DateTime<Utc>,
}

/// Why a call session ended
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EndReason {
    /// Local user hung up
    LocalHangup,
    /// Remote peer hung up or cancelled
    RemoteHangup,
    /// Local user declined the incoming call
    Rejected,
    /// Incoming call was not answered in time
    Unanswered,
    /// Camera or microphone could not be acquired
    MediaFailure,
    /// Negotiation could not be completed
    NegotiationFailed,
    /// Reconnection gave up
    ReconnectExhausted,
    /// Relay reported a failure
    RemoteFailure,
    /// Chat partner changed or left
    PartnerChanged,
}

/// Failure surfaced to the user as a dismissible notice
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CallFailure {
    /// Camera or microphone access was refused
    PermissionDenied,
    /// Requested device does not exist or is busy
    DeviceUnavailable,
    /// Media stack failed for another reason
    MediaPlatform(String),
    /// Incoming call was not answered in time
    SignalingTimeout,
    /// Connection could not be recovered
    ReconnectExhausted,
    /// Relay reported the call as failed
    RemoteFailure(String),
    /// Offer/answer could not be created or applied
    NegotiationFailed(String),
}

/// Snapshot of every observable call session field
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallSnapshot {
    /// Call identifier
    pub call_id: CallId,
    /// Audio or video
    pub call_type: CallType,
    /// Initiator or responder
    pub role: CallRole,
    /// Lifecycle state
    pub state: CallState,
    /// Counterpart of this call
    pub remote_peer: PeerId,
    /// Local track enable flags
    pub local_media: LocalMediaState,
    /// Loudspeaker output selected
    pub speaker_enabled: bool,
    /// Active camera
    pub camera_facing: CameraFacing,
    /// Advisory quality
    pub quality: QualityClass,
    /// Connection failures since the last successful connect
    pub reconnect_attempts: u32,
    /// When the session was created
    pub created_at: DateTime<Utc>,
    /// When the connection first became active
    pub started_at: Option<DateTime<Utc>>,
}

impl CallSnapshot {
    /// Time spent in the call since it first became active
    pub fn duration(&self) -> Option<chrono::Duration> {
        self.started_at.map(|start| Utc::now() - start)
    }

    /// Duration as `mm:ss`, `00:00` before the call is active
    pub fn formatted_duration(&self) -> String {
        format_duration(self.duration().map_or(0, |d| d.num_seconds()))
    }
}

/// Format seconds as `mm:ss`
pub fn format_duration(seconds: i64) -> String {
    let seconds = seconds.max(0);
    format!("{:02}:{:02}", seconds / 60, seconds % 60)
}

/// Call event for UI and chat-layer notifications
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum CallEvent {
    /// Lifecycle state changed
    StateChanged {
        /// Call identifier
        call_id: CallId,
        /// New state
        state: CallState,
    },
    /// A call offer is waiting for accept/reject
    IncomingCall {
        /// Call identifier
        call_id: CallId,
        /// Requested call type
        call_type: CallType,
        /// Who is calling
        from_peer: PeerId,
        /// Label to show for the caller
        caller_name: String,
    },
    /// Session torn down
    CallEnded {
        /// Call identifier
        call_id: CallId,
        /// Why it ended
        reason: EndReason,
        /// Seconds spent active, if it ever was
        duration_secs: Option<i64>,
    },
    /// A remote track was routed to its sink
    RemoteTrackAttached {
        /// Call identifier
        call_id: CallId,
        /// Audio or video
        kind: crate::media::TrackKind,
    },
    /// A local track was muted or unmuted
    MediaToggled {
        /// Call identifier
        call_id: CallId,
        /// Current enable flags
        local_media: LocalMediaState,
    },
    /// Audio output switched
    SpeakerChanged {
        /// Call identifier
        call_id: CallId,
        /// Loudspeaker selected
        speaker_enabled: bool,
    },
    /// Outgoing camera switched
    CameraSwitched {
        /// Call identifier
        call_id: CallId,
        /// Camera now in use
        facing: CameraFacing,
    },
    /// Quality classification changed
    QualityChanged {
        /// Call identifier
        call_id: CallId,
        /// New class
        quality: QualityClass,
        /// Inbound loss ratio that produced it
        loss_ratio: f64,
    },
    /// User-visible failure
    Failure {
        /// Call identifier
        call_id: CallId,
        /// What went wrong
        failure: CallFailure,
    },
    /// Advisory notice relayed by the server
    Notice {
        /// Human-readable message
        message: String,
    },
}
