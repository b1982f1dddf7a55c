//! Local media acquisition and remote media routing
//!
//! The platform capture stack sits behind the [`MediaDevices`] trait. A
//! [`MediaStreamHandle`] owns the tracks of one acquisition and stops them
//! when the call is torn down. [`MediaSinks`] holds whatever the UI renders:
//! the local preview and the remote audio/video outputs.

use crate::types::{CallType, CameraFacing};
use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::sync::Arc;
use thiserror::Error;

/// Media-related errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MediaError {
    /// User or OS refused access
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// No matching device, or device busy
    #[error("Device unavailable: {0}")]
    DeviceUnavailable(String),

    /// Any other capture stack failure
    #[error("Media platform error: {0}")]
    Platform(String),
}

/// Media kind of a track
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackKind {
    /// Audio track
    Audio,
    /// Video track
    Video,
}

/// A captured local track
pub trait LocalTrack: Send + Sync + std::fmt::Debug {
    /// Track identifier
    fn id(&self) -> &str;

    /// Audio or video
    fn kind(&self) -> TrackKind;

    /// Camera this track comes from, `None` for audio
    fn facing(&self) -> Option<CameraFacing>;

    /// Mute or unmute without releasing the device
    fn set_enabled(&self, enabled: bool);

    /// Whether the track is currently sending
    fn is_enabled(&self) -> bool;

    /// Release the device. Idempotent.
    fn stop(&self);

    /// False once stopped
    fn is_live(&self) -> bool;

    /// Downcast hook for backends that need their concrete track type
    fn as_any(&self) -> &dyn Any;
}

/// Audio processing constraints for the microphone
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioConstraints {
    /// Echo cancellation
    pub echo_cancellation: bool,
    /// Noise suppression
    pub noise_suppression: bool,
    /// Automatic gain control
    pub auto_gain_control: bool,
}

impl Default for AudioConstraints {
    fn default() -> Self {
        Self {
            echo_cancellation: true,
            noise_suppression: true,
            auto_gain_control: true,
        }
    }
}

/// What to capture
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaRequest {
    /// Microphone constraints, `None` for no audio
    pub audio: Option<AudioConstraints>,
    /// Camera to open, `None` for no video
    pub video: Option<CameraFacing>,
}

impl MediaRequest {
    /// Request for a call: audio always, video only for video calls
    pub fn for_call(call_type: CallType, facing: CameraFacing) -> Self {
        Self {
            audio: Some(AudioConstraints::default()),
            video: call_type.has_video().then_some(facing),
        }
    }

    /// Request for a single camera track
    pub fn camera(facing: CameraFacing) -> Self {
        Self {
            audio: None,
            video: Some(facing),
        }
    }
}

/// Audio output route
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AudioRoute {
    /// Loudspeaker
    Speaker,
    /// Earpiece
    Earpiece,
}

impl AudioRoute {
    /// Route for a speaker flag
    pub fn from_speaker(enabled: bool) -> Self {
        if enabled {
            Self::Speaker
        } else {
            Self::Earpiece
        }
    }

    /// Playback gain for the remote audio sink on this route
    pub fn volume(&self) -> f32 {
        match self {
            Self::Speaker => 1.0,
            Self::Earpiece => 0.7,
        }
    }
}

/// Platform capture stack
#[async_trait]
pub trait MediaDevices: Send + Sync {
    /// Open the devices in `request` and return their tracks
    async fn get_user_media(
        &self,
        request: MediaRequest,
    ) -> Result<Vec<Arc<dyn LocalTrack>>, MediaError>;

    /// Select the audio output route
    async fn set_audio_route(&self, route: AudioRoute) -> Result<(), MediaError> {
        Err(MediaError::Platform(format!("cannot route audio to {route:?}")))
    }
}

/// Tracks from one acquisition
#[derive(Debug, Clone, Default)]
pub struct MediaStreamHandle {
    tracks: Vec<Arc<dyn LocalTrack>>,
}

impl MediaStreamHandle {
    /// Wrap acquired tracks
    pub fn new(tracks: Vec<Arc<dyn LocalTrack>>) -> Self {
        Self { tracks }
    }

    /// All tracks
    pub fn tracks(&self) -> &[Arc<dyn LocalTrack>] {
        &self.tracks
    }

    /// First audio track
    pub fn audio_track(&self) -> Option<Arc<dyn LocalTrack>> {
        self.track_of(TrackKind::Audio)
    }

    /// First video track
    pub fn video_track(&self) -> Option<Arc<dyn LocalTrack>> {
        self.track_of(TrackKind::Video)
    }

    fn track_of(&self, kind: TrackKind) -> Option<Arc<dyn LocalTrack>> {
        self.tracks.iter().find(|t| t.kind() == kind).cloned()
    }

    /// Swap the track of the same kind, returning the old one
    pub fn replace_track(&mut self, track: Arc<dyn LocalTrack>) -> Option<Arc<dyn LocalTrack>> {
        let kind = track.kind();
        match self.tracks.iter().position(|t| t.kind() == kind) {
            Some(idx) => Some(std::mem::replace(&mut self.tracks[idx], track)),
            None => {
                self.tracks.push(track);
                None
            }
        }
    }

    /// Stop every track
    pub fn stop_all(&self) {
        for track in &self.tracks {
            track.stop();
        }
    }
}

/// Acquires local media for calls
pub struct MediaAcquirer {
    devices: Arc<dyn MediaDevices>,
}

impl MediaAcquirer {
    /// Create an acquirer over a capture stack
    pub fn new(devices: Arc<dyn MediaDevices>) -> Self {
        Self { devices }
    }

    /// Capture the tracks a call needs
    #[tracing::instrument(skip(self))]
    pub async fn acquire(
        &self,
        call_type: CallType,
        facing: CameraFacing,
    ) -> Result<MediaStreamHandle, MediaError> {
        let request = MediaRequest::for_call(call_type, facing);
        let tracks = self.devices.get_user_media(request).await?;

        let handle = MediaStreamHandle::new(tracks);
        if handle.audio_track().is_none() {
            handle.stop_all();
            return Err(MediaError::DeviceUnavailable("no microphone track".into()));
        }
        if call_type.has_video() && handle.video_track().is_none() {
            handle.stop_all();
            return Err(MediaError::DeviceUnavailable("no camera track".into()));
        }

        tracing::debug!(tracks = handle.tracks().len(), "local media acquired");
        Ok(handle)
    }

    /// Capture a single camera track
    #[tracing::instrument(skip(self))]
    pub async fn acquire_camera(
        &self,
        facing: CameraFacing,
    ) -> Result<Arc<dyn LocalTrack>, MediaError> {
        let tracks = self.devices.get_user_media(MediaRequest::camera(facing)).await?;
        let mut video = None;
        for track in tracks {
            if video.is_none() && track.kind() == TrackKind::Video {
                video = Some(track);
            } else {
                track.stop();
            }
        }
        video.ok_or_else(|| MediaError::DeviceUnavailable(format!("no {facing:?} camera")))
    }

    /// Select the audio output route
    pub async fn set_audio_route(&self, route: AudioRoute) -> Result<(), MediaError> {
        self.devices.set_audio_route(route).await
    }
}

/// Incoming track from the remote peer
#[derive(Clone)]
pub struct RemoteTrack {
    /// Track identifier
    pub id: String,
    /// Audio or video
    pub kind: TrackKind,
    /// Backend-specific handle to render from
    pub handle: Option<Arc<dyn Any + Send + Sync>>,
}

impl std::fmt::Debug for RemoteTrack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteTrack")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("has_handle", &self.handle.is_some())
            .finish()
    }
}

#[derive(Debug, Default)]
struct SinkSlots {
    local_preview: Option<Arc<dyn LocalTrack>>,
    remote_video: Option<RemoteTrack>,
    remote_audio: Option<RemoteTrack>,
    audio_route: Option<AudioRoute>,
    output_gain: Option<f32>,
}

/// Render targets for the UI
#[derive(Debug, Default)]
pub struct MediaSinks {
    slots: RwLock<SinkSlots>,
}

impl MediaSinks {
    /// Empty sinks
    pub fn new() -> Self {
        Self::default()
    }

    /// Show a local camera track in the preview
    pub fn set_local_preview(&self, track: Option<Arc<dyn LocalTrack>>) {
        self.slots.write().local_preview = track;
    }

    /// Current preview track
    pub fn local_preview(&self) -> Option<Arc<dyn LocalTrack>> {
        self.slots.read().local_preview.clone()
    }

    /// Route a remote track to its sink by kind
    pub fn attach_remote(&self, track: RemoteTrack) {
        let mut slots = self.slots.write();
        match track.kind {
            TrackKind::Video => slots.remote_video = Some(track),
            TrackKind::Audio => slots.remote_audio = Some(track),
        }
    }

    /// Remote video sink
    pub fn remote_video(&self) -> Option<RemoteTrack> {
        self.slots.read().remote_video.clone()
    }

    /// Remote audio sink
    pub fn remote_audio(&self) -> Option<RemoteTrack> {
        self.slots.read().remote_audio.clone()
    }

    /// Route remote audio to `route` at `gain`
    pub fn set_audio_output(&self, route: AudioRoute, gain: f32) {
        let mut slots = self.slots.write();
        slots.audio_route = Some(route);
        slots.output_gain = Some(gain);
    }

    /// Current audio output route
    pub fn audio_route(&self) -> Option<AudioRoute> {
        self.slots.read().audio_route
    }

    /// Current playback gain of the remote audio sink
    pub fn output_gain(&self) -> Option<f32> {
        self.slots.read().output_gain
    }

    /// Detach everything
    pub fn clear(&self) {
        *self.slots.write() = SinkSlots::default();
    }
}
