//! Peer connection abstraction
//!
//! [`RtcPeer`] is the seam between the call state machine and the WebRTC
//! stack. [`PeerSession`] wraps one connection together with its remote
//! candidate queue so that description application and candidate flushing
//! happen under a single lock.

use crate::candidates::CandidateQueue;
use crate::media::{LocalTrack, MediaStreamHandle, RemoteTrack, TrackKind};
use crate::quality::TransportStats;
use crate::types::{CallRole, IceCandidate, PeerId, SessionDescription};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

/// Peer connection errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PeerError {
    /// Connection could not be created
    #[error("Peer connection creation failed: {0}")]
    Create(String),

    /// Offer or answer could not be produced or applied
    #[error("Negotiation failed: {0}")]
    Negotiation(String),

    /// Candidate was rejected
    #[error("ICE candidate rejected: {0}")]
    Candidate(String),

    /// Track could not be added or replaced
    #[error("Track error: {0}")]
    Track(String),

    /// Statistics unavailable
    #[error("Stats error: {0}")]
    Stats(String),

    /// Connection already closed
    #[error("Peer connection closed")]
    Closed,
}

/// Offer/answer state of a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SignalingState {
    /// No negotiation in flight
    Stable,
    /// Local offer applied, waiting for the answer
    HaveLocalOffer,
    /// Remote offer applied, answer not yet created
    HaveRemoteOffer,
    /// Connection closed
    Closed,
    /// Provisional answer states
    Other,
}

/// Transport-level connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PeerConnectionState {
    /// Not started
    New,
    /// ICE/DTLS in progress
    Connecting,
    /// Media path up
    Connected,
    /// Path lost, may recover
    Disconnected,
    /// Path lost for good
    Failed,
    /// Closed locally
    Closed,
}

/// Callback event raised by a connection
#[derive(Debug, Clone)]
pub enum PeerEvent {
    /// A local candidate was gathered
    LocalCandidate(IceCandidate),
    /// A remote track arrived
    RemoteTrack(RemoteTrack),
    /// Connection state changed
    ConnectionState(PeerConnectionState),
}

/// Receives connection callbacks
pub type PeerEventSink = Arc<dyn Fn(PeerEvent) + Send + Sync>;

/// Handle to an outgoing track sender
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SenderId(pub usize);

/// A single WebRTC peer connection
#[async_trait]
pub trait RtcPeer: Send + Sync {
    /// Add an outgoing track
    async fn add_track(&self, track: Arc<dyn LocalTrack>) -> Result<SenderId, PeerError>;

    /// Swap the track behind a sender without renegotiating
    async fn replace_track(
        &self,
        sender: SenderId,
        track: Arc<dyn LocalTrack>,
    ) -> Result<(), PeerError>;

    /// Create an offer and apply it as the local description
    async fn create_offer(&self) -> Result<SessionDescription, PeerError>;

    /// Create an answer and apply it as the local description
    async fn create_answer(&self) -> Result<SessionDescription, PeerError>;

    /// Apply the remote description
    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), PeerError>;

    /// Apply a remote candidate
    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), PeerError>;

    /// Current offer/answer state
    fn signaling_state(&self) -> SignalingState;

    /// Inbound transport counters
    async fn stats(&self) -> Result<TransportStats, PeerError>;

    /// Close the connection
    async fn close(&self) -> Result<(), PeerError>;
}

/// ICE server entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServer {
    /// Server URLs
    pub urls: Vec<String>,
    /// TURN username
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    /// TURN credential
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

impl IceServer {
    /// STUN server without credentials
    pub fn stun(url: impl Into<String>) -> Self {
        Self {
            urls: vec![url.into()],
            username: None,
            credential: None,
        }
    }
}

/// Connection parameters for one call attempt
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerConfig {
    /// ICE servers
    pub ice_servers: Vec<IceServer>,
    /// Local role in this attempt
    pub role: CallRole,
    /// Counterpart
    pub remote_peer: PeerId,
}

/// Creates peer connections
#[async_trait]
pub trait PeerConnectionFactory: Send + Sync {
    /// Create a connection that reports callbacks to `events`
    async fn create(
        &self,
        config: &PeerConfig,
        events: PeerEventSink,
    ) -> Result<Arc<dyn RtcPeer>, PeerError>;
}

/// What happened to an inbound candidate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CandidateDisposition {
    /// Held until the remote description is applied
    Queued,
    /// Applied to the connection
    Applied,
}

/// One peer connection plus its candidate queue and senders
pub struct PeerSession {
    peer: Arc<dyn RtcPeer>,
    queue: tokio::sync::Mutex<CandidateQueue>,
    senders: parking_lot::Mutex<HashMap<TrackKind, SenderId>>,
}

impl std::fmt::Debug for PeerSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerSession")
            .field("signaling_state", &self.peer.signaling_state())
            .finish()
    }
}

impl PeerSession {
    /// Wrap a freshly created connection, seeding its queue with
    /// candidates that arrived before it existed
    pub fn from_peer(peer: Arc<dyn RtcPeer>, early_candidates: Vec<IceCandidate>) -> Self {
        Self {
            peer,
            queue: tokio::sync::Mutex::new(CandidateQueue::with_pending(early_candidates)),
            senders: parking_lot::Mutex::new(HashMap::new()),
        }
    }

    /// Add every track of the stream as an outgoing track
    pub async fn attach_local_tracks(&self, stream: &MediaStreamHandle) -> Result<(), PeerError> {
        for track in stream.tracks() {
            let kind = track.kind();
            let sender = self.peer.add_track(Arc::clone(track)).await?;
            self.senders.lock().insert(kind, sender);
        }
        Ok(())
    }

    /// Create and apply a local offer
    pub async fn create_offer(&self) -> Result<SessionDescription, PeerError> {
        self.peer.create_offer().await
    }

    /// Create and apply a local answer
    pub async fn create_answer(&self) -> Result<SessionDescription, PeerError> {
        self.peer.create_answer().await
    }

    /// Apply the remote description, then flush queued candidates.
    ///
    /// Returns how many queued candidates were accepted.
    pub async fn set_remote_description(&self, desc: SessionDescription) -> Result<usize, PeerError> {
        let mut queue = self.queue.lock().await;
        self.peer.set_remote_description(desc).await?;
        queue.mark_remote_description_set();
        tracing::debug!(queued = queue.len(), "Remote description applied, flushing candidates");
        Ok(queue.flush(self.peer.as_ref()).await)
    }

    /// Apply a remote candidate, or queue it if no remote description yet
    pub async fn add_remote_candidate(
        &self,
        candidate: IceCandidate,
    ) -> Result<CandidateDisposition, PeerError> {
        let mut queue = self.queue.lock().await;
        if !queue.is_flushable() {
            queue.enqueue(candidate);
            return Ok(CandidateDisposition::Queued);
        }
        self.peer.add_ice_candidate(candidate).await?;
        Ok(CandidateDisposition::Applied)
    }

    /// Current offer/answer state
    pub fn signaling_state(&self) -> SignalingState {
        self.peer.signaling_state()
    }

    /// Swap the outgoing track of the same kind
    pub async fn replace_outgoing_track(&self, track: Arc<dyn LocalTrack>) -> Result<(), PeerError> {
        let kind = track.kind();
        let sender = self.senders.lock().get(&kind).copied();
        match sender {
            Some(sender) => self.peer.replace_track(sender, track).await,
            None => Err(PeerError::Track(format!("no {kind:?} sender"))),
        }
    }

    /// Inbound transport counters
    pub async fn stats(&self) -> Result<TransportStats, PeerError> {
        self.peer.stats().await
    }

    /// Close the connection and drop queued candidates
    pub async fn close(&self) {
        self.queue.lock().await.clear();
        if let Err(e) = self.peer.close().await {
            tracing::debug!(error = %e, "peer close failed");
        }
    }
}
