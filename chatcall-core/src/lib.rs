//! Chatcall - peer-to-peer audio/video calls for anonymous chat sessions
//!
//! Two strangers paired in a text chat can escalate to a call. The crate
//! negotiates the connection through the chat's signaling relay and keeps it
//! alive afterwards:
//!
//! - **Offer/answer negotiation** with a ring timeout for incoming calls
//! - **Trickle ICE** with candidates held until the remote description lands
//! - **Reconnection** driven by the initiator with a bounded number of attempts
//! - **Quality monitoring** from inbound packet loss
//! - **Generation-tagged cancellation**: late results of a superseded attempt
//!   never touch the current call
//!
//! The WebRTC stack and the capture devices sit behind traits
//! ([`RtcPeer`], [`PeerConnectionFactory`], [`MediaDevices`]); the
//! `webrtc-backend` feature binds them to webrtc-rs.
//!
//! # Examples
//!
//! ```rust,no_run
//! use chatcall_core::prelude::*;
//! use std::sync::Arc;
//!
//! # async fn example<T: SignalingTransport>(transport: Arc<T>) -> Result<(), CallError> {
//! let manager = CallManager::builder(transport, PeerId::new("me")).build()?;
//! manager.start()?;
//!
//! manager.set_remote_peer(Some(PeerId::new("stranger"))).await;
//! let mut events = manager.subscribe_events();
//! manager.start_call(CallType::Video).await?;
//!
//! while let Ok(event) = events.recv().await {
//!     if let CallEvent::CallEnded { reason, .. } = event {
//!         println!("call ended: {reason:?}");
//!         break;
//!     }
//! }
//! # Ok(())
//! # }
//! ```

#![deny(missing_docs)]
#![deny(unsafe_code)]
#![deny(clippy::panic)]
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![warn(clippy::all)]
#![allow(clippy::pedantic)]
#![allow(clippy::nursery)]
#![allow(clippy::unused_async)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::derivable_impls)]

/// Core call types and events
pub mod types;

/// Local capture, remote tracks and audio routing
pub mod media;

/// Remote ICE candidate buffering
pub mod candidates;

/// Peer connection abstraction
pub mod peer;

/// Packet-loss quality monitoring
pub mod quality;

/// Signaling protocol and bridge
pub mod signaling;

/// Call session state machine
pub mod call;

/// webrtc-rs bindings (requires webrtc-backend feature)
#[cfg(feature = "webrtc-backend")]
pub mod webrtc_backend;

// Re-export main types at crate root
pub use call::{CallError, CallManager, CallManagerBuilder, CallManagerConfig, DEFAULT_STUN_SERVERS};
pub use candidates::CandidateQueue;
pub use media::{
    AudioRoute, LocalTrack, MediaAcquirer, MediaDevices, MediaError, MediaRequest, MediaSinks,
    MediaStreamHandle, RemoteTrack, TrackKind,
};
pub use peer::{
    IceServer, PeerConfig, PeerConnectionFactory, PeerConnectionState, PeerError, PeerEvent,
    PeerEventSink, PeerSession, RtcPeer, SenderId, SignalingState,
};
pub use quality::{classify, QualityMonitor, QualitySample, StatsSource, TransportStats};
pub use signaling::{
    SignalingBridge, SignalingError, SignalingMessage, SignalingSubscriber, SignalingTransport,
};
pub use types::*;
#[cfg(feature = "webrtc-backend")]
pub use webrtc_backend::{SampleMediaDevices, SampleTrack, WebRtcPeerFactory};

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::call::{CallError, CallManager, CallManagerBuilder, CallManagerConfig};
    pub use crate::media::{LocalTrack, MediaDevices, MediaSinks, TrackKind};
    pub use crate::peer::PeerConnectionFactory;
    pub use crate::signaling::{SignalingMessage, SignalingTransport};
    pub use crate::types::{
        CallEvent, CallFailure, CallId, CallState, CallType, EndReason, PeerId, QualityClass,
    };
    #[cfg(feature = "webrtc-backend")]
    pub use crate::webrtc_backend::{SampleMediaDevices, WebRtcPeerFactory};
}
