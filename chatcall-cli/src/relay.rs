//! In-process signaling relay
//!
//! Stands in for the chat server's relay: every endpoint registers under a
//! peer id and messages are carried as JSON text, the way the real relay
//! frames them.

use async_trait::async_trait;
use chatcall_core::signaling::{SignalingMessage, SignalingTransport};
use chatcall_core::PeerId;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

/// Relay errors
#[derive(Error, Debug)]
pub enum RelayError {
    /// Nobody registered under that id
    #[error("Unknown peer: {0}")]
    UnknownPeer(PeerId),

    /// The endpoint was dropped
    #[error("Relay closed")]
    Closed,

    /// Frame could not be encoded or decoded
    #[error("Codec error: {0}")]
    Codec(#[from] serde_json::Error),
}

type Frame = (PeerId, String);

/// Routes frames between registered endpoints
#[derive(Default, Clone)]
pub struct MemoryRelay {
    routes: Arc<Mutex<HashMap<PeerId, mpsc::UnboundedSender<Frame>>>>,
}

impl MemoryRelay {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `peer` and return its transport
    pub fn endpoint(&self, peer: PeerId) -> Arc<RelayEndpoint> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.routes.lock().insert(peer.clone(), tx);
        Arc::new(RelayEndpoint {
            peer,
            relay: self.clone(),
            inbox: tokio::sync::Mutex::new(rx),
        })
    }

    fn route(&self, from: &PeerId, to: &PeerId, frame: String) -> Result<(), RelayError> {
        let routes = self.routes.lock();
        let tx = routes
            .get(to)
            .ok_or_else(|| RelayError::UnknownPeer(to.clone()))?;
        tx.send((from.clone(), frame))
            .map_err(|_| RelayError::Closed)
    }
}

/// One peer's connection to the relay
pub struct RelayEndpoint {
    peer: PeerId,
    relay: MemoryRelay,
    inbox: tokio::sync::Mutex<mpsc::UnboundedReceiver<Frame>>,
}

#[async_trait]
impl SignalingTransport for RelayEndpoint {
    type Error = RelayError;

    async fn send_message(
        &self,
        peer: &PeerId,
        message: SignalingMessage,
    ) -> Result<(), Self::Error> {
        let frame = serde_json::to_string(&message)?;
        tracing::trace!(from = %self.peer, to = %peer, %frame, "Relaying frame");
        self.relay.route(&self.peer, peer, frame)
    }

    async fn receive_message(&self) -> Result<(PeerId, SignalingMessage), Self::Error> {
        let (from, frame) = self
            .inbox
            .lock()
            .await
            .recv()
            .await
            .ok_or(RelayError::Closed)?;
        Ok((from, serde_json::from_str(&frame)?))
    }
}
