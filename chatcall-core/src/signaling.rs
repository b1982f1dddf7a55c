//! Call signaling protocol
//!
//! Wire messages exchanged with the counterpart through the relay, the
//! transport seam that carries them, and the bridge that guards outbound
//! offers/answers and routes inbound messages to the call controller.

use crate::peer::{CandidateDisposition, PeerError, PeerSession, SignalingState};
use crate::types::{CallType, Generation, IceCandidate, PeerId, SdpKind, SessionDescription};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::sleep;

/// Signaling errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SignalingError {
    /// A subscriber is already registered
    #[error("Signaling subscriber already registered")]
    AlreadySubscribed,

    /// Offer already sent for this attempt
    #[error("Offer already sent for attempt {0}")]
    DuplicateOffer(Generation),

    /// Answer already sent for this attempt
    #[error("Answer already sent for attempt {0}")]
    DuplicateAnswer(Generation),

    /// Attempt is no longer current
    #[error("Attempt {0} is no longer current")]
    StaleAttempt(Generation),

    /// Transport error
    #[error("Transport error: {0}")]
    Transport(String),

    /// Malformed or out-of-place message
    #[error("Invalid message: {0}")]
    InvalidMessage(String),
}

/// Signaling message types
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type")]
pub enum SignalingMessage {
    /// Propose a call
    #[serde(rename = "call-offer", rename_all = "camelCase")]
    CallOffer {
        /// Offer descriptor
        session_descriptor: SessionDescription,
        /// Caller
        from_peer_id: PeerId,
        /// Audio or video
        call_type: CallType,
    },

    /// Accept a call
    #[serde(rename = "call-answer", rename_all = "camelCase")]
    CallAnswer {
        /// Answer descriptor
        session_descriptor: SessionDescription,
        /// Caller
        to_peer_id: PeerId,
    },

    /// Trickled connectivity candidate
    #[serde(rename = "ice-candidate", rename_all = "camelCase")]
    IceCandidate {
        /// Candidate
        candidate: IceCandidate,
        /// Recipient
        to_peer_id: PeerId,
    },

    /// Hangup or reject
    #[serde(rename = "call-end", alias = "call-ended", rename_all = "camelCase")]
    CallEnd {
        /// Recipient
        to_peer_id: PeerId,
    },

    /// Relay reports the call as failed
    #[serde(rename = "call-failed")]
    CallFailed {
        /// Human-readable reason
        #[serde(default)]
        reason: String,
    },

    /// Relay reports the counterpart dropped off
    #[serde(rename = "call-connection-lost")]
    CallConnectionLost {
        /// Optional notice text
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },

    /// Relay asks the call to reconnect
    #[serde(rename = "call-reconnect-needed")]
    CallReconnectNeeded {
        /// Optional notice text
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
}

impl SignalingMessage {
    /// Wire name of the message
    #[must_use]
    pub fn message_type(&self) -> &'static str {
        match self {
            Self::CallOffer { .. } => "call-offer",
            Self::CallAnswer { .. } => "call-answer",
            Self::IceCandidate { .. } => "ice-candidate",
            Self::CallEnd { .. } => "call-end",
            Self::CallFailed { .. } => "call-failed",
            Self::CallConnectionLost { .. } => "call-connection-lost",
            Self::CallReconnectNeeded { .. } => "call-reconnect-needed",
        }
    }

    /// Recipient named in the payload, if any
    #[must_use]
    pub fn addressed_to(&self) -> Option<&PeerId> {
        match self {
            Self::CallAnswer { to_peer_id, .. }
            | Self::IceCandidate { to_peer_id, .. }
            | Self::CallEnd { to_peer_id } => Some(to_peer_id),
            _ => None,
        }
    }

    /// Structural checks on a received message
    ///
    /// # Errors
    ///
    /// Returns `InvalidMessage` when a descriptor has the wrong type or an
    /// empty body, or when an offer's claimed caller is not the sender.
    pub fn validate(&self, from: &PeerId) -> Result<(), SignalingError> {
        match self {
            Self::CallOffer {
                session_descriptor,
                from_peer_id,
                ..
            } => {
                check_descriptor(session_descriptor, SdpKind::Offer)?;
                if from_peer_id != from {
                    return Err(SignalingError::InvalidMessage(format!(
                        "offer claims to be from {from_peer_id}, sent by {from}"
                    )));
                }
                Ok(())
            }
            Self::CallAnswer {
                session_descriptor, ..
            } => check_descriptor(session_descriptor, SdpKind::Answer),
            _ => Ok(()),
        }
    }
}

fn check_descriptor(desc: &SessionDescription, expected: SdpKind) -> Result<(), SignalingError> {
    if desc.kind != expected {
        return Err(SignalingError::InvalidMessage(format!(
            "expected {expected:?} descriptor, got {:?}",
            desc.kind
        )));
    }
    if desc.sdp.trim().is_empty() {
        return Err(SignalingError::InvalidMessage("empty SDP".into()));
    }
    Ok(())
}

/// Signaling transport trait
///
/// Implement this for the relay connection the chat session already uses.
#[async_trait]
pub trait SignalingTransport: Send + Sync + 'static {
    /// Transport error type
    type Error: std::error::Error + Send + Sync + 'static;

    /// Send a signaling message
    async fn send_message(&self, peer: &PeerId, message: SignalingMessage)
        -> Result<(), Self::Error>;

    /// Receive the next signaling message and its sender
    async fn receive_message(&self) -> Result<(PeerId, SignalingMessage), Self::Error>;
}

/// Receives inbound signaling messages
pub trait SignalingSubscriber: Send + Sync {
    /// Called for each accepted inbound message, in arrival order
    fn on_signal(&self, from: PeerId, message: SignalingMessage);
}

/// Result of applying an inbound answer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnswerDisposition {
    /// Answer became the remote description
    Applied,
    /// Connection was not waiting for an answer; discarded
    Duplicate,
}

/// Result of an outbound candidate send
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CandidateSend {
    /// Sent to the counterpart
    Sent,
    /// Held until the offer/answer of this attempt goes out
    Held,
}

/// Outbound negotiation state for the current attempt
#[derive(Debug, Default)]
enum Outbound {
    #[default]
    Idle,
    Pending {
        generation: Generation,
        to: PeerId,
        kind: SdpKind,
        held: Vec<IceCandidate>,
    },
    Sent {
        generation: Generation,
        to: PeerId,
        kind: SdpKind,
    },
}

/// Signaling bridge with per-attempt send guards
pub struct SignalingBridge<T: SignalingTransport> {
    transport: Arc<T>,
    local_peer: PeerId,
    subscriber: Mutex<Option<Arc<dyn SignalingSubscriber>>>,
    outbound: Mutex<Outbound>,
    send_lock: tokio::sync::Mutex<()>,
    error_count: AtomicU32,
}

impl<T: SignalingTransport> SignalingBridge<T> {
    /// Create a bridge for `local_peer` over `transport`
    #[must_use]
    pub fn new(transport: Arc<T>, local_peer: PeerId) -> Self {
        Self {
            transport,
            local_peer,
            subscriber: Mutex::new(None),
            outbound: Mutex::new(Outbound::Idle),
            send_lock: tokio::sync::Mutex::new(()),
            error_count: AtomicU32::new(0),
        }
    }

    /// Identity this bridge sends as
    pub fn local_peer(&self) -> &PeerId {
        &self.local_peer
    }

    /// Register the inbound message subscriber
    ///
    /// # Errors
    ///
    /// Returns `AlreadySubscribed` if one is already registered
    pub fn subscribe(&self, subscriber: Arc<dyn SignalingSubscriber>) -> Result<(), SignalingError> {
        let mut slot = self.subscriber.lock();
        if slot.is_some() {
            return Err(SignalingError::AlreadySubscribed);
        }
        *slot = Some(subscriber);
        Ok(())
    }

    /// Remove the subscriber, returning whether one was registered
    pub fn unsubscribe(&self) -> bool {
        self.subscriber.lock().take().is_some()
    }

    /// Validate and hand an inbound message to the subscriber
    pub fn dispatch(&self, from: PeerId, message: SignalingMessage) {
        if let Some(to) = message.addressed_to() {
            if to != &self.local_peer {
                tracing::warn!(peer = %from, to = %to, message_type = message.message_type(), "Discarding message addressed elsewhere");
                return;
            }
        }
        if let Err(e) = message.validate(&from) {
            tracing::warn!(peer = %from, error = %e, "Discarding invalid signaling message");
            return;
        }
        let subscriber = self.subscriber.lock().clone();
        match subscriber {
            Some(subscriber) => subscriber.on_signal(from, message),
            None => {
                tracing::debug!(peer = %from, message_type = message.message_type(), "No subscriber, message dropped");
            }
        }
    }

    /// Receive the next signaling message.
    ///
    /// Consecutive transport errors back off linearly, capped at one second,
    /// so a closed transport does not spin the receive loop.
    ///
    /// # Errors
    ///
    /// Returns error if receiving fails
    #[tracing::instrument(skip(self))]
    pub async fn receive_message(&self) -> Result<(PeerId, SignalingMessage), SignalingError> {
        match self.transport.receive_message().await {
            Ok((from, message)) => {
                self.error_count.store(0, Ordering::Relaxed);
                tracing::debug!(peer = %from, message_type = message.message_type(), "Received signaling message");
                Ok((from, message))
            }
            Err(e) => {
                let count = self.error_count.fetch_add(1, Ordering::Relaxed) + 1;
                let backoff = Duration::from_millis(100 * u64::from(count.min(10)));
                tracing::warn!(
                    error_count = count,
                    backoff_ms = backoff.as_millis(),
                    error = %e,
                    "Error receiving message, backing off"
                );
                sleep(backoff).await;
                Err(SignalingError::Transport(e.to_string()))
            }
        }
    }

    /// Pump inbound messages into [`dispatch`](Self::dispatch) until aborted
    pub fn spawn_receiver(self: &Arc<Self>) -> JoinHandle<()> {
        let bridge = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                if let Ok((from, message)) = bridge.receive_message().await {
                    bridge.dispatch(from, message);
                }
            }
        })
    }

    /// Start a new outbound attempt, discarding the previous one
    pub fn begin_attempt(&self, generation: Generation, to: PeerId, kind: SdpKind) {
        tracing::debug!(%generation, peer = %to, ?kind, "Outbound attempt started");
        *self.outbound.lock() = Outbound::Pending {
            generation,
            to,
            kind,
            held: Vec::new(),
        };
    }

    /// Forget the attempt of `generation` if it is still the current one
    pub fn end_attempt(&self, generation: Generation) {
        let mut outbound = self.outbound.lock();
        let current = match &*outbound {
            Outbound::Pending { generation: g, .. } | Outbound::Sent { generation: g, .. } => {
                *g == generation
            }
            Outbound::Idle => false,
        };
        if current {
            *outbound = Outbound::Idle;
        }
    }

    /// Send the offer of `generation`
    ///
    /// # Errors
    ///
    /// `DuplicateOffer` if already sent, `StaleAttempt` if superseded,
    /// `Transport` if the relay refused it.
    pub async fn send_offer(
        &self,
        generation: Generation,
        offer: SessionDescription,
        call_type: CallType,
    ) -> Result<(), SignalingError> {
        let from_peer_id = self.local_peer.clone();
        self.send_descriptor(generation, SdpKind::Offer, |_| SignalingMessage::CallOffer {
            session_descriptor: offer,
            from_peer_id,
            call_type,
        })
        .await
    }

    /// Send the answer of `generation`
    ///
    /// # Errors
    ///
    /// `DuplicateAnswer` if already sent, `StaleAttempt` if superseded,
    /// `Transport` if the relay refused it.
    pub async fn send_answer(
        &self,
        generation: Generation,
        answer: SessionDescription,
    ) -> Result<(), SignalingError> {
        self.send_descriptor(generation, SdpKind::Answer, |to| SignalingMessage::CallAnswer {
            session_descriptor: answer,
            to_peer_id: to.clone(),
        })
        .await
    }

    async fn send_descriptor<F>(
        &self,
        generation: Generation,
        kind: SdpKind,
        build: F,
    ) -> Result<(), SignalingError>
    where
        F: FnOnce(&PeerId) -> SignalingMessage,
    {
        let _send = self.send_lock.lock().await;
        let (to, held) = {
            let mut outbound = self.outbound.lock();
            match std::mem::take(&mut *outbound) {
                Outbound::Pending {
                    generation: g,
                    to,
                    kind: k,
                    held,
                } if g == generation && k == kind => {
                    *outbound = Outbound::Sent {
                        generation,
                        to: to.clone(),
                        kind,
                    };
                    (to, held)
                }
                other => {
                    let err = match &other {
                        Outbound::Sent {
                            generation: g,
                            kind: k,
                            ..
                        } if *g == generation && *k == kind => match kind {
                            SdpKind::Offer => SignalingError::DuplicateOffer(generation),
                            SdpKind::Answer => SignalingError::DuplicateAnswer(generation),
                        },
                        _ => SignalingError::StaleAttempt(generation),
                    };
                    *outbound = other;
                    return Err(err);
                }
            }
        };

        self.transmit(&to, build(&to)).await?;
        for candidate in held {
            self.transmit(
                &to,
                SignalingMessage::IceCandidate {
                    candidate,
                    to_peer_id: to.clone(),
                },
            )
            .await?;
        }
        Ok(())
    }

    /// Send a local candidate of `generation`, holding it if the
    /// descriptor of that attempt has not gone out yet
    ///
    /// # Errors
    ///
    /// `StaleAttempt` if superseded, `Transport` if the relay refused it.
    pub async fn send_candidate(
        &self,
        generation: Generation,
        candidate: IceCandidate,
    ) -> Result<CandidateSend, SignalingError> {
        let to = {
            let mut outbound = self.outbound.lock();
            match &mut *outbound {
                Outbound::Pending {
                    generation: g,
                    held,
                    ..
                } if *g == generation => {
                    held.push(candidate);
                    return Ok(CandidateSend::Held);
                }
                Outbound::Sent {
                    generation: g, to, ..
                } if *g == generation => to.clone(),
                _ => return Err(SignalingError::StaleAttempt(generation)),
            }
        };
        let _send = self.send_lock.lock().await;
        self.transmit(
            &to,
            SignalingMessage::IceCandidate {
                candidate,
                to_peer_id: to.clone(),
            },
        )
        .await?;
        Ok(CandidateSend::Sent)
    }

    /// Send a hangup to `to`
    ///
    /// # Errors
    ///
    /// `Transport` if the relay refused it
    pub async fn send_hangup(&self, to: &PeerId) -> Result<(), SignalingError> {
        let _send = self.send_lock.lock().await;
        self.transmit(
            to,
            SignalingMessage::CallEnd {
                to_peer_id: to.clone(),
            },
        )
        .await
    }

    #[tracing::instrument(skip(self, message), fields(peer = %to, message_type = message.message_type()))]
    async fn transmit(&self, to: &PeerId, message: SignalingMessage) -> Result<(), SignalingError> {
        tracing::debug!("Sending signaling message");
        self.transport
            .send_message(to, message)
            .await
            .map_err(|e| SignalingError::Transport(e.to_string()))
    }
}

/// Apply an inbound answer if the connection is waiting for one
///
/// # Errors
///
/// Returns the peer error if the description could not be applied
pub async fn apply_inbound_answer(
    session: &PeerSession,
    answer: SessionDescription,
) -> Result<AnswerDisposition, PeerError> {
    let state = session.signaling_state();
    if state != SignalingState::HaveLocalOffer {
        tracing::debug!(?state, "Answer arrived outside have-local-offer, discarded");
        return Ok(AnswerDisposition::Duplicate);
    }
    session.set_remote_description(answer).await?;
    Ok(AnswerDisposition::Applied)
}

/// Queue or apply an inbound candidate
///
/// # Errors
///
/// Returns the peer error if the connection rejected the candidate
pub async fn route_inbound_candidate(
    session: &PeerSession,
    candidate: IceCandidate,
) -> Result<CandidateDisposition, PeerError> {
    session.add_remote_candidate(candidate).await
}
