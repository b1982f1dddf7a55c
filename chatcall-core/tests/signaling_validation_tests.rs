//! Signaling validation and edge case tests

mod common;

use chatcall_core::peer::PeerConnectionState;
use chatcall_core::signaling::SignalingMessage;
use chatcall_core::types::{
    CallEvent, CallFailure, CallState, CallType, EndReason, PeerId, SessionDescription,
};
use common::*;
use pretty_assertions::assert_eq;

#[tokio::test(start_paused = true)]
async fn duplicate_answer_after_active_is_ignored() {
    let mut h = Harness::new().await;
    let peer = h.establish_outgoing(CallType::Audio).await;
    h.drain_events();

    h.inject(answer_to_me());
    settle().await;

    assert_eq!(peer.remote_descriptions().len(), 1);
    assert_eq!(h.manager.state(), CallState::Active);
    assert!(h.drain_states().is_empty());
}

#[tokio::test(start_paused = true)]
async fn duplicate_offer_while_ringing_is_ignored() {
    let mut h = Harness::new().await;
    h.inject(offer_from_partner(CallType::Video));
    settle().await;
    let first = h.manager.snapshot().unwrap().call_id;
    h.drain_events();

    h.inject(offer_from_partner(CallType::Video));
    settle().await;
    assert_eq!(h.manager.snapshot().unwrap().call_id, first);
    assert!(h.drain_events().is_empty());
}

#[tokio::test(start_paused = true)]
async fn redelivered_offer_keeps_the_established_call() {
    let mut h = Harness::new().await;
    let peer = h.establish_incoming(CallType::Audio).await;
    h.drain_events();

    h.inject(offer_from_partner(CallType::Audio));
    settle().await;

    assert_eq!(h.transport.count("call-answer"), 1);
    assert_eq!(h.factory.count(), 1);
    assert!(!peer.is_closed());
    assert_eq!(h.manager.state(), CallState::Active);
    assert!(h.drain_events().is_empty());
}

#[tokio::test(start_paused = true)]
async fn stale_offer_after_renegotiation_is_ignored() {
    let mut h = Harness::new().await;
    let first = h.establish_incoming(CallType::Video).await;
    first.emit_state(PeerConnectionState::Disconnected);
    settle().await;

    h.inject(reoffer_from_partner(CallType::Video, "v=0 restarted offer"));
    settle().await;
    let second = h.factory.last();
    second.emit_state(PeerConnectionState::Connected);
    settle().await;
    assert_eq!(h.transport.count("call-answer"), 2);

    // Late copies of either offer change nothing.
    h.inject(offer_from_partner(CallType::Video));
    h.inject(reoffer_from_partner(CallType::Video, "v=0 restarted offer"));
    settle().await;
    assert_eq!(h.transport.count("call-answer"), 2);
    assert_eq!(h.factory.count(), 2);
    assert!(!second.is_closed());
    assert_eq!(h.manager.state(), CallState::Active);
}

#[tokio::test(start_paused = true)]
async fn offer_while_calling_out_is_discarded() {
    let h = Harness::new().await;
    h.manager.start_call(CallType::Audio).await.unwrap();
    let call_id = h.manager.snapshot().unwrap().call_id;

    h.inject(offer_from_partner(CallType::Audio));
    settle().await;
    assert_eq!(h.manager.state(), CallState::Connecting);
    assert_eq!(h.manager.snapshot().unwrap().call_id, call_id);
    assert_eq!(h.factory.count(), 1);
    assert_eq!(h.transport.count("call-answer"), 0);
}

#[tokio::test(start_paused = true)]
async fn answer_without_outgoing_call_is_discarded() {
    let h = Harness::new().await;
    h.inject(answer_to_me());
    settle().await;
    assert_eq!(h.manager.state(), CallState::Idle);

    h.inject(offer_from_partner(CallType::Audio));
    settle().await;
    h.inject(answer_to_me());
    settle().await;
    assert_eq!(h.manager.state(), CallState::RingingIncoming);
}

#[tokio::test(start_paused = true)]
async fn malformed_descriptors_are_discarded() {
    let h = Harness::new().await;

    h.inject(SignalingMessage::CallOffer {
        session_descriptor: SessionDescription::offer("   "),
        from_peer_id: PeerId::new(PARTNER),
        call_type: CallType::Audio,
    });
    h.inject(SignalingMessage::CallOffer {
        session_descriptor: SessionDescription::answer("v=0"),
        from_peer_id: PeerId::new(PARTNER),
        call_type: CallType::Audio,
    });
    settle().await;
    assert_eq!(h.manager.state(), CallState::Idle);

    h.manager.start_call(CallType::Audio).await.unwrap();
    let peer = h.factory.last();
    h.inject(SignalingMessage::CallAnswer {
        session_descriptor: SessionDescription::offer("v=0"),
        to_peer_id: PeerId::new(ME),
    });
    settle().await;
    assert!(peer.remote_descriptions().is_empty());
}

#[tokio::test(start_paused = true)]
async fn offer_claiming_another_caller_is_discarded() {
    let h = Harness::new().await;
    h.inject(SignalingMessage::CallOffer {
        session_descriptor: SessionDescription::offer("v=0"),
        from_peer_id: PeerId::new("mallory"),
        call_type: CallType::Video,
    });
    settle().await;
    assert_eq!(h.manager.state(), CallState::Idle);
}

#[tokio::test(start_paused = true)]
async fn messages_from_non_partner_are_discarded() {
    let h = Harness::new().await;
    h.transport.inject(
        "mallory",
        SignalingMessage::CallOffer {
            session_descriptor: SessionDescription::offer("v=0"),
            from_peer_id: PeerId::new("mallory"),
            call_type: CallType::Audio,
        },
    );
    settle().await;
    assert_eq!(h.manager.state(), CallState::Idle);

    let mut h = Harness::new().await;
    h.establish_outgoing(CallType::Audio).await;
    h.transport.inject("mallory", hangup_to_me());
    settle().await;
    assert_eq!(h.manager.state(), CallState::Active);
}

#[tokio::test(start_paused = true)]
async fn messages_addressed_elsewhere_are_discarded() {
    let mut h = Harness::new().await;
    let peer = h.establish_outgoing(CallType::Audio).await;

    h.inject(SignalingMessage::CallEnd {
        to_peer_id: PeerId::new("carol"),
    });
    h.inject(SignalingMessage::IceCandidate {
        candidate: chatcall_core::IceCandidate::new("stray"),
        to_peer_id: PeerId::new("carol"),
    });
    settle().await;
    assert_eq!(h.manager.state(), CallState::Active);
    assert!(peer.applied_candidates().is_empty());
}

#[tokio::test(start_paused = true)]
async fn candidates_before_answer_wait_for_remote_description() {
    let h = Harness::new().await;
    h.manager.start_call(CallType::Video).await.unwrap();
    let peer = h.factory.last();

    h.inject(candidate_to_me("early-1"));
    h.inject(candidate_to_me("early-2"));
    settle().await;
    assert!(peer.applied_candidates().is_empty());

    h.inject(answer_to_me());
    h.inject(candidate_to_me("late-1"));
    settle().await;
    assert_eq!(
        peer.applied_candidates(),
        vec!["early-1", "early-2", "late-1"]
    );
}

#[tokio::test(start_paused = true)]
async fn candidate_with_no_call_is_dropped() {
    let h = Harness::new().await;
    h.inject(candidate_to_me("orphan"));
    settle().await;

    // A later call does not inherit it.
    h.inject(offer_from_partner(CallType::Audio));
    settle().await;
    h.manager.accept_call().await.unwrap();
    assert!(h.factory.last().applied_candidates().is_empty());
}

#[tokio::test(start_paused = true)]
async fn relay_failure_tears_down_without_hangup() {
    let mut h = Harness::new().await;
    let peer = h.establish_outgoing(CallType::Audio).await;
    let sent_before = h.transport.sent().len();
    h.drain_events();

    h.inject(SignalingMessage::CallFailed {
        reason: "peer unreachable".into(),
    });
    settle().await;

    assert_eq!(h.manager.state(), CallState::Idle);
    assert!(peer.is_closed());
    assert_eq!(h.transport.sent().len(), sent_before);
    let events = h.drain_events();
    assert!(events.iter().any(|e| matches!(
        e,
        CallEvent::Failure { failure: CallFailure::RemoteFailure(reason), .. } if reason == "peer unreachable"
    )));
    assert!(events.iter().any(|e| matches!(
        e,
        CallEvent::CallEnded {
            reason: EndReason::RemoteFailure,
            ..
        }
    )));
}

#[tokio::test(start_paused = true)]
async fn relay_notices_are_advisory() {
    let mut h = Harness::new().await;
    h.establish_outgoing(CallType::Audio).await;
    h.drain_events();

    h.inject(SignalingMessage::CallConnectionLost { message: None });
    h.inject(SignalingMessage::CallReconnectNeeded {
        message: Some("Partner is reconnecting".into()),
    });
    settle().await;

    assert_eq!(h.manager.state(), CallState::Active);
    let notices: Vec<_> = h
        .drain_events()
        .into_iter()
        .filter_map(|e| match e {
            CallEvent::Notice { message } => Some(message),
            _ => None,
        })
        .collect();
    assert_eq!(
        notices,
        vec![
            "Call connection lost".to_string(),
            "Partner is reconnecting".to_string()
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn late_connection_events_of_ended_call_are_ignored() {
    let mut h = Harness::new().await;
    let peer = h.establish_outgoing(CallType::Audio).await;
    h.manager.end_call().await;
    h.drain_events();

    peer.emit_state(PeerConnectionState::Failed);
    peer.emit_remote_track(chatcall_core::TrackKind::Audio);
    settle().await;

    assert_eq!(h.manager.state(), CallState::Idle);
    assert!(h.drain_events().is_empty());
    assert!(h.manager.sinks().remote_audio().is_none());
}

#[tokio::test(start_paused = true)]
async fn events_of_a_previous_call_do_not_leak_into_the_next() {
    let mut h = Harness::new().await;
    let old = h.establish_outgoing(CallType::Audio).await;
    h.manager.end_call().await;

    let current = h.establish_outgoing(CallType::Audio).await;
    h.drain_events();

    old.emit_state(PeerConnectionState::Disconnected);
    settle().await;
    assert_eq!(h.manager.state(), CallState::Active);

    current.emit_state(PeerConnectionState::Disconnected);
    settle().await;
    assert_eq!(h.manager.state(), CallState::Reconnecting);
}
