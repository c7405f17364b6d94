//! End-to-end call flows driven through the orchestrator

use parley_core::testing::{drain_events, FakeConnectionFactory, FakeMediaCapability, MockSignalingTransport};
use parley_core::{
    CallId, CallKind, CallOrchestrator, CallStatus, IceCandidate, Participant, ParticipantId, ServiceError,
    SessionDescription, SessionError, SessionEvent, SignalingHandler, SignalingMessage, TeardownReason,
};
use pretty_assertions::assert_eq;
use std::sync::Arc;
use tokio::sync::broadcast;

struct Fixture {
    transport: Arc<MockSignalingTransport>,
    capability: Arc<FakeMediaCapability>,
    factory: Arc<FakeConnectionFactory>,
    orchestrator: CallOrchestrator<MockSignalingTransport>,
    events: broadcast::Receiver<SessionEvent>,
}

async fn fixture() -> Fixture {
    parley_core::testing::init_tracing();
    let transport = Arc::new(MockSignalingTransport::new());
    let capability = Arc::new(FakeMediaCapability::new());
    let factory = Arc::new(FakeConnectionFactory::new());
    let orchestrator = CallOrchestrator::builder(
        ParticipantId::new("alice"),
        Arc::new(SignalingHandler::new(transport.clone())),
    )
    .with_media_capability(capability.clone())
    .with_connection_factory(factory.clone())
    .build()
    .unwrap();
    orchestrator.connect().await.unwrap();
    transport.clear_sent();
    let events = orchestrator.subscribe_events();
    Fixture {
        transport,
        capability,
        factory,
        orchestrator,
        events,
    }
}

fn bob() -> ParticipantId {
    ParticipantId::new("bob")
}

fn alice() -> ParticipantId {
    ParticipantId::new("alice")
}

fn incoming_from_bob(call_id: &str, kind: CallKind) -> SignalingMessage {
    SignalingMessage::CallIncoming {
        call_id: CallId::new(call_id),
        kind,
        caller: Participant::new("bob", "Bob"),
        participants: vec![Participant::new("alice", "Alice"), Participant::new("bob", "Bob")],
    }
}

#[tokio::test]
async fn outgoing_call_round_trip() {
    let mut f = fixture().await;

    let call_id = f
        .orchestrator
        .initiate_call(vec![bob()], CallKind::Video1to1, None)
        .await
        .unwrap();
    assert_eq!(call_id, CallId::new("call-1"));
    assert_eq!(f.transport.sent_names(), vec!["call:initiate", "call:offer"]);
    assert_eq!(
        f.transport.sent()[1],
        SignalingMessage::CallOffer {
            call_id: call_id.clone(),
            from: alice(),
            to: bob(),
            description: SessionDescription::offer("offer-bob-1"),
        }
    );

    let connection = f.factory.connection_for(&bob()).unwrap();
    assert_eq!(connection.track_ids(), vec!["mic-1", "camera-2"]);

    f.orchestrator
        .handle_message(SignalingMessage::CallAccepted {
            call_id: call_id.clone(),
            participant: Participant::new("bob", "Bob"),
        })
        .await;
    f.orchestrator
        .handle_message(SignalingMessage::CallAnswer {
            call_id: call_id.clone(),
            from: bob(),
            to: alice(),
            description: SessionDescription::answer("answer-from-bob"),
        })
        .await;
    f.orchestrator
        .handle_message(SignalingMessage::CallIceCandidate {
            call_id: call_id.clone(),
            from: bob(),
            to: alice(),
            candidate: IceCandidate::new("candidate:1"),
        })
        .await;

    let session = f.orchestrator.calls().session().await.unwrap();
    assert_eq!(session.status, CallStatus::Active);
    assert!(session.started_at.is_some());
    assert_eq!(
        connection.remote_descriptions(),
        vec![SessionDescription::answer("answer-from-bob")]
    );
    assert_eq!(connection.applied_candidates(), vec![IceCandidate::new("candidate:1")]);

    f.orchestrator.end_call().await.unwrap();
    assert_eq!(f.transport.sent_names().last(), Some(&"call:end"));
    assert_eq!(
        f.orchestrator.calls().session().await.unwrap().status,
        CallStatus::Ended
    );
    assert!(f.capability.all_released());
    assert!(connection.is_closed());

    let ended = drain_events(&mut f.events)
        .into_iter()
        .find_map(|e| match e {
            SessionEvent::CallEnded { reason, .. } => Some(reason),
            _ => None,
        });
    assert_eq!(ended, Some(TeardownReason::LocalEnd));
}

#[tokio::test]
async fn accept_before_offer_replays_early_candidates() {
    let mut f = fixture().await;
    f.orchestrator
        .handle_message(incoming_from_bob("c1", CallKind::Audio1to1))
        .await;
    let events = drain_events(&mut f.events);
    assert!(matches!(
        events.first(),
        Some(SessionEvent::IncomingCall { caller, .. }) if caller.id == bob()
    ));

    // Candidate races ahead of both the accept and the offer
    f.orchestrator
        .handle_message(SignalingMessage::CallIceCandidate {
            call_id: CallId::new("c1"),
            from: bob(),
            to: alice(),
            candidate: IceCandidate::new("candidate:early"),
        })
        .await;

    f.orchestrator.accept_call().await.unwrap();
    assert_eq!(f.transport.sent_names(), vec!["call:accept"]);
    let connection = f.factory.connection_for(&bob()).unwrap();
    assert!(connection.applied_candidates().is_empty());

    f.orchestrator
        .handle_message(SignalingMessage::CallOffer {
            call_id: CallId::new("c1"),
            from: bob(),
            to: alice(),
            description: SessionDescription::offer("offer-from-bob"),
        })
        .await;

    assert_eq!(f.factory.created(), 1);
    assert_eq!(connection.applied_candidates(), vec![IceCandidate::new("candidate:early")]);
    assert_eq!(
        f.transport.sent().last(),
        Some(&SignalingMessage::CallAnswer {
            call_id: CallId::new("c1"),
            from: alice(),
            to: bob(),
            description: SessionDescription::answer("answer-bob"),
        })
    );
}

#[tokio::test]
async fn offer_while_ringing_is_answered_on_accept() {
    let f = fixture().await;
    f.orchestrator
        .handle_message(incoming_from_bob("c1", CallKind::Video1to1))
        .await;
    f.orchestrator
        .handle_message(SignalingMessage::CallOffer {
            call_id: CallId::new("c1"),
            from: bob(),
            to: alice(),
            description: SessionDescription::offer("offer-from-bob"),
        })
        .await;
    assert_eq!(f.factory.created(), 0);
    assert_eq!(f.capability.acquisitions(), 0);

    f.orchestrator.accept_call().await.unwrap();
    let connection = f.factory.connection_for(&bob()).unwrap();
    assert_eq!(
        connection.remote_descriptions(),
        vec![SessionDescription::offer("offer-from-bob")]
    );
    assert_eq!(f.transport.sent_names(), vec!["call:accept", "call:answer"]);
}

#[tokio::test]
async fn end_while_accept_waits_for_media() {
    let f = fixture().await;
    f.orchestrator
        .handle_message(incoming_from_bob("c1", CallKind::Video1to1))
        .await;

    let gate = f.capability.hold_next();
    let orchestrator = &f.orchestrator;
    let (accepted, ended) = tokio::join!(orchestrator.accept_call(), async move {
        let ended = orchestrator.end_call().await;
        let _ = gate.send(());
        ended
    });

    ended.unwrap();
    assert!(matches!(accepted, Err(ServiceError::Session(SessionError::Cancelled))));
    assert_eq!(f.transport.sent_names(), vec!["call:reject"]);
    assert_eq!(
        f.orchestrator.calls().session().await.unwrap().status,
        CallStatus::Ended
    );
    assert!(f.capability.all_released());
    assert_eq!(f.factory.created(), 0);
}

#[tokio::test]
async fn busy_while_calling_rejects_second_call() {
    let f = fixture().await;
    f.orchestrator
        .initiate_call(vec![bob()], CallKind::Audio1to1, None)
        .await
        .unwrap();
    f.transport.clear_sent();

    f.orchestrator
        .handle_message(SignalingMessage::CallIncoming {
            call_id: CallId::new("other"),
            kind: CallKind::Audio1to1,
            caller: Participant::new("carol", "Carol"),
            participants: vec![],
        })
        .await;

    assert_eq!(
        f.transport.sent(),
        vec![SignalingMessage::CallReject {
            call_id: CallId::new("other"),
            reason: Some("busy".to_string()),
        }]
    );
    assert_eq!(
        f.orchestrator.calls().session().await.unwrap().call_id,
        CallId::new("call-1")
    );
    assert!(matches!(
        f.orchestrator
            .initiate_call(vec![ParticipantId::new("carol")], CallKind::Audio1to1, None)
            .await,
        Err(ServiceError::Session(SessionError::Busy))
    ));
}

#[tokio::test]
async fn duplicate_participant_joined_opens_one_peer() {
    let f = fixture().await;
    let call_id = f
        .orchestrator
        .initiate_call(
            vec![bob(), ParticipantId::new("carol")],
            CallKind::VideoGroup,
            Some("team".to_string()),
        )
        .await
        .unwrap();
    assert_eq!(f.factory.created(), 0);

    let joined = SignalingMessage::ParticipantJoined {
        call_id: call_id.clone(),
        participant: Participant::new("bob", "Bob"),
    };
    f.orchestrator.handle_message(joined.clone()).await;
    f.orchestrator.handle_message(joined).await;

    assert_eq!(f.factory.created(), 1);
    assert_eq!(f.factory.connection_for(&bob()).unwrap().offers_created(), 1);
    assert_eq!(f.orchestrator.calls().peer_count().await, 1);
    assert_eq!(
        f.orchestrator.calls().session().await.unwrap().status,
        CallStatus::Active
    );
}

#[tokio::test]
async fn group_call_survives_one_participant_leaving() {
    let mut f = fixture().await;
    let call_id = f
        .orchestrator
        .initiate_call(
            vec![bob(), ParticipantId::new("carol")],
            CallKind::AudioGroup,
            None,
        )
        .await
        .unwrap();
    for name in ["bob", "carol"] {
        f.orchestrator
            .handle_message(SignalingMessage::ParticipantJoined {
                call_id: call_id.clone(),
                participant: Participant::new(name, name),
            })
            .await;
    }
    assert_eq!(f.orchestrator.calls().peer_count().await, 2);
    drain_events(&mut f.events);

    f.orchestrator
        .handle_message(SignalingMessage::ParticipantLeft {
            call_id: call_id.clone(),
            participant_id: bob(),
        })
        .await;

    let session = f.orchestrator.calls().session().await.unwrap();
    assert_eq!(session.status, CallStatus::Active);
    assert!(session.participant(&bob()).is_none());
    assert_eq!(f.orchestrator.calls().peer_count().await, 1);
    assert!(f.factory.connection_for(&bob()).unwrap().is_closed());

    let events = drain_events(&mut f.events);
    assert!(events
        .iter()
        .any(|e| matches!(e, SessionEvent::ParticipantLeft { participant_id, .. } if participant_id == &bob())));
    assert!(events
        .iter()
        .any(|e| matches!(e, SessionEvent::RemoteMediaRemoved { participant_id, .. } if participant_id == &bob())));

    f.orchestrator
        .handle_message(SignalingMessage::ParticipantLeft {
            call_id,
            participant_id: ParticipantId::new("carol"),
        })
        .await;
    assert_eq!(
        f.orchestrator.calls().session().await.unwrap().status,
        CallStatus::Ended
    );
    assert_eq!(f.transport.sent_names().last(), Some(&"call:end"));
}

#[tokio::test]
async fn mute_and_video_controls_without_tracks() {
    let f = fixture().await;
    assert_eq!(f.orchestrator.toggle_mute().await, None);
    assert_eq!(f.orchestrator.toggle_video().await, None);

    f.orchestrator
        .initiate_call(vec![bob()], CallKind::Audio1to1, None)
        .await
        .unwrap();
    f.transport.clear_sent();

    assert_eq!(f.orchestrator.toggle_video().await, None);
    assert!(matches!(
        f.orchestrator.start_screen_share().await,
        Err(ServiceError::Session(SessionError::NoVideoSender))
    ));
    assert_eq!(f.orchestrator.toggle_mute().await, Some(true));
    assert_eq!(f.orchestrator.toggle_mute().await, Some(false));
    assert_eq!(f.transport.sent_names(), vec!["call:toggle-mute", "call:toggle-mute"]);

    let snapshot = f.orchestrator.snapshot().await;
    assert!(!snapshot.media.is_muted);
    assert!(snapshot.media.local.is_some());
}
