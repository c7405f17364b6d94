//! Orchestrator lifecycle, event pumping and the matching flow

use parley_core::testing::{drain_events, FakeConnectionFactory, FakeMediaCapability, MockSignalingTransport};
use parley_core::{
    CallId, CallKind, CallOrchestrator, CallStatus, CameraFacing, ConnectionEvent, ConnectionState, IceCandidate,
    LocalTrack, MatchRole, MatchStatus, OrchestratorConfig, Participant, ParticipantId, RemoteTrack, SessionDescription,
    ServiceError, SessionError, SessionEvent, SessionOrigin, SignalingHandler, SignalingMessage, TeardownReason,
    TrackKind,
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

fn build(config: OrchestratorConfig) -> Fixture {
    parley_core::testing::init_tracing();
    let transport = Arc::new(MockSignalingTransport::new());
    let capability = Arc::new(FakeMediaCapability::new());
    let factory = Arc::new(FakeConnectionFactory::new());
    let orchestrator = CallOrchestrator::builder(
        ParticipantId::new("me"),
        Arc::new(SignalingHandler::new(transport.clone())),
    )
    .with_media_capability(capability.clone())
    .with_connection_factory(factory.clone())
    .with_config(config)
    .build()
    .unwrap();
    let events = orchestrator.subscribe_events();
    Fixture {
        transport,
        capability,
        factory,
        orchestrator,
        events,
    }
}

async fn connected() -> Fixture {
    let f = build(OrchestratorConfig::default());
    f.orchestrator.connect().await.unwrap();
    f.transport.clear_sent();
    f
}

fn found(role: MatchRole, partner: &str) -> SignalingMessage {
    SignalingMessage::MatchFound {
        role,
        partner_id: ParticipantId::new(partner),
        partner_name: format!("Stranger {partner}"),
    }
}

fn remote_track(id: &str, kind: TrackKind) -> RemoteTrack {
    RemoteTrack {
        id: id.to_string(),
        kind,
        stream_id: "stream".to_string(),
        handle: Arc::new(()),
    }
}

#[tokio::test]
async fn run_loop_stops_when_transport_closes() {
    let mut f = connected().await;
    f.transport.push_inbound(SignalingMessage::CallIncoming {
        call_id: CallId::new("c1"),
        kind: CallKind::Audio1to1,
        caller: Participant::new("bob", "Bob"),
        participants: vec![],
    });
    f.transport.close_inbound();

    f.orchestrator.run().await.unwrap();

    assert!(!f.orchestrator.is_connected());
    assert_eq!(
        f.orchestrator.calls().session().await.unwrap().status,
        CallStatus::Ended
    );
    // Nothing is sent on a transport that is gone
    assert!(f.transport.sent().is_empty());

    let reasons: Vec<_> = drain_events(&mut f.events)
        .into_iter()
        .filter_map(|e| match e {
            SessionEvent::CallEnded { reason, .. } => Some(reason),
            _ => None,
        })
        .collect();
    assert_eq!(reasons, vec![TeardownReason::TransportDisconnected]);
}

#[tokio::test]
async fn events_after_disconnect_are_dropped() {
    let f = connected().await;
    f.orchestrator
        .initiate_call(vec![ParticipantId::new("bob")], CallKind::Audio1to1, None)
        .await
        .unwrap();
    f.transport.clear_sent();

    f.orchestrator.disconnect().await.unwrap();
    assert!(!f.transport.is_connected());
    assert_eq!(
        f.orchestrator.calls().session().await.unwrap().status,
        CallStatus::Ended
    );
    assert!(f.transport.sent().is_empty());
    assert!(f.capability.all_released());
    assert_eq!(f.factory.open_connections(), 0);

    f.orchestrator
        .handle_message(SignalingMessage::CallIncoming {
            call_id: CallId::new("late"),
            kind: CallKind::Audio1to1,
            caller: Participant::new("carol", "Carol"),
            participants: vec![],
        })
        .await;
    assert_eq!(
        f.orchestrator.calls().session().await.unwrap().call_id,
        CallId::new("call-1")
    );
}

#[tokio::test]
async fn connection_events_are_pumped_into_the_call() {
    let mut f = connected().await;
    let bob = ParticipantId::new("bob");
    let call_id = f
        .orchestrator
        .initiate_call(vec![bob.clone()], CallKind::Video1to1, None)
        .await
        .unwrap();
    let connection = f.factory.connection_for(&bob).unwrap();
    f.transport.clear_sent();
    drain_events(&mut f.events);

    connection.emit(ConnectionEvent::LocalCandidate(IceCandidate::new("candidate:local")));
    connection.emit(ConnectionEvent::RemoteTrack(remote_track("bob-video", TrackKind::Video)));
    connection.emit(ConnectionEvent::StateChanged(ConnectionState::Connected));
    assert_eq!(f.orchestrator.pump_peer_events().await, 3);

    assert_eq!(
        f.transport.sent(),
        vec![SignalingMessage::CallIceCandidate {
            call_id,
            from: ParticipantId::new("me"),
            to: bob.clone(),
            candidate: IceCandidate::new("candidate:local"),
        }]
    );
    assert_eq!(
        f.orchestrator.calls().session().await.unwrap().status,
        CallStatus::Active
    );

    let events = drain_events(&mut f.events);
    assert!(events.iter().any(|e| matches!(
        e,
        SessionEvent::RemoteMediaAvailable { origin: SessionOrigin::Call, media } if media.has_video()
    )));

    let snapshot = f.orchestrator.snapshot().await;
    assert_eq!(snapshot.active, Some(SessionOrigin::Call));
    assert_eq!(snapshot.media.remote.len(), 1);
    assert_eq!(snapshot.media.remote[0].participant_id, bob);
    assert_eq!(f.orchestrator.pump_peer_events().await, 0);
}

#[tokio::test]
async fn disconnected_peer_ends_the_call() {
    let f = connected().await;
    let bob = ParticipantId::new("bob");
    f.orchestrator
        .initiate_call(vec![bob.clone()], CallKind::Audio1to1, None)
        .await
        .unwrap();
    let connection = f.factory.connection_for(&bob).unwrap();

    connection.emit(ConnectionEvent::StateChanged(ConnectionState::Disconnected));
    f.orchestrator.pump_peer_events().await;

    assert!(connection.is_closed());
    assert_eq!(
        f.orchestrator.calls().session().await.unwrap().status,
        CallStatus::Ended
    );
    assert_eq!(f.transport.sent_names().last(), Some(&"call:end"));
}

#[tokio::test]
async fn match_as_initiator_and_partner_leaves() {
    let mut f = connected().await;
    f.orchestrator.find_partner().await.unwrap();
    f.orchestrator
        .handle_message(SignalingMessage::WaitingForPartner)
        .await;
    assert_eq!(f.orchestrator.matches().status().await, MatchStatus::Searching);

    f.orchestrator
        .handle_message(found(MatchRole::Initiator, "p1"))
        .await;
    assert_eq!(f.transport.sent_names(), vec!["find-partner", "signal-offer"]);

    let snapshot = f.orchestrator.snapshot().await;
    assert_eq!(snapshot.matching.status, MatchStatus::Connected);
    assert_eq!(snapshot.matching.role, Some(MatchRole::Initiator));
    assert_eq!(snapshot.matching.partner_name.as_deref(), Some("Stranger p1"));
    assert_eq!(snapshot.active, Some(SessionOrigin::Match));

    let events = drain_events(&mut f.events);
    assert!(events.iter().any(|e| matches!(
        e,
        SessionEvent::MatchFound { role: MatchRole::Initiator, partner_name } if partner_name == "Stranger p1"
    )));

    f.orchestrator
        .handle_message(SignalingMessage::MatchEnded {
            partner_id: Some(ParticipantId::new("p1")),
        })
        .await;
    assert_eq!(f.orchestrator.matches().status().await, MatchStatus::Idle);
    assert_eq!(f.transport.sent_names(), vec!["find-partner", "signal-offer"]);
    assert!(f.capability.all_released());
}

#[tokio::test]
async fn responder_ignores_answer_before_offer() {
    let f = connected().await;
    let partner = ParticipantId::new("p1");
    f.orchestrator.find_partner().await.unwrap();
    f.orchestrator
        .handle_message(found(MatchRole::Responder, "p1"))
        .await;
    let connection = f.factory.connection_for(&partner).unwrap();
    assert_eq!(connection.offers_created(), 0);

    f.orchestrator
        .handle_message(SignalingMessage::SignalAnswer {
            from: partner.clone(),
            to: ParticipantId::new("me"),
            description: SessionDescription::answer("stray-answer"),
        })
        .await;
    assert!(connection.remote_descriptions().is_empty());

    f.orchestrator
        .handle_message(SignalingMessage::SignalOffer {
            from: partner.clone(),
            to: ParticipantId::new("me"),
            description: SessionDescription::offer("offer-from-p1"),
        })
        .await;
    assert_eq!(
        connection.remote_descriptions(),
        vec![SessionDescription::offer("offer-from-p1")]
    );
    assert_eq!(f.transport.sent_names().last(), Some(&"signal-answer"));
}

#[tokio::test]
async fn next_partner_ignores_the_previous_partner() {
    let f = connected().await;
    f.orchestrator.find_partner().await.unwrap();
    f.orchestrator
        .handle_message(found(MatchRole::Initiator, "p1"))
        .await;
    let first = f.factory.connection_for(&ParticipantId::new("p1")).unwrap();

    f.orchestrator.next_partner().await.unwrap();
    assert!(first.is_closed());
    assert_eq!(f.orchestrator.matches().status().await, MatchStatus::Searching);
    assert_eq!(
        f.transport.sent_names(),
        vec!["find-partner", "signal-offer", "leave-pool", "find-partner"]
    );

    f.orchestrator
        .handle_message(found(MatchRole::Responder, "p2"))
        .await;

    // Late traffic from the first partner
    f.orchestrator
        .handle_message(SignalingMessage::SignalAnswer {
            from: ParticipantId::new("p1"),
            to: ParticipantId::new("me"),
            description: SessionDescription::answer("late"),
        })
        .await;
    f.orchestrator
        .handle_message(SignalingMessage::MatchEnded {
            partner_id: Some(ParticipantId::new("p1")),
        })
        .await;

    let session = f.orchestrator.matches().session().await.unwrap();
    assert_eq!(session.partner_id, ParticipantId::new("p2"));
    assert_eq!(f.orchestrator.matches().status().await, MatchStatus::Connected);
    assert_eq!(f.orchestrator.matches().peer_count().await, 1);
    assert!(first.remote_descriptions().is_empty());
}

#[tokio::test]
async fn screen_share_and_camera_switch_in_a_match() {
    let mut f = connected().await;
    f.orchestrator.find_partner().await.unwrap();
    f.orchestrator
        .handle_message(found(MatchRole::Initiator, "p1"))
        .await;
    let connection = f.factory.connection_for(&ParticipantId::new("p1")).unwrap();
    drain_events(&mut f.events);

    f.orchestrator.start_screen_share().await.unwrap();
    assert!(f.orchestrator.snapshot().await.media.is_screen_sharing);
    assert_eq!(connection.replaced_video_ids(), vec!["screen-3"]);

    // Switching while sharing only replaces the parked camera
    assert_eq!(
        f.orchestrator.switch_camera().await.unwrap(),
        CameraFacing::Environment
    );
    assert_eq!(connection.replaced_video_ids(), vec!["screen-3"]);

    f.orchestrator.stop_screen_share().await.unwrap();
    assert_eq!(connection.replaced_video_ids(), vec!["screen-3", "rear-camera-4"]);

    let snapshot = f.orchestrator.snapshot().await;
    assert!(!snapshot.media.is_screen_sharing);
    assert_eq!(snapshot.media.camera_facing, CameraFacing::Environment);

    let stopped: Vec<_> = f
        .capability
        .issued_tracks()
        .iter()
        .filter(|t| t.is_stopped())
        .map(|t| t.id().to_string())
        .collect();
    assert_eq!(stopped, vec!["camera-2", "screen-3"]);

    let local_changes = drain_events(&mut f.events)
        .into_iter()
        .filter(|e| matches!(e, SessionEvent::LocalMediaChanged { .. }))
        .count();
    assert_eq!(local_changes, 2);
}

#[tokio::test]
async fn audio_only_matching_has_no_camera() {
    let config = OrchestratorConfig::from_json(r#"{"matching":{"video":false}}"#).unwrap();
    let f = build(config);
    f.orchestrator.connect().await.unwrap();

    f.orchestrator.find_partner().await.unwrap();
    assert_eq!(f.orchestrator.toggle_video().await, None);
    assert_eq!(f.orchestrator.toggle_mute().await, Some(true));
    // Match toggles stay local
    assert_eq!(f.transport.sent_names(), vec!["identify", "find-partner"]);

    f.orchestrator.leave_pool().await.unwrap();
    assert_eq!(f.transport.sent_names().last(), Some(&"leave-pool"));
    assert!(f.capability.all_released());
}

#[tokio::test]
async fn call_and_match_never_hold_media_together() {
    let f = connected().await;
    f.orchestrator.find_partner().await.unwrap();
    f.orchestrator.handle_message(found(MatchRole::Responder, "p1")).await;
    f.orchestrator
        .handle_message(SignalingMessage::CallIncoming {
            call_id: CallId::new("c1"),
            kind: CallKind::Audio1to1,
            caller: Participant::new("bob", "Bob"),
            participants: vec![],
        })
        .await;
    assert_eq!(f.orchestrator.calls().session().await.unwrap().status, CallStatus::Ringing);

    assert!(matches!(
        f.orchestrator.accept_call().await,
        Err(ServiceError::Session(SessionError::Busy))
    ));
    assert!(matches!(
        f.orchestrator
            .initiate_call(vec![ParticipantId::new("carol")], CallKind::Audio1to1, None)
            .await,
        Err(ServiceError::Session(SessionError::Busy))
    ));
    assert_eq!(f.capability.acquisitions(), 1);
    assert_eq!(f.orchestrator.calls().session().await.unwrap().status, CallStatus::Ringing);

    f.orchestrator.leave_pool().await.unwrap();
    assert_eq!(f.orchestrator.accept_call().await.unwrap(), CallId::new("c1"));
    let live: Vec<String> = f
        .capability
        .issued_tracks()
        .iter()
        .filter(|t| !t.is_stopped())
        .map(|t| t.id().to_string())
        .collect();
    assert_eq!(live, vec!["mic-3"]);

    assert!(matches!(
        f.orchestrator.find_partner().await,
        Err(ServiceError::Session(SessionError::Busy))
    ));
    assert_eq!(f.orchestrator.matches().status().await, MatchStatus::Idle);
}
