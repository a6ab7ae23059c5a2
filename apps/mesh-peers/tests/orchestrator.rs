mod support;

use std::sync::Arc;
use std::time::Duration;

use mesh_peers::capability::scripted::{Call, ScriptedFactory};
use mesh_peers::capability::{CapabilityEvent, LinkState, Role};
use mesh_peers::connection::NegotiationState;
use mesh_peers::orchestrator::Orchestrator;
use mesh_peers::signaling::SignalSender;
use mesh_peers::{Counter, MeshCounters, MeshError};
use mesh_proto::{ClientFrame, ErrorCode, ErrorReply, Register, RelayPayload, ServerFrame};
use serde_json::Value;
use support::{answer, assign, candidate, offer, peer, relay, Harness, HEARTBEAT_TEXT};

#[test_timeout::tokio_timeout_test]
async fn create_peer_registers_with_rendezvous() {
    let mut h = Harness::new();
    h.orchestrator.create_peer(peer("S1-0")).unwrap();

    assert_eq!(
        h.sent(),
        vec![ClientFrame::Register(Register {
            peer_id: peer("S1-0")
        })]
    );
    assert_eq!(h.orchestrator.peer_ids(), vec![peer("S1-0")]);

    let err = h.orchestrator.create_peer(peer("S1-0")).unwrap_err();
    assert!(matches!(err, MeshError::DuplicateLocalPeer(id) if id == peer("S1-0")));
    assert!(h.sent().is_empty());
}

#[test_timeout::tokio_timeout_test]
async fn assignment_starts_offer_to_neighbor() {
    let mut h = Harness::new();
    h.orchestrator.create_peer(peer("S2-0")).unwrap();
    h.sent();

    h.orchestrator.handle_signal(assign("S2-0", "S1-0")).await;
    h.pump().await;

    let relays = h.sent_relays();
    assert_eq!(relays.len(), 1);
    assert_eq!(relays[0].source, peer("S2-0"));
    assert_eq!(relays[0].destination, peer("S1-0"));
    assert_eq!(relays[0].offer.as_ref().unwrap()["type"], "offer");

    let connections = h.orchestrator.connections();
    assert_eq!(connections.len(), 1);
    assert_eq!(connections[0].role, Role::Offering);
    assert_eq!(connections[0].state, NegotiationState::AnswerPending);

    // A repeated assignment for the same pair does not open a second connection.
    h.orchestrator.handle_signal(assign("S2-0", "S1-0")).await;
    h.pump().await;
    assert!(h.sent().is_empty());
    assert_eq!(h.factory.handles().len(), 1);
}

#[test_timeout::tokio_timeout_test]
async fn offer_creates_answering_connection_on_demand() {
    let mut h = Harness::new();
    h.orchestrator.create_peer(peer("S2-0")).unwrap();
    h.sent();

    h.orchestrator
        .handle_signal(relay("S1-0", "S2-0", RelayPayload::Offer(offer())))
        .await;

    let relays = h.sent_relays();
    assert_eq!(relays.len(), 1);
    assert_eq!(relays[0].source, peer("S2-0"));
    assert_eq!(relays[0].destination, peer("S1-0"));
    assert_eq!(relays[0].answer.as_ref().unwrap()["type"], "answer");

    let connections = h.orchestrator.connections();
    assert_eq!(connections.len(), 1);
    assert_eq!(connections[0].role, Role::Answering);
    assert_eq!(connections[0].state, NegotiationState::AnswerSent);
    assert_eq!(
        h.handle(0).negotiator.calls(),
        vec![Call::AcceptOffer(offer())]
    );
}

#[test_timeout::tokio_timeout_test]
async fn duplicate_offer_never_recreates_connection() {
    let mut h = Harness::new();
    h.orchestrator.create_peer(peer("S2-0")).unwrap();
    h.orchestrator
        .handle_signal(relay("S1-0", "S2-0", RelayPayload::Offer(offer())))
        .await;
    h.sent();

    h.orchestrator
        .handle_signal(relay("S1-0", "S2-0", RelayPayload::Offer(offer())))
        .await;

    assert!(h.sent().is_empty());
    assert_eq!(h.factory.handles().len(), 1);
    assert_eq!(h.handle(0).negotiator.calls().len(), 1);
    assert_eq!(
        h.orchestrator.connections()[0].state,
        NegotiationState::AnswerSent
    );
}

#[test_timeout::tokio_timeout_test]
async fn early_candidate_is_dropped_and_redelivery_succeeds() {
    let mut h = Harness::new();
    h.orchestrator.create_peer(peer("S2-0")).unwrap();

    h.orchestrator
        .handle_signal(relay("S1-0", "S2-0", RelayPayload::Candidate(candidate())))
        .await;
    assert!(h.orchestrator.connections().is_empty());
    assert!(h.factory.handles().is_empty());

    h.orchestrator
        .handle_signal(relay("S1-0", "S2-0", RelayPayload::Offer(offer())))
        .await;
    h.orchestrator
        .handle_signal(relay("S1-0", "S2-0", RelayPayload::Candidate(candidate())))
        .await;

    assert_eq!(
        h.handle(0).negotiator.calls(),
        vec![Call::AcceptOffer(offer()), Call::RemoteCandidate(candidate())]
    );
}

#[test_timeout::tokio_timeout_test]
async fn answer_without_connection_is_dropped() {
    let mut h = Harness::new();
    h.orchestrator.create_peer(peer("S1-0")).unwrap();
    h.sent();

    h.orchestrator
        .handle_signal(relay("S2-0", "S1-0", RelayPayload::Answer(answer())))
        .await;

    assert!(h.orchestrator.connections().is_empty());
    assert!(h.sent().is_empty());
}

#[test_timeout::tokio_timeout_test]
async fn signals_for_unknown_local_peer_are_dropped() {
    let mut h = Harness::new();
    h.orchestrator.create_peer(peer("S1-0")).unwrap();
    h.sent();

    h.orchestrator
        .handle_signal(relay("S2-0", "ghost-0", RelayPayload::Offer(offer())))
        .await;
    h.orchestrator.handle_signal(assign("ghost-0", "S2-0")).await;

    assert!(h.factory.handles().is_empty());
    assert!(h.sent().is_empty());
}

#[test_timeout::tokio_timeout_test]
async fn offering_side_completes_and_relays_candidates() {
    let mut h = Harness::new();
    h.orchestrator.create_peer(peer("S1-0")).unwrap();
    h.orchestrator.handle_signal(assign("S1-0", "S2-0")).await;
    h.pump().await;
    h.sent();

    h.orchestrator
        .handle_signal(relay("S2-0", "S1-0", RelayPayload::Answer(answer())))
        .await;
    // Duplicate answers are ignored once connected.
    h.orchestrator
        .handle_signal(relay("S2-0", "S1-0", RelayPayload::Answer(answer())))
        .await;
    assert_eq!(
        h.orchestrator.connections()[0].state,
        NegotiationState::Connected
    );
    let applied = h
        .handle(0)
        .negotiator
        .calls()
        .into_iter()
        .filter(|call| matches!(call, Call::AcceptAnswer(_)))
        .count();
    assert_eq!(applied, 1);

    h.handle(0)
        .emit(CapabilityEvent::LocalCandidate(candidate()));
    h.pump().await;
    let relays = h.sent_relays();
    assert_eq!(relays.len(), 1);
    assert_eq!(relays[0].source, peer("S1-0"));
    assert_eq!(relays[0].destination, peer("S2-0"));
    assert_eq!(relays[0].candidate, Some(candidate()));
}

#[test_timeout::tokio_timeout_test]
async fn rendezvous_errors_are_counted() {
    let mut h = Harness::new();
    h.orchestrator
        .handle_signal(ServerFrame::Error(ErrorReply::unknown_target(Some(
            "ghost-0".into(),
        ))))
        .await;
    assert_eq!(h.counters.get(Counter::SignalingErrors), 1);
    assert!(h.sent().is_empty());
}

#[test_timeout::tokio_timeout_test]
async fn transport_failure_is_counted_without_retry() {
    let mut h = Harness::new();
    h.orchestrator.create_peer(peer("S1-0")).unwrap();
    h.orchestrator.handle_signal(assign("S1-0", "S2-0")).await;
    h.pump().await;
    h.sent();

    h.handle(0)
        .emit(CapabilityEvent::IceConnectionState(LinkState::Failed));
    h.pump().await;

    assert_eq!(h.counters.get(Counter::FailedIceConnections), 1);
    assert_eq!(
        h.orchestrator.connections()[0].state,
        NegotiationState::Failed
    );
    assert!(h.sent().is_empty());
    assert_eq!(h.factory.handles().len(), 1);
}

#[test_timeout::tokio_timeout_test]
async fn heartbeat_goes_only_to_ready_channels() {
    let mut h = Harness::new();
    h.orchestrator.create_peer(peer("S2-0")).unwrap();
    h.orchestrator
        .handle_signal(relay("S1-0", "S2-0", RelayPayload::Offer(offer())))
        .await;
    h.orchestrator
        .handle_signal(relay("S3-0", "S2-0", RelayPayload::Offer(offer())))
        .await;

    h.handle(0).emit(CapabilityEvent::ChannelOpen);
    h.pump().await;
    h.orchestrator.publish(&peer("S2-0")).await;

    let sent = h.handle(0).negotiator.sent_texts();
    assert_eq!(sent.len(), 1);
    let heartbeat: Value = serde_json::from_str(&sent[0]).unwrap();
    assert_eq!(heartbeat["str"], HEARTBEAT_TEXT);
    assert!(heartbeat["time"].as_i64().unwrap() > 0);

    assert!(h.handle(1).negotiator.sent_texts().is_empty());
    assert_eq!(h.counters.get(Counter::DataChannelsOpened), 1);
}

#[test_timeout::tokio_timeout_test]
async fn liveness_ticks_until_teardown() {
    let mut h = Harness::with_publish_interval(Duration::from_millis(20));
    h.orchestrator.create_peer(peer("S1-0")).unwrap();

    let tick = tokio::time::timeout(Duration::from_secs(2), h.inbox.ticks.recv())
        .await
        .unwrap();
    assert_eq!(tick, Some(peer("S1-0")));

    h.orchestrator.teardown_peer(&peer("S1-0")).await.unwrap();
    while h.inbox.ticks.try_recv().is_ok() {}
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(h.inbox.ticks.try_recv().is_err());
}

#[test_timeout::tokio_timeout_test]
async fn teardown_closes_connections_and_ignores_late_events() {
    let mut h = Harness::new();
    h.orchestrator.create_peer(peer("S1-0")).unwrap();
    h.orchestrator.handle_signal(assign("S1-0", "S2-0")).await;
    h.pump().await;

    let handle = h.handle(0);
    h.orchestrator.teardown_peer(&peer("S1-0")).await.unwrap();
    assert!(handle.negotiator.is_closed());
    assert!(h.orchestrator.connections().is_empty());
    assert!(h.orchestrator.peer_ids().is_empty());

    handle.emit(CapabilityEvent::ChannelOpen);
    handle.emit(CapabilityEvent::LocalCandidate(candidate()));
    h.sent();
    h.pump().await;
    h.orchestrator.publish(&peer("S1-0")).await;

    assert_eq!(h.counters.get(Counter::DataChannelsOpened), 0);
    assert!(h.sent().is_empty());
    assert!(matches!(
        h.orchestrator.teardown_peer(&peer("S1-0")).await,
        Err(MeshError::UnknownPeer(_))
    ));
}

#[test_timeout::tokio_timeout_test]
async fn teardown_all_removes_every_peer() {
    let mut h = Harness::new();
    for id in ["S1-0", "S1-1", "S1-2"] {
        h.orchestrator.create_peer(peer(id)).unwrap();
    }
    h.orchestrator.handle_signal(assign("S1-1", "S2-0")).await;
    h.orchestrator
        .handle_signal(relay("S3-0", "S1-2", RelayPayload::Offer(offer())))
        .await;
    assert_eq!(h.orchestrator.connections().len(), 2);

    h.orchestrator.teardown_all().await;

    assert!(h.orchestrator.peer_ids().is_empty());
    assert!(h.orchestrator.connections().is_empty());
    assert!(h
        .factory
        .handles()
        .iter()
        .all(|handle| handle.negotiator.is_closed()));
}

#[test_timeout::tokio_timeout_test]
async fn unregistered_peer_is_not_kept() {
    let (signal, outgoing) = SignalSender::channel();
    drop(outgoing);
    let (mut orchestrator, mut inbox) = Orchestrator::new(
        ScriptedFactory::new(),
        signal,
        Arc::new(MeshCounters::new()),
        Duration::from_millis(10),
        HEARTBEAT_TEXT,
    )
    .unwrap();

    let err = orchestrator.create_peer(peer("S1-0")).unwrap_err();
    assert!(matches!(err, MeshError::ChannelClosed));
    assert!(orchestrator.peer_ids().is_empty());

    // No liveness task was left behind, and a retry is not a duplicate.
    sleep_past_ticks().await;
    assert!(inbox.ticks.try_recv().is_err());
    assert!(matches!(
        orchestrator.create_peer(peer("S1-0")),
        Err(MeshError::ChannelClosed)
    ));
}

#[test_timeout::tokio_timeout_test]
async fn zero_publish_interval_is_rejected() {
    let (signal, _outgoing) = SignalSender::channel();
    let result = Orchestrator::new(
        ScriptedFactory::new(),
        signal,
        Arc::new(MeshCounters::new()),
        Duration::ZERO,
        HEARTBEAT_TEXT,
    );
    assert!(matches!(result, Err(MeshError::Setup(_))));
}

#[test_timeout::tokio_timeout_test]
async fn errors_with_unfamiliar_codes_are_counted() {
    let mut h = Harness::new();
    let frame = ServerFrame::parse(r#"{"code":"ERROR","errorCode":"RATE_LIMITED"}"#).unwrap();
    h.orchestrator.handle_signal(frame).await;
    assert_eq!(h.counters.get(Counter::SignalingErrors), 1);

    h.orchestrator
        .handle_signal(ServerFrame::Error(ErrorReply::new(ErrorCode::DuplicatePeerId)))
        .await;
    assert_eq!(h.counters.get(Counter::SignalingErrors), 2);
}

async fn sleep_past_ticks() {
    tokio::time::sleep(Duration::from_millis(50)).await;
}
