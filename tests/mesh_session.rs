//! End-to-end negotiation scenarios over in-process mocks: a scripted
//! signaling server and a scripted media engine.

use mesh_rtc::media::mock::MockMediaEngine;
use mesh_rtc::protocol::{SdpKind, SdpPayload, UserListPayload};
use mesh_rtc::signaling::mock::{MockConnector, MockSignalingHandle};
use mesh_rtc::{
    IceCandidate, IceServer, MediaError, MeshEvent, MeshSession, ParticipantId, RtcConfig,
    SignalMessage,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout};

const WAIT: Duration = Duration::from_secs(2);
const SETTLE: Duration = Duration::from_millis(30);

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn setup(
    config: RtcConfig,
) -> (
    Arc<MockMediaEngine>,
    MeshSession,
    MockSignalingHandle,
    mpsc::UnboundedReceiver<MeshEvent>,
) {
    init_tracing();
    let engine = MockMediaEngine::new();
    let connector = Arc::new(MockConnector::new());
    let handle = connector.expect_connect();
    let (session, events) = MeshSession::new(engine.clone(), connector, config);
    (engine, session, handle, events)
}

async fn next_sent(handle: &mut MockSignalingHandle) -> SignalMessage {
    timeout(WAIT, handle.sent())
        .await
        .expect("timed out waiting for outbound message")
        .expect("signaling channel closed")
}

async fn next_event(events: &mut mpsc::UnboundedReceiver<MeshEvent>) -> MeshEvent {
    timeout(WAIT, events.recv())
        .await
        .expect("timed out waiting for event")
        .expect("event channel closed")
}

fn user_list(users: &[&str]) -> SignalMessage {
    SignalMessage::UserList {
        data: UserListPayload {
            users: users.iter().map(|u| ParticipantId::new(*u)).collect(),
        },
    }
}

fn sdp_message(kind: SdpKind, from: &str, to: &str, sdp: &str) -> SignalMessage {
    let payload = SdpPayload {
        sdp: sdp.into(),
        kind,
    };
    match kind {
        SdpKind::Offer => SignalMessage::Offer {
            uid: from.into(),
            to_uid: Some(to.into()),
            channel_id: None,
            data: payload,
        },
        SdpKind::Answer => SignalMessage::Answer {
            uid: from.into(),
            to_uid: Some(to.into()),
            channel_id: None,
            data: payload,
        },
    }
}

fn candidate(n: u16) -> IceCandidate {
    IceCandidate {
        candidate: format!("candidate:{n} 1 udp 2113937151 203.0.113.7 {} typ host", 50000 + n),
        sdp_mline_index: 0,
        sdp_mid: "0".into(),
    }
}

fn candidate_message(n: u16, from: &str, to: &str) -> SignalMessage {
    SignalMessage::IceCandidate {
        uid: from.into(),
        to_uid: Some(to.into()),
        channel_id: None,
        data: candidate(n).into(),
    }
}

#[tokio::test]
async fn offering_side_sends_offer_then_buffered_candidates_in_order() {
    let (engine, session, mut server, mut events) = setup(RtcConfig::default());
    session.join("room", "alice", "").await.unwrap();

    match next_sent(&mut server).await {
        SignalMessage::Join { channel_id, uid } => {
            assert_eq!(channel_id, "room");
            assert_eq!(uid.as_str(), "alice");
        }
        other => panic!("expected join, got {other:?}"),
    }

    // Hold the offer so candidates gather while it is still pending.
    engine.hold_offers();
    server.deliver(user_list(&["alice", "bob"]));
    engine.wait_for_connections(1).await;
    let connection = engine.connection(0);
    connection.emit_candidate(candidate(1));
    connection.emit_candidate(candidate(2));
    sleep(SETTLE).await;
    assert!(
        server.try_sent().is_none(),
        "candidates must not leave before the offer"
    );

    engine.release_offer();
    match next_sent(&mut server).await {
        SignalMessage::Offer {
            uid,
            to_uid,
            channel_id,
            data,
        } => {
            assert_eq!(uid.as_str(), "alice");
            assert_eq!(to_uid, Some("bob".into()));
            assert_eq!(channel_id.as_deref(), Some("room"));
            assert_eq!(data.sdp, "mock-offer-0");
        }
        other => panic!("expected offer, got {other:?}"),
    }
    for expected in [candidate(1), candidate(2)] {
        match next_sent(&mut server).await {
            SignalMessage::IceCandidate { to_uid, data, .. } => {
                assert_eq!(to_uid, Some("bob".into()));
                assert_eq!(IceCandidate::from(data), expected);
            }
            other => panic!("expected candidate, got {other:?}"),
        }
    }

    server.deliver(sdp_message(SdpKind::Answer, "bob", "alice", "bob-answer"));
    match next_event(&mut events).await {
        MeshEvent::NegotiationComplete { id } => assert_eq!(id.as_str(), "bob"),
        other => panic!("expected negotiation complete, got {other:?}"),
    }
    assert_eq!(
        connection.remote_description(),
        Some((SdpKind::Answer, "bob-answer".into()))
    );
}

#[tokio::test]
async fn answering_side_buffers_remote_candidates_until_offer_applied() {
    let (engine, session, mut server, mut events) = setup(RtcConfig::default());
    session.join("room", "bob", "").await.unwrap();
    let _join = next_sent(&mut server).await;

    // Candidates trickle in ahead of the offer they belong to.
    server.deliver(candidate_message(1, "alice", "bob"));
    server.deliver(candidate_message(2, "alice", "bob"));
    engine.wait_for_connections(1).await;
    let connection = engine.connection(0);
    sleep(SETTLE).await;
    assert!(connection.applied_candidates().is_empty());

    server.deliver(sdp_message(SdpKind::Offer, "alice", "bob", "alice-offer"));
    match next_sent(&mut server).await {
        SignalMessage::Answer { to_uid, data, .. } => {
            assert_eq!(to_uid, Some("alice".into()));
            assert_eq!(data.sdp, "mock-answer-0");
        }
        other => panic!("expected answer, got {other:?}"),
    }
    match next_event(&mut events).await {
        MeshEvent::NegotiationComplete { id } => assert_eq!(id.as_str(), "alice"),
        other => panic!("expected negotiation complete, got {other:?}"),
    }

    // One late candidate lands behind the flushed batch.
    server.deliver(candidate_message(3, "alice", "bob"));
    sleep(SETTLE).await;
    assert_eq!(
        connection.applied_candidates(),
        vec![candidate(1), candidate(2), candidate(3)]
    );

    let constraints = connection.answer_constraints().expect("answer was created");
    assert!(constraints.receive_audio);
    assert!(!constraints.receive_video);
}

#[tokio::test]
async fn offer_role_follows_identifier_order() {
    // As the higher-sorted side, seeing the lower one never triggers an offer.
    let (engine, session, mut server, _events) = setup(RtcConfig::default());
    session.join("room", "bob", "").await.unwrap();
    let _join = next_sent(&mut server).await;
    server.deliver(user_list(&["alice", "bob"]));
    engine.wait_for_connections(1).await;
    sleep(SETTLE).await;
    assert!(server.try_sent().is_none(), "higher-sorted side must wait");
}

#[tokio::test]
async fn repeated_membership_messages_do_not_duplicate_offers_or_events() {
    let (engine, session, mut server, mut events) = setup(RtcConfig::default());
    session.join("room", "alice", "").await.unwrap();
    let _join = next_sent(&mut server).await;

    server.deliver(user_list(&["alice", "bob"]));
    server.deliver(SignalMessage::UserJoined { uid: "bob".into() });
    server.deliver(SignalMessage::UserJoined { uid: "bob".into() });

    match next_sent(&mut server).await {
        SignalMessage::Offer { .. } => {}
        other => panic!("expected offer, got {other:?}"),
    }
    sleep(SETTLE).await;
    assert!(server.try_sent().is_none(), "only one offer per link");
    assert_eq!(engine.connections().len(), 1);

    server.deliver(SignalMessage::UserLeft {
        uid: "bob".into(),
        reason: None,
    });
    server.deliver(SignalMessage::UserLeft {
        uid: "bob".into(),
        reason: None,
    });
    match next_event(&mut events).await {
        MeshEvent::ParticipantLeft { id, reason } => {
            assert_eq!(id.as_str(), "bob");
            assert_eq!(reason, "quit");
        }
        other => panic!("expected participant left, got {other:?}"),
    }
    sleep(SETTLE).await;
    assert!(
        events.try_recv().is_err(),
        "second departure must be a no-op"
    );
    assert!(engine.connection(0).is_closed());
}

#[tokio::test]
async fn counter_offer_after_winning_glare_is_dropped() {
    let (engine, session, mut server, _events) = setup(RtcConfig::default());
    session.join("room", "alice", "").await.unwrap();
    let _join = next_sent(&mut server).await;

    server.deliver(user_list(&["alice", "bob"]));
    match next_sent(&mut server).await {
        SignalMessage::Offer { .. } => {}
        other => panic!("expected offer, got {other:?}"),
    }

    // Bob is the higher-sorted peer; its offer violates the role rule.
    server.deliver(sdp_message(SdpKind::Offer, "bob", "alice", "bogus"));
    sleep(SETTLE).await;
    assert_eq!(engine.connection(0).remote_description(), None);
    assert!(server.try_sent().is_none(), "no answer to a dropped offer");
}

#[tokio::test]
async fn failed_remote_description_is_reported_and_retriable() {
    let (engine, session, mut server, mut events) = setup(RtcConfig::default());
    session.join("room", "bob", "").await.unwrap();
    let _join = next_sent(&mut server).await;

    engine.fail_remote_descriptions(true);
    server.deliver(sdp_message(SdpKind::Offer, "alice", "bob", "alice-offer"));
    match next_event(&mut events).await {
        MeshEvent::NegotiationFailed { id, error } => {
            assert_eq!(id.as_str(), "alice");
            assert!(matches!(error, MediaError::SetRemoteDescription(_)));
        }
        other => panic!("expected negotiation failure, got {other:?}"),
    }
    sleep(SETTLE).await;
    assert!(server.try_sent().is_none(), "no answer after a failed apply");

    // The link stays usable; a retransmitted offer goes through.
    engine.fail_remote_descriptions(false);
    server.deliver(sdp_message(SdpKind::Offer, "alice", "bob", "alice-offer"));
    match next_sent(&mut server).await {
        SignalMessage::Answer { to_uid, .. } => assert_eq!(to_uid, Some("alice".into())),
        other => panic!("expected answer, got {other:?}"),
    }
    match next_event(&mut events).await {
        MeshEvent::NegotiationComplete { id } => assert_eq!(id.as_str(), "alice"),
        other => panic!("expected negotiation complete, got {other:?}"),
    }
}

#[tokio::test]
async fn leave_announces_closes_links_and_discards_stale_completions() {
    let (engine, session, mut server, _events) = setup(RtcConfig::default());
    session.join("room", "alice", "").await.unwrap();
    let _join = next_sent(&mut server).await;

    engine.hold_offers();
    server.deliver(user_list(&["alice", "bob"]));
    engine.wait_for_connections(1).await;

    session.leave().await;
    match next_sent(&mut server).await {
        SignalMessage::Leave { channel_id, uid } => {
            assert_eq!(channel_id, "room");
            assert_eq!(uid.as_str(), "alice");
        }
        other => panic!("expected leave, got {other:?}"),
    }

    // The offer completes after the channel is gone; it must go nowhere.
    engine.release_offer();
    sleep(SETTLE).await;
    assert!(server.try_sent().is_none());
    engine.wait_for_connections(1).await;
    for _ in 0..100 {
        if engine.connection(0).is_closed() {
            return;
        }
        sleep(Duration::from_millis(2)).await;
    }
    panic!("connection was not closed on leave");
}

#[tokio::test]
async fn credential_renewal_reaches_live_handles_and_future_links() {
    let config = RtcConfig {
        ice_servers: vec![
            IceServer::stun("stun:stun.example.org:3478"),
            IceServer::turn("turn:turn.example.org:3478", "user", "seed"),
        ],
    };
    let (engine, session, mut server, _events) = setup(config);
    session.join("room", "alice", "tok-1").await.unwrap();
    let _join = next_sent(&mut server).await;

    server.deliver(SignalMessage::UserJoined { uid: "bob".into() });
    engine.wait_for_connections(1).await;
    let first = engine.connection(0);
    assert_eq!(
        first.config().ice_servers[1].credential.as_deref(),
        Some("tok-1")
    );

    session.renew_credential("tok-2");
    for _ in 0..100 {
        if first.renewed_credential().is_some() {
            break;
        }
        sleep(Duration::from_millis(2)).await;
    }
    assert_eq!(first.renewed_credential().as_deref(), Some("tok-2"));

    // An empty renewal is ignored.
    session.renew_credential("");
    sleep(SETTLE).await;
    assert_eq!(first.renewed_credential().as_deref(), Some("tok-2"));

    server.deliver(SignalMessage::UserJoined { uid: "carol".into() });
    engine.wait_for_connections(2).await;
    assert_eq!(
        engine.connection(1).config().ice_servers[1].credential.as_deref(),
        Some("tok-2")
    );
}

#[tokio::test]
async fn transport_drop_surfaces_closed_event_and_keeps_links() {
    let (engine, session, mut server, mut events) = setup(RtcConfig::default());
    session.join("room", "alice", "").await.unwrap();
    let _join = next_sent(&mut server).await;

    server.deliver(user_list(&["alice", "bob"]));
    match next_sent(&mut server).await {
        SignalMessage::Offer { .. } => {}
        other => panic!("expected offer, got {other:?}"),
    }

    server.disconnect();
    match next_event(&mut events).await {
        MeshEvent::SignalingClosed => {}
        other => panic!("expected signaling closed, got {other:?}"),
    }
    sleep(SETTLE).await;
    assert!(!engine.connection(0).is_closed(), "links outlive the transport");
}

#[tokio::test]
async fn operations_before_join_and_traffic_after_leave_are_ignored() {
    let (engine, session, mut server, mut events) = setup(RtcConfig::default());

    // Nothing is joined yet; these must be absorbed quietly.
    session.leave().await;
    session.renew_credential("tok-early");
    sleep(SETTLE).await;
    assert!(events.try_recv().is_err());
    assert!(server.try_sent().is_none());
    assert!(engine.connections().is_empty());

    session.join("room", "alice", "").await.unwrap();
    let _join = next_sent(&mut server).await;
    session.leave().await;
    match next_sent(&mut server).await {
        SignalMessage::Leave { .. } => {}
        other => panic!("expected leave, got {other:?}"),
    }

    // Traffic arriving on the old transport after leave goes nowhere.
    server.deliver(user_list(&["alice", "bob"]));
    server.deliver(sdp_message(SdpKind::Offer, "bob", "alice", "late-offer"));
    session.renew_credential("tok-late");
    sleep(SETTLE).await;
    assert!(engine.connections().is_empty(), "no links after leave");
    assert!(server.try_sent().is_none());
    assert!(events.try_recv().is_err());
}

#[tokio::test]
async fn send_failure_during_negotiation_surfaces_signaling_error() {
    let (engine, session, mut server, mut events) = setup(RtcConfig::default());
    session.join("room", "alice", "").await.unwrap();
    let _join = next_sent(&mut server).await;

    // Candidates buffer behind the held offer, then the server goes away
    // entirely, so the offer send (and the flush behind it) must fail.
    engine.hold_offers();
    server.deliver(user_list(&["alice", "bob"]));
    engine.wait_for_connections(1).await;
    let connection = engine.connection(0);
    connection.emit_candidate(candidate(1));
    connection.emit_candidate(candidate(2));
    sleep(SETTLE).await;
    drop(server);
    engine.release_offer();

    let deadline = tokio::time::Instant::now() + WAIT;
    loop {
        match timeout(WAIT, events.recv()).await {
            Ok(Some(MeshEvent::SignalingError { .. })) => break,
            Ok(Some(MeshEvent::SignalingClosed)) => {}
            Ok(Some(other)) => panic!("unexpected event: {other:?}"),
            Ok(None) => panic!("event channel closed"),
            Err(_) => panic!("no signaling error surfaced"),
        }
        assert!(tokio::time::Instant::now() < deadline, "no signaling error surfaced");
    }
}

#[tokio::test]
async fn rejoin_resets_state_and_uses_a_fresh_transport() {
    init_tracing();
    let engine = MockMediaEngine::new();
    let connector = Arc::new(MockConnector::new());
    let mut first = connector.expect_connect();
    let mut second = connector.expect_connect();
    let (session, _events) = MeshSession::new(engine.clone(), connector, RtcConfig::default());

    session.join("room-a", "alice", "").await.unwrap();
    let _join = next_sent(&mut first).await;
    // Keep the offer pending so the old transport sees nothing but the leave.
    engine.hold_offers();
    first.deliver(user_list(&["alice", "bob"]));
    engine.wait_for_connections(1).await;

    session.join("room-b", "alice", "").await.unwrap();
    // Old channel is announced as left before the new join goes out.
    match next_sent(&mut first).await {
        SignalMessage::Leave { channel_id, .. } => assert_eq!(channel_id, "room-a"),
        other => panic!("expected leave, got {other:?}"),
    }
    match next_sent(&mut second).await {
        SignalMessage::Join { channel_id, .. } => assert_eq!(channel_id, "room-b"),
        other => panic!("expected join, got {other:?}"),
    }
    for _ in 0..100 {
        if engine.connection(0).is_closed() {
            return;
        }
        sleep(Duration::from_millis(2)).await;
    }
    panic!("old channel links were not closed on rejoin");
}
