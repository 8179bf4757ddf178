use bytes::Bytes;
use hearth_protocol::{IceCandidate, SignalEnvelope};
use hearth_session::{Role, RoomInfo, RoomSession, SessionError, SessionEvent, SessionOptions};
use hearth_signaling::test_utils::RecvWithTimeoutExt;
use hearth_signaling::transport::mock::MockTransport;
use hearth_webrtc::IceConfig;
use hearth_webrtc::media::mock::MockAudioSource;
use hearth_webrtc::peer::{NegotiationState, Peer};
use pretty_assertions::assert_matches;
use std::sync::Arc;
use std::time::Duration;
use test_log::test;
use tokio::sync::{broadcast, mpsc};
use tokio_tungstenite::tungstenite;
use tokio_util::sync::CancellationToken;

const TIMEOUT: Duration = Duration::from_millis(1000);
const SETTLE: Duration = Duration::from_millis(100);

struct TestSession {
    session: RoomSession,
    transport: MockTransport,
    outgoing_rx: broadcast::Receiver<tungstenite::Message>,
    _audio_rx: mpsc::Receiver<Bytes>,
}

fn test_options() -> SessionOptions {
    SessionOptions {
        listen_on_broadcast: false,
        ice: IceConfig::none(),
    }
}

async fn join_session(
    local_user_id: &str,
    broadcaster_id: &str,
    options: SessionOptions,
    source: MockAudioSource,
) -> TestSession {
    let transport = MockTransport::default();
    let outgoing_rx = transport.outgoing_tx.subscribe();
    let (audio_tx, audio_rx) = mpsc::channel(32);

    let session = RoomSession::join(
        &transport,
        RoomInfo {
            room_id: "room1".to_string(),
            broadcaster_id: broadcaster_id.to_string(),
        },
        local_user_id,
        options,
        Arc::new(source),
        audio_tx,
        CancellationToken::new(),
    )
    .await
    .expect("Session failed to join");

    TestSession {
        session,
        transport,
        outgoing_rx,
        _audio_rx: audio_rx,
    }
}

async fn join_broadcaster() -> TestSession {
    join_session(
        "user1",
        "user1",
        test_options(),
        MockAudioSource::with_frames(vec![Bytes::from_static(b"frame")]),
    )
    .await
}

async fn join_receiver() -> TestSession {
    join_session(
        "user2",
        "user1",
        test_options(),
        MockAudioSource::with_frames(Vec::new()),
    )
    .await
}

async fn expect_envelope<F>(
    outgoing_rx: &mut broadcast::Receiver<tungstenite::Message>,
    predicate: F,
) -> SignalEnvelope
where
    F: Fn(&SignalEnvelope) -> bool + Send + Sync,
{
    let msg = outgoing_rx
        .recv_with_timeout(TIMEOUT, |msg| {
            matches!(
                msg,
                tungstenite::Message::Text(text)
                    if SignalEnvelope::deserialize(text).map(|e| predicate(&e)).unwrap_or(false)
            )
        })
        .await
        .expect("Expected envelope was not sent");

    match msg {
        tungstenite::Message::Text(text) => {
            SignalEnvelope::deserialize(&text).expect("Envelope no longer deserializes")
        }
        _ => unreachable!(),
    }
}

async fn expect_no_envelope<F>(
    outgoing_rx: &mut broadcast::Receiver<tungstenite::Message>,
    predicate: F,
) where
    F: Fn(&SignalEnvelope) -> bool + Send + Sync,
{
    let result = outgoing_rx
        .recv_with_timeout(SETTLE, |msg| {
            matches!(
                msg,
                tungstenite::Message::Text(text)
                    if SignalEnvelope::deserialize(text).map(|e| predicate(&e)).unwrap_or(false)
            )
        })
        .await;
    assert!(result.is_err(), "Unexpected envelope was sent");
}

async fn wait_for_connection_state(session: &RoomSession, user_id: &str, state: NegotiationState) {
    let deadline = tokio::time::Instant::now() + TIMEOUT;
    loop {
        if session
            .active_connections()
            .iter()
            .any(|conn| conn.user_id == user_id && conn.state == state)
        {
            return;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "Connection for {user_id} never reached {state:?}, got {:?}",
            session.active_connections(),
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

fn host_candidate() -> IceCandidate {
    IceCandidate {
        candidate: "candidate:1 1 UDP 2122252543 192.0.2.1 54321 typ host".to_string(),
        sdp_mid: Some("0".to_string()),
        sdp_mline_index: Some(0),
        username_fragment: None,
    }
}

#[test(tokio::test)]
async fn broadcaster_registry_tracks_membership() {
    let mut rig = join_broadcaster().await;
    assert_eq!(rig.session.role(), Role::Broadcaster);

    rig.transport
        .push_envelope(&SignalEnvelope::UserJoined {
            user_id: "user2".to_string(),
        })
        .unwrap();
    expect_envelope(&mut rig.outgoing_rx, |e| {
        matches!(e, SignalEnvelope::JoinChannelRequest { receiver_id, .. } if receiver_id == "user2")
    })
    .await;

    rig.transport
        .push_envelope(&SignalEnvelope::UserJoined {
            user_id: "user3".to_string(),
        })
        .unwrap();
    expect_envelope(&mut rig.outgoing_rx, |e| {
        matches!(e, SignalEnvelope::JoinChannelRequest { receiver_id, .. } if receiver_id == "user3")
    })
    .await;

    assert_eq!(rig.session.connected_users(), vec!["user2", "user3"]);
    assert_eq!(rig.session.active_connections().len(), 2);

    rig.transport
        .push_envelope(&SignalEnvelope::UserLeft {
            user_id: "user2".to_string(),
        })
        .unwrap();
    expect_envelope(&mut rig.outgoing_rx, |e| {
        matches!(e, SignalEnvelope::LeaveChannelRequest { receiver_id, .. } if receiver_id == "user2")
    })
    .await;
    assert_eq!(rig.session.connected_users(), vec!["user3"]);

    // Repeated leave for an absent user is a no-op and must not produce a
    // second farewell.
    rig.transport
        .push_envelope(&SignalEnvelope::UserLeft {
            user_id: "user2".to_string(),
        })
        .unwrap();
    expect_no_envelope(&mut rig.outgoing_rx, |e| {
        matches!(e, SignalEnvelope::LeaveChannelRequest { receiver_id, .. } if receiver_id == "user2")
    })
    .await;
    assert_eq!(rig.session.connected_users(), vec!["user3"]);

    // A late candidate for the departed user is dropped silently.
    rig.transport
        .push_envelope(&SignalEnvelope::Candidate {
            candidate: host_candidate(),
            broadcaster_id: "user1".to_string(),
            receiver_id: "user2".to_string(),
        })
        .unwrap();
    tokio::time::sleep(SETTLE).await;
    assert_eq!(rig.session.active_connections().len(), 1);
}

#[test(tokio::test)]
async fn unknown_user_envelopes_are_noops() {
    let mut rig = join_broadcaster().await;

    rig.transport
        .push_envelope(&SignalEnvelope::Answer {
            answer: hearth_protocol::SessionDescription::answer("sdp"),
            broadcaster_id: "user1".to_string(),
            receiver_id: "user9".to_string(),
        })
        .unwrap();
    rig.transport
        .push_envelope(&SignalEnvelope::Candidate {
            candidate: host_candidate(),
            broadcaster_id: "user1".to_string(),
            receiver_id: "user9".to_string(),
        })
        .unwrap();

    tokio::time::sleep(SETTLE).await;
    assert!(rig.session.active_connections().is_empty());
    assert!(rig.session.connected_users().is_empty());
    expect_no_envelope(&mut rig.outgoing_rx, |_| true).await;
}

#[test(tokio::test)]
async fn receiver_offer_answer_round_trip() {
    let mut rig = join_receiver().await;
    assert_eq!(rig.session.role(), Role::Receiver);

    // One eagerly created connection toward the broadcaster.
    let connections = rig.session.active_connections();
    assert_eq!(connections.len(), 1);
    assert_eq!(connections[0].user_id, "user1");
    assert_eq!(connections[0].state, NegotiationState::Created);

    rig.session.listen_to_broadcaster().await.unwrap();
    expect_envelope(&mut rig.outgoing_rx, |e| {
        matches!(
            e,
            SignalEnvelope::JoinChannelRequest { broadcaster_id, receiver_id }
                if broadcaster_id == "user1" && receiver_id == "user2"
        )
    })
    .await;

    // Remote side of the link: the broadcaster's connection toward user2.
    let remote = Peer::new("user2", IceConfig::none()).await.unwrap();
    let offer = remote.create_offer().await.unwrap();
    rig.transport
        .push_envelope(&SignalEnvelope::Offer {
            offer,
            broadcaster_id: "user1".to_string(),
            receiver_id: "user2".to_string(),
        })
        .unwrap();

    let envelope = expect_envelope(&mut rig.outgoing_rx, |e| {
        matches!(e, SignalEnvelope::Answer { .. })
    })
    .await;
    let SignalEnvelope::Answer {
        answer,
        broadcaster_id,
        receiver_id,
    } = envelope
    else {
        unreachable!();
    };
    assert_eq!(answer.sdp_type, "answer");
    assert_eq!(broadcaster_id, "user1");
    assert_eq!(receiver_id, "user2");
    remote.accept_answer(&answer).await.unwrap();

    wait_for_connection_state(&rig.session, "user1", NegotiationState::Answered).await;

    // Exactly one answer for one offer.
    expect_no_envelope(&mut rig.outgoing_rx, |e| {
        matches!(e, SignalEnvelope::Answer { .. })
    })
    .await;
}

#[test(tokio::test)]
async fn double_listen_is_rejected() {
    let mut rig = join_receiver().await;

    rig.session.listen_to_broadcaster().await.unwrap();
    let result = rig.session.listen_to_broadcaster().await;
    assert_matches!(result, Err(SessionError::AlreadyListening));

    rig.session.stop_listening().await.unwrap();
    expect_envelope(&mut rig.outgoing_rx, |e| {
        matches!(
            e,
            SignalEnvelope::LeaveChannelRequest { receiver_id, .. } if receiver_id == "user2"
        )
    })
    .await;

    // The connection was discarded and replaced with a fresh one.
    let connections = rig.session.active_connections();
    assert_eq!(connections.len(), 1);
    assert_eq!(connections[0].state, NegotiationState::Created);

    rig.session.listen_to_broadcaster().await.unwrap();
}

#[test(tokio::test)]
async fn broadcast_attaches_and_detaches_per_recipient() {
    let mut rig = join_broadcaster().await;

    for user in ["user2", "user3"] {
        rig.transport
            .push_envelope(&SignalEnvelope::UserJoined {
                user_id: user.to_string(),
            })
            .unwrap();
        expect_envelope(&mut rig.outgoing_rx, |e| {
            matches!(e, SignalEnvelope::JoinChannelRequest { receiver_id, .. } if receiver_id == user)
        })
        .await;
    }

    rig.session.start_broadcasting().await.unwrap();
    expect_envelope(&mut rig.outgoing_rx, |e| {
        matches!(e, SignalEnvelope::StartedBroadcast)
    })
    .await;

    let result = rig.session.start_broadcasting().await;
    assert_matches!(result, Err(SessionError::AlreadyBroadcasting));

    // Stopping removes exactly the attached bindings; the connections stay.
    let before = rig.session.active_connections();
    rig.session.stop_broadcasting().await.unwrap();
    let after = rig.session.active_connections();
    assert_eq!(before, after);
    assert_eq!(after.len(), 2);
    assert!(
        after
            .iter()
            .all(|conn| conn.state != NegotiationState::Closed)
    );

    // A fresh start after a stop is allowed again.
    rig.session.start_broadcasting().await.unwrap();
}

#[test(tokio::test)]
async fn media_failure_leaves_connections_untouched() {
    let mut rig = join_session("user1", "user1", test_options(), MockAudioSource::failing()).await;

    rig.transport
        .push_envelope(&SignalEnvelope::UserJoined {
            user_id: "user2".to_string(),
        })
        .unwrap();
    expect_envelope(&mut rig.outgoing_rx, |e| {
        matches!(e, SignalEnvelope::JoinChannelRequest { .. })
    })
    .await;

    let result = rig.session.start_broadcasting().await;
    assert_matches!(result, Err(SessionError::MediaAcquisitionFailed(_)));

    expect_no_envelope(&mut rig.outgoing_rx, |e| {
        matches!(e, SignalEnvelope::StartedBroadcast)
    })
    .await;
    let connections = rig.session.active_connections();
    assert_eq!(connections.len(), 1);
    assert_ne!(connections[0].state, NegotiationState::Closed);
}

#[test(tokio::test)]
async fn wrong_role_operations_are_rejected() {
    let broadcaster = join_broadcaster().await;
    assert_matches!(
        broadcaster.session.listen_to_broadcaster().await,
        Err(SessionError::WrongRole(Role::Broadcaster))
    );
    assert_matches!(
        broadcaster.session.stop_listening().await,
        Err(SessionError::WrongRole(Role::Broadcaster))
    );

    let receiver = join_receiver().await;
    assert_matches!(
        receiver.session.start_broadcasting().await,
        Err(SessionError::WrongRole(Role::Receiver))
    );
    assert_matches!(
        receiver.session.stop_broadcasting().await,
        Err(SessionError::WrongRole(Role::Receiver))
    );
}

#[test(tokio::test)]
async fn wrong_role_envelopes_are_dropped() {
    // A receiver observing broadcaster-only kinds through relay fan-out.
    let mut receiver = join_receiver().await;
    receiver
        .transport
        .push_envelope(&SignalEnvelope::Answer {
            answer: hearth_protocol::SessionDescription::answer("sdp"),
            broadcaster_id: "user1".to_string(),
            receiver_id: "user3".to_string(),
        })
        .unwrap();
    receiver
        .transport
        .push_envelope(&SignalEnvelope::JoinChannelRequest {
            broadcaster_id: "user1".to_string(),
            receiver_id: "user3".to_string(),
        })
        .unwrap();

    tokio::time::sleep(SETTLE).await;
    let connections = receiver.session.active_connections();
    assert_eq!(connections.len(), 1);
    assert_eq!(connections[0].state, NegotiationState::Created);
    expect_no_envelope(&mut receiver.outgoing_rx, |_| true).await;

    // A broadcaster observing receiver-only kinds.
    let mut broadcaster = join_broadcaster().await;
    broadcaster
        .transport
        .push_envelope(&SignalEnvelope::Offer {
            offer: hearth_protocol::SessionDescription::offer("sdp"),
            broadcaster_id: "user1".to_string(),
            receiver_id: "user2".to_string(),
        })
        .unwrap();
    broadcaster
        .transport
        .push_envelope(&SignalEnvelope::StartedBroadcast)
        .unwrap();

    tokio::time::sleep(SETTLE).await;
    assert!(broadcaster.session.active_connections().is_empty());
    expect_no_envelope(&mut broadcaster.outgoing_rx, |_| true).await;
}

#[test(tokio::test)]
async fn broadcaster_offer_flow_reaches_answered() {
    let mut rig = join_broadcaster().await;

    rig.transport
        .push_envelope(&SignalEnvelope::UserJoined {
            user_id: "user2".to_string(),
        })
        .unwrap();
    expect_envelope(&mut rig.outgoing_rx, |e| {
        matches!(e, SignalEnvelope::JoinChannelRequest { .. })
    })
    .await;

    // The receiver asks to join; the broadcaster must produce the offer.
    rig.transport
        .push_envelope(&SignalEnvelope::JoinChannelRequest {
            broadcaster_id: "user1".to_string(),
            receiver_id: "user2".to_string(),
        })
        .unwrap();

    let envelope = expect_envelope(&mut rig.outgoing_rx, |e| {
        matches!(e, SignalEnvelope::Offer { .. })
    })
    .await;
    let SignalEnvelope::Offer {
        offer, receiver_id, ..
    } = envelope
    else {
        unreachable!();
    };
    assert_eq!(offer.sdp_type, "offer");
    assert_eq!(receiver_id, "user2");
    wait_for_connection_state(&rig.session, "user2", NegotiationState::OfferSent).await;

    // Remote side answers.
    let remote = Peer::new("user1", IceConfig::none()).await.unwrap();
    let answer = remote.accept_offer(&offer).await.unwrap();
    rig.transport
        .push_envelope(&SignalEnvelope::Answer {
            answer,
            broadcaster_id: "user1".to_string(),
            receiver_id: "user2".to_string(),
        })
        .unwrap();
    wait_for_connection_state(&rig.session, "user2", NegotiationState::Answered).await;

    // Late candidates must not regress the state, even unusable ones.
    rig.transport
        .push_envelope(&SignalEnvelope::Candidate {
            candidate: host_candidate(),
            broadcaster_id: "user1".to_string(),
            receiver_id: "user2".to_string(),
        })
        .unwrap();
    tokio::time::sleep(SETTLE).await;
    wait_for_connection_state(&rig.session, "user2", NegotiationState::Answered).await;
}

#[test(tokio::test)]
async fn auto_listen_reacts_to_broadcast_announcement() {
    let options = SessionOptions {
        listen_on_broadcast: true,
        ice: IceConfig::none(),
    };
    let mut rig = join_session(
        "user2",
        "user1",
        options,
        MockAudioSource::with_frames(Vec::new()),
    )
    .await;
    let mut events = rig.session.subscribe();

    rig.transport
        .push_envelope(&SignalEnvelope::StartedBroadcast)
        .unwrap();

    expect_envelope(&mut rig.outgoing_rx, |e| {
        matches!(
            e,
            SignalEnvelope::JoinChannelRequest { receiver_id, .. } if receiver_id == "user2"
        )
    })
    .await;
    let event = events
        .recv_with_timeout(TIMEOUT, |e| matches!(e, SessionEvent::BroadcastStarted))
        .await;
    assert!(event.is_ok());

    // A repeated announcement while already listening stays quiet.
    rig.transport
        .push_envelope(&SignalEnvelope::StartedBroadcast)
        .unwrap();
    expect_no_envelope(&mut rig.outgoing_rx, |e| {
        matches!(e, SignalEnvelope::JoinChannelRequest { .. })
    })
    .await;
}

#[test(tokio::test)]
async fn receiver_resets_when_broadcaster_leaves() {
    let mut rig = join_receiver().await;

    rig.session.listen_to_broadcaster().await.unwrap();
    expect_envelope(&mut rig.outgoing_rx, |e| {
        matches!(e, SignalEnvelope::JoinChannelRequest { .. })
    })
    .await;

    rig.transport
        .push_envelope(&SignalEnvelope::UserLeft {
            user_id: "user1".to_string(),
        })
        .unwrap();
    tokio::time::sleep(SETTLE).await;

    // Fresh connection, ready for a clean renegotiation.
    let connections = rig.session.active_connections();
    assert_eq!(connections.len(), 1);
    assert_eq!(connections[0].state, NegotiationState::Created);
    rig.session.listen_to_broadcaster().await.unwrap();
}

#[test(tokio::test)]
async fn receiver_resets_on_leave_channel_request() {
    let mut rig = join_receiver().await;

    rig.session.listen_to_broadcaster().await.unwrap();
    expect_envelope(&mut rig.outgoing_rx, |e| {
        matches!(e, SignalEnvelope::JoinChannelRequest { .. })
    })
    .await;

    rig.transport
        .push_envelope(&SignalEnvelope::LeaveChannelRequest {
            broadcaster_id: "user1".to_string(),
            receiver_id: "user2".to_string(),
        })
        .unwrap();
    tokio::time::sleep(SETTLE).await;

    let connections = rig.session.active_connections();
    assert_eq!(connections.len(), 1);
    assert_eq!(connections[0].state, NegotiationState::Created);
    rig.session.listen_to_broadcaster().await.unwrap();
}

#[test(tokio::test)]
async fn channel_closed_tears_down_session() {
    let mut rig = join_broadcaster().await;
    let mut events = rig.session.subscribe();

    rig.transport
        .push_envelope(&SignalEnvelope::UserJoined {
            user_id: "user2".to_string(),
        })
        .unwrap();
    expect_envelope(&mut rig.outgoing_rx, |e| {
        matches!(e, SignalEnvelope::JoinChannelRequest { .. })
    })
    .await;

    rig.transport.disconnect_token().cancel();

    let event = events
        .recv_with_timeout(TIMEOUT, |e| matches!(e, SessionEvent::ChannelClosed))
        .await;
    assert!(event.is_ok());

    tokio::time::sleep(SETTLE).await;
    assert!(rig.session.active_connections().is_empty());

    let result = rig.session.start_broadcasting().await;
    assert_matches!(result, Err(SessionError::ChannelClosed));
}

#[test(tokio::test)]
async fn leave_closes_every_connection() {
    let mut rig = join_broadcaster().await;

    rig.transport
        .push_envelope(&SignalEnvelope::UserJoined {
            user_id: "user2".to_string(),
        })
        .unwrap();
    expect_envelope(&mut rig.outgoing_rx, |e| {
        matches!(e, SignalEnvelope::JoinChannelRequest { .. })
    })
    .await;

    rig.session.leave().await;

    assert!(rig.session.active_connections().is_empty());
    let result = rig.session.start_broadcasting().await;
    assert_matches!(result, Err(SessionError::ChannelClosed));
}
