use std::{net::SocketAddr, sync::Arc, time::Duration};

use beach_bonfire_core::{close, Participant, Role, Signal, SignalMessage, Uid, RELAY_UID};
use beach_bonfire_server::{
    serve, AppState, LivenessConfig, RegistryConfig, RoomRegistry, SignalingRelay,
};
use futures_util::{SinkExt, StreamExt};
use tokio::{net::TcpStream, time::timeout};
use tokio_tungstenite::{
    connect_async,
    tungstenite::{Error as WsError, Message},
    MaybeTlsStream, WebSocketStream,
};

type Ws = WebSocketStream<MaybeTlsStream<TcpStream>>;

async fn start(liveness: LivenessConfig) -> (SocketAddr, Arc<AppState>) {
    let relay = SignalingRelay::new(RoomRegistry::new(RegistryConfig::default()), liveness);
    relay.spawn_liveness_sweeper();
    let state = Arc::new(AppState::new(relay, None));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(serve(listener, Arc::clone(&state), std::future::pending()));
    (addr, state)
}

async fn join(addr: SocketAddr, room: &str, uid: Uid, role: &str) -> Ws {
    let url = format!("ws://{addr}/ws?roomId={room}&uid={uid}&role={role}");
    connect_async(url).await.expect("handshake accepted").0
}

async fn next_signal(ws: &mut Ws) -> SignalMessage {
    loop {
        let frame = timeout(Duration::from_secs(2), ws.next())
            .await
            .expect("frame in time")
            .expect("stream open")
            .expect("frame ok");
        if let Message::Text(text) = frame {
            return SignalMessage::decode(&text).expect("valid signal");
        }
    }
}

async fn next_of(ws: &mut Ws, kind: &str) -> SignalMessage {
    loop {
        let message = next_signal(ws).await;
        if message.signal.kind() == kind {
            return message;
        }
    }
}

async fn send(ws: &mut Ws, message: &SignalMessage) {
    ws.send(Message::Text(message.encode().unwrap()))
        .await
        .unwrap();
}

/// Reads participant-updates until one lists `size` participants.
async fn wait_for_roster(ws: &mut Ws, size: usize) -> Vec<Participant> {
    loop {
        let roster = roster_of(&next_of(ws, "participant-update").await);
        if roster.len() == size {
            return roster;
        }
    }
}

fn roster_of(message: &SignalMessage) -> Vec<Participant> {
    match &message.signal {
        Signal::ParticipantUpdate(roster) => roster.participants.clone(),
        other => panic!("expected participant-update, got {other:?}"),
    }
}

#[test_timeout::tokio_timeout_test]
async fn second_join_broadcasts_full_roster_to_both() {
    let (addr, _state) = start(LivenessConfig::default()).await;
    let mut one = join(addr, "r1", 1, "listener").await;
    let first = next_of(&mut one, "participant-update").await;
    assert_eq!(roster_of(&first), vec![Participant::new(1, Role::Listener)]);
    assert_eq!(first.uid, RELAY_UID);

    let mut two = join(addr, "r1", 2, "speaker").await;
    let expected = vec![
        Participant::new(1, Role::Listener),
        Participant::new(2, Role::Speaker),
    ];
    let seen_by_one = next_of(&mut one, "participant-update").await;
    let seen_by_two = next_of(&mut two, "participant-update").await;
    assert_eq!(roster_of(&seen_by_one), expected);
    assert_eq!(seen_by_one, seen_by_two);
}

#[test_timeout::tokio_timeout_test]
async fn offers_are_stamped_with_the_real_sender() {
    let (addr, _state) = start(LivenessConfig::default()).await;
    let mut one = join(addr, "r1", 1, "speaker").await;
    let mut two = join(addr, "r1", 2, "speaker").await;
    wait_for_roster(&mut one, 2).await;

    // Claims to be uid 99; the relay knows better.
    send(&mut one, &SignalMessage::offer("r1".into(), 99, 2, "v=0".into())).await;
    // Nobody is uid 3; silently dropped.
    send(&mut one, &SignalMessage::offer("r1".into(), 1, 3, "v=0".into())).await;

    let offer = next_of(&mut two, "offer").await;
    assert_eq!(offer.uid, 1);
    assert_eq!(offer.signal.from_uid(), Some(1));
    assert_eq!(offer.signal.target_uid(), Some(2));

    send(&mut one, &SignalMessage::heartbeat("r1".into(), 1)).await;
    send(&mut two, &SignalMessage::answer("r1".into(), 2, 1, "v=0 a".into())).await;
    let answer = next_of(&mut one, "answer").await;
    assert_eq!(answer.origin(), 2);
}

#[test_timeout::tokio_timeout_test]
async fn abrupt_close_rebroadcasts_roster() {
    let (addr, state) = start(LivenessConfig::default()).await;
    let mut one = join(addr, "r1", 1, "speaker").await;
    let two = join(addr, "r1", 2, "speaker").await;
    wait_for_roster(&mut one, 2).await;

    drop(two);

    let leave = next_of(&mut one, "leave").await;
    assert!(matches!(leave.signal, Signal::Leave(ref payload) if payload.uid == 2));
    let update = next_of(&mut one, "participant-update").await;
    assert_eq!(roster_of(&update), vec![Participant::new(1, Role::Speaker)]);
    assert_eq!(state.relay().registry().snapshot(&"r1".into()).len(), 1);
}

#[test_timeout::tokio_timeout_test]
async fn silent_participant_is_evicted() {
    let liveness = LivenessConfig {
        heartbeat_interval: Duration::from_millis(100),
        timeout_factor: 2,
    };
    let (addr, _state) = start(liveness).await;
    let mut one = join(addr, "r1", 1, "speaker").await;
    let mut two = join(addr, "r1", 2, "speaker").await;

    let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
    let mut beat = tokio::time::interval(Duration::from_millis(50));
    loop {
        tokio::select! {
            frame = one.next() => {
                let Some(Ok(Message::Text(text))) = frame else { continue };
                let message = SignalMessage::decode(&text).unwrap();
                if let Signal::ParticipantUpdate(roster) = &message.signal {
                    if roster.participants.iter().map(|p| p.uid).collect::<Vec<_>>() == vec![1] {
                        break;
                    }
                }
            }
            _ = beat.tick() => send(&mut one, &SignalMessage::heartbeat("r1".into(), 1)).await,
            _ = tokio::time::sleep_until(deadline) => panic!("uid 2 was never evicted"),
        }
    }

    let close_frame = loop {
        match timeout(Duration::from_secs(2), two.next()).await.unwrap() {
            Some(Ok(Message::Close(frame))) => break frame,
            Some(Ok(_)) => continue,
            other => panic!("expected close frame, got {other:?}"),
        }
    };
    let frame = close_frame.expect("close frame carries a code");
    assert_eq!(u16::from(frame.code), close::POLICY);
    assert_eq!(frame.reason, close::REASON_HEARTBEAT_TIMEOUT);
}

#[test_timeout::tokio_timeout_test]
async fn mute_is_announced_to_the_room() {
    let (addr, _state) = start(LivenessConfig::default()).await;
    let mut one = join(addr, "r1", 1, "listener").await;
    let mut two = join(addr, "r1", 2, "speaker").await;
    wait_for_roster(&mut two, 2).await;

    send(&mut two, &SignalMessage::mute("r1".into(), 2, true)).await;

    let notice = next_of(&mut one, "mute").await;
    assert_eq!(notice.uid, 2);
    loop {
        let roster = roster_of(&next_of(&mut one, "participant-update").await);
        if roster.iter().any(|p| p.uid == 2 && p.is_muted) {
            assert!(roster.iter().any(|p| p.uid == 1 && !p.is_muted));
            break;
        }
    }
}

#[test_timeout::tokio_timeout_test]
async fn duplicate_uid_replaces_older_connection() {
    let (addr, state) = start(LivenessConfig::default()).await;
    let mut old = join(addr, "r1", 1, "listener").await;
    next_of(&mut old, "participant-update").await;
    let mut new = join(addr, "r1", 1, "speaker").await;

    let frame = loop {
        match timeout(Duration::from_secs(2), old.next()).await.unwrap() {
            Some(Ok(Message::Close(frame))) => break frame.expect("close frame"),
            Some(Ok(_)) => continue,
            other => panic!("expected close frame, got {other:?}"),
        }
    };
    assert_eq!(u16::from(frame.code), close::POLICY);
    drop(old);

    let update = next_of(&mut new, "participant-update").await;
    assert_eq!(roster_of(&update), vec![Participant::new(1, Role::Speaker)]);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(
        state.relay().registry().snapshot(&"r1".into()),
        vec![Participant::new(1, Role::Speaker)]
    );
}

#[test_timeout::tokio_timeout_test]
async fn handshake_without_valid_uid_is_rejected() {
    let (addr, _state) = start(LivenessConfig::default()).await;
    for url in [
        format!("ws://{addr}/ws?roomId=r1&uid=0"),
        format!("ws://{addr}/ws?roomId=r1&uid=5&role=host"),
        format!("ws://{addr}/ws?roomId=&uid=5"),
    ] {
        match connect_async(url.as_str()).await {
            Err(WsError::Http(response)) => assert_eq!(response.status().as_u16(), 400, "{url}"),
            other => panic!("expected 400 for {url}, got {:?}", other.map(|_| ())),
        }
    }
}
