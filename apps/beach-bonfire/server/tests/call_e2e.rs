use std::{net::SocketAddr, sync::Arc, time::Duration};

use beach_bonfire_client::{
    testing::FakeMediaBackend, CallError, CallEvent, ClientConfig, ConnectionStatus,
    ConnectionSupervisor, NegotiationState, ReconnectPolicy,
};
use beach_bonfire_core::{Participant, Role, Uid};
use beach_bonfire_server::{
    serve, AppState, LivenessConfig, RegistryConfig, RoomRegistry, SignalingRelay,
};
use tokio::{sync::mpsc, time::timeout};

async fn start() -> SocketAddr {
    start_with(LivenessConfig::default()).await
}

async fn start_with(liveness: LivenessConfig) -> SocketAddr {
    let relay = SignalingRelay::new(RoomRegistry::new(RegistryConfig::default()), liveness);
    relay.spawn_liveness_sweeper();
    let state = Arc::new(AppState::new(relay, None));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(serve(listener, state, std::future::pending()));
    addr
}

type Client = (
    ConnectionSupervisor,
    mpsc::UnboundedReceiver<CallEvent>,
    FakeMediaBackend,
);

fn client(addr: SocketAddr, uid: Uid, role: Role) -> Client {
    client_with(addr, uid, role, |config| config)
}

fn client_with(
    addr: SocketAddr,
    uid: Uid,
    role: Role,
    tune: impl FnOnce(ClientConfig) -> ClientConfig,
) -> Client {
    let backend = FakeMediaBackend::new();
    let config = tune(ClientConfig::new(&format!("ws://{addr}/ws"), "r1", uid, role).unwrap());
    let (supervisor, events) = ConnectionSupervisor::new(config, Arc::new(backend.clone()));
    (supervisor, events, backend)
}

async fn wait_for(
    events: &mut mpsc::UnboundedReceiver<CallEvent>,
    mut predicate: impl FnMut(&CallEvent) -> bool,
) -> CallEvent {
    loop {
        let event = timeout(Duration::from_secs(5), events.recv())
            .await
            .expect("event in time")
            .expect("event stream open");
        if predicate(&event) {
            return event;
        }
    }
}

fn connected(event: &CallEvent) -> bool {
    matches!(event, CallEvent::Status(ConnectionStatus::Connected))
}

fn established_with(uid: Uid) -> impl FnMut(&CallEvent) -> bool {
    move |event| {
        matches!(
            event,
            CallEvent::PeerState { uid: peer, state: NegotiationState::Established } if *peer == uid
        )
    }
}

#[test_timeout::tokio_timeout_test(secs = 30)]
async fn two_clients_establish_then_tear_down_on_departure() {
    let addr = start().await;
    let (listener, mut listener_events, listener_media) = client(addr, 1, Role::Listener);
    let (speaker, mut speaker_events, speaker_media) = client(addr, 2, Role::Speaker);

    listener.connect().await.unwrap();
    wait_for(&mut listener_events, |event| {
        matches!(event, CallEvent::Status(ConnectionStatus::Connected))
    })
    .await;
    speaker.connect().await.unwrap();

    let roster = wait_for(&mut speaker_events, |event| {
        matches!(event, CallEvent::Roster(participants) if participants.len() == 2)
    })
    .await;
    let CallEvent::Roster(participants) = roster else {
        unreachable!()
    };
    assert_eq!(
        participants,
        vec![
            Participant::new(1, Role::Listener),
            Participant::new(2, Role::Speaker)
        ]
    );

    wait_for(&mut listener_events, established_with(2)).await;
    wait_for(&mut speaker_events, established_with(1)).await;

    // uid 1 initiated: its session made the offer, uid 2's only answered.
    let offered = listener_media.session_for(2).unwrap().calls();
    let answered = speaker_media.session_for(1).unwrap().calls();
    assert!(offered
        .iter()
        .any(|call| matches!(call, beach_bonfire_client::testing::SessionCall::CreateOffer { .. })));
    assert!(!answered
        .iter()
        .any(|call| matches!(call, beach_bonfire_client::testing::SessionCall::CreateOffer { .. })));

    speaker.disconnect().await;
    assert_eq!(speaker.status(), ConnectionStatus::Disconnected);
    assert!(speaker_media.acquired()[0].is_stopped());

    wait_for(&mut listener_events, |event| {
        matches!(event, CallEvent::Roster(participants) if participants.iter().all(|p| p.uid != 2))
    })
    .await;
    let session = listener_media.session_for(2).unwrap();
    for _ in 0..100 {
        if session.is_closed() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(session.is_closed());

    listener.disconnect().await;
}

#[test_timeout::tokio_timeout_test(secs = 30)]
async fn mute_reaches_the_other_participant() {
    let addr = start().await;
    let (one, mut one_events, _one_media) = client(addr, 1, Role::Speaker);
    let (two, mut two_events, _two_media) = client(addr, 2, Role::Speaker);

    one.connect().await.unwrap();
    two.connect().await.unwrap();
    wait_for(&mut one_events, |event| {
        matches!(event, CallEvent::Roster(participants) if participants.len() == 2)
    })
    .await;
    wait_for(&mut two_events, |event| {
        matches!(event, CallEvent::Roster(participants) if participants.len() == 2)
    })
    .await;

    assert!(two.toggle_mute().await.unwrap());
    assert_eq!(two.is_muted().await, Some(true));

    wait_for(&mut one_events, |event| {
        matches!(event, CallEvent::Roster(participants)
            if participants.iter().any(|p| p.uid == 2 && p.is_muted))
    })
    .await;

    one.disconnect().await;
    two.disconnect().await;
}

#[test_timeout::tokio_timeout_test(secs = 30)]
async fn evicted_client_reconnects_and_reannounces_mute() {
    let addr = start_with(LivenessConfig {
        heartbeat_interval: Duration::from_millis(100),
        timeout_factor: 2,
    })
    .await;
    let (observer, mut observer_events, _observer_media) =
        client_with(addr, 1, Role::Listener, |config| {
            config.with_heartbeat_interval(Duration::from_millis(50))
        });
    // Heartbeats far apart: the relay evicts this one over and over.
    let (speaker, mut speaker_events, _speaker_media) =
        client_with(addr, 2, Role::Speaker, |config| {
            config.with_reconnect(ReconnectPolicy {
                max_retries: 10,
                base_delay: Duration::from_millis(20),
                max_delay: Duration::from_millis(100),
            })
        });

    observer.connect().await.unwrap();
    wait_for(&mut observer_events, connected).await;
    speaker.connect().await.unwrap();
    wait_for(&mut speaker_events, connected).await;
    assert!(speaker.toggle_mute().await.unwrap());

    wait_for(&mut observer_events, |event| {
        matches!(event, CallEvent::Roster(participants) if participants.iter().any(|p| p.uid == 2))
    })
    .await;
    wait_for(&mut speaker_events, |event| {
        matches!(event, CallEvent::Reconnecting { .. })
    })
    .await;
    wait_for(&mut speaker_events, connected).await;

    wait_for(&mut observer_events, |event| {
        matches!(event, CallEvent::Roster(participants) if participants.iter().all(|p| p.uid != 2))
    })
    .await;
    wait_for(&mut observer_events, |event| {
        matches!(event, CallEvent::Roster(participants)
            if participants.iter().any(|p| p.uid == 2 && p.is_muted))
    })
    .await;
    assert_eq!(speaker.is_muted().await, Some(true));

    speaker.disconnect().await;
    observer.disconnect().await;
}

#[test_timeout::tokio_timeout_test(secs = 30)]
async fn replaced_client_stops_without_retrying() {
    let addr = start().await;
    let (first, mut first_events, first_media) = client(addr, 3, Role::Speaker);
    let (second, mut second_events, _second_media) = client(addr, 3, Role::Speaker);

    first.connect().await.unwrap();
    wait_for(&mut first_events, connected).await;
    second.connect().await.unwrap();
    wait_for(&mut second_events, connected).await;

    let mut seen = Vec::new();
    loop {
        let event = timeout(Duration::from_secs(5), first_events.recv())
            .await
            .expect("event in time")
            .expect("event stream open");
        let done = matches!(event, CallEvent::Status(ConnectionStatus::Error));
        seen.push(event);
        if done {
            break;
        }
    }
    assert!(seen
        .iter()
        .all(|event| !matches!(event, CallEvent::Reconnecting { .. })));
    assert!(seen.iter().any(|event| matches!(
        event,
        CallEvent::Error(CallError::Transport(reason)) if reason.contains("replaced")
    )));
    assert!(first_media.acquired()[0].is_stopped());

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(first.status(), ConnectionStatus::Error);
    assert_eq!(second.status(), ConnectionStatus::Connected);

    second.disconnect().await;
}
