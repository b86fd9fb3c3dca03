//! Owns the signaling connection for one call.
//!
//! A single background task holds the WebSocket, the heartbeat ticker and the
//! [`NegotiationEngine`]. Everything else talks to it through commands, so
//! the connection state lives in exactly one place: the published
//! [`ConnectionStatus`].

use std::{borrow::Cow, sync::Arc, time::Duration};

use beach_bonfire_core::{close, SignalMessage, Uid};
use futures_util::{
    stream::{SplitSink, StreamExt},
    SinkExt,
};
use tokio::{
    net::TcpStream,
    sync::{mpsc, oneshot, watch, Mutex as AsyncMutex},
    task::JoinHandle,
    time::{interval_at, sleep_until, Instant, MissedTickBehavior},
};
use tokio_tungstenite::{
    connect_async,
    tungstenite::{
        error::ProtocolError,
        protocol::{frame::coding::CloseCode, CloseFrame},
        Error as WsError, Message,
    },
    MaybeTlsStream, WebSocketStream,
};
use tracing::{debug, info, trace, warn};

use crate::{
    config::ClientConfig,
    directory::RoomDirectory,
    events::{CallEvent, ConnectionStatus},
    media::{LocalAudio, MediaBackend},
    negotiation::NegotiationEngine,
    peer_link::LinkEvent,
    CallError,
};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;

const DISCONNECT_TIMEOUT: Duration = Duration::from_secs(2);

pub struct ConnectionSupervisor {
    config: Arc<ClientConfig>,
    backend: Arc<dyn MediaBackend>,
    directory: Option<RoomDirectory>,
    reporter: Reporter,
    active: AsyncMutex<Option<ActiveCall>>,
}

struct ActiveCall {
    commands: mpsc::UnboundedSender<Command>,
    task: JoinHandle<()>,
    audio: LocalAudio,
}

enum Command {
    SetMuted {
        muted: bool,
        reply: oneshot::Sender<bool>,
    },
    InitiateCall {
        uid: Uid,
        reply: oneshot::Sender<bool>,
    },
    Disconnect {
        reply: oneshot::Sender<()>,
    },
}

/// Publishes status changes both to watchers and to the event stream.
#[derive(Clone)]
struct Reporter {
    status: Arc<watch::Sender<ConnectionStatus>>,
    events: mpsc::UnboundedSender<CallEvent>,
}

impl Reporter {
    fn set_status(&self, status: ConnectionStatus) {
        let previous = self.status.send_replace(status);
        if previous != status {
            debug!(?previous, ?status, "connection status changed");
            self.emit(CallEvent::Status(status));
        }
    }

    fn emit(&self, event: CallEvent) {
        let _ = self.events.send(event);
    }
}

impl ConnectionSupervisor {
    pub fn new(
        config: ClientConfig,
        backend: Arc<dyn MediaBackend>,
    ) -> (Self, mpsc::UnboundedReceiver<CallEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let (status, _) = watch::channel(ConnectionStatus::Idle);
        let directory = config.directory_url.as_ref().map(RoomDirectory::new);
        let supervisor = Self {
            config: Arc::new(config),
            backend,
            directory,
            reporter: Reporter {
                status: Arc::new(status),
                events,
            },
            active: AsyncMutex::new(None),
        };
        (supervisor, rx)
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn status(&self) -> ConnectionStatus {
        *self.reporter.status.borrow()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.reporter.status.subscribe()
    }

    /// Acquires the microphone, then starts the signaling task. Returns once
    /// the task is running; watch [`status`](Self::status) for the outcome of
    /// the connection itself.
    pub async fn connect(&self) -> Result<(), CallError> {
        let Ok(mut active) = self.active.try_lock() else {
            debug!("connect ignored; another attempt is in flight");
            return Err(CallError::AlreadyConnected);
        };
        if active.as_ref().is_some_and(|call| !call.task.is_finished()) {
            return Err(CallError::AlreadyConnected);
        }

        self.reporter.set_status(ConnectionStatus::Connecting);
        let audio = match self.backend.acquire_local_audio().await {
            Ok(audio) => audio,
            Err(err) => {
                warn!(reason = err.reason(), error = %err, "could not acquire local audio");
                let err = CallError::Media(err);
                self.reporter.emit(CallEvent::Error(err.clone()));
                self.reporter.set_status(ConnectionStatus::Error);
                return Err(err);
            }
        };

        let config = Arc::clone(&self.config);
        let (outbound_tx, outbound) = mpsc::unbounded_channel();
        let (engine, link_events) = NegotiationEngine::new(
            config.uid,
            config.room_id.clone(),
            config.negotiation.clone(),
            Arc::clone(&self.backend),
            Some(audio.clone()),
            outbound_tx,
            self.reporter.events.clone(),
        );
        let (commands, command_rx) = mpsc::unbounded_channel();
        let runner = CallRunner {
            config,
            reporter: self.reporter.clone(),
            audio: audio.clone(),
            engine,
            link_events,
            outbound,
            commands: command_rx,
        };
        let task = tokio::spawn(runner.run());
        *active = Some(ActiveCall {
            commands,
            task,
            audio,
        });
        Ok(())
    }

    /// Leaves the room: stops heartbeats, closes the transport normally,
    /// stops the capture and drops every peer link.
    pub async fn disconnect(&self) {
        let Some(call) = self.active.lock().await.take() else {
            return;
        };
        let (reply, done) = oneshot::channel();
        if call.commands.send(Command::Disconnect { reply }).is_ok()
            && tokio::time::timeout(DISCONNECT_TIMEOUT, done).await.is_err()
        {
            warn!("signaling task did not stop in time; aborting it");
            call.task.abort();
        }
        call.audio.stop();
        self.reporter.set_status(ConnectionStatus::Disconnected);
    }

    /// The shared capture of the current call, if one was started.
    pub async fn local_audio(&self) -> Option<LocalAudio> {
        self.active
            .lock()
            .await
            .as_ref()
            .map(|call| call.audio.clone())
    }

    pub async fn is_muted(&self) -> Option<bool> {
        self.local_audio().await.map(|audio| audio.is_muted())
    }

    /// Returns whether the mute state changed.
    pub async fn set_muted(&self, muted: bool) -> Result<bool, CallError> {
        let (reply, changed) = oneshot::channel();
        self.send(Command::SetMuted { muted, reply }).await?;
        let changed = changed.await.map_err(|_| CallError::NotConnected)?;
        if changed {
            self.persist_mute(muted).await;
        }
        Ok(changed)
    }

    /// Flips the mute state and returns the new value.
    pub async fn toggle_mute(&self) -> Result<bool, CallError> {
        let muted = !self.is_muted().await.ok_or(CallError::NotConnected)?;
        self.set_muted(muted).await?;
        Ok(muted)
    }

    /// Asks the engine to offer to `uid` now rather than on the next roster.
    pub async fn initiate_call(&self, uid: Uid) -> Result<bool, CallError> {
        let (reply, started) = oneshot::channel();
        self.send(Command::InitiateCall { uid, reply }).await?;
        started.await.map_err(|_| CallError::NotConnected)
    }

    async fn send(&self, command: Command) -> Result<(), CallError> {
        let active = self.active.lock().await;
        let call = active.as_ref().ok_or(CallError::NotConnected)?;
        call.commands
            .send(command)
            .map_err(|_| CallError::NotConnected)
    }

    async fn persist_mute(&self, muted: bool) {
        let Some(directory) = &self.directory else {
            return;
        };
        if let Err(err) = directory
            .set_participant_muted(&self.config.room_id, self.config.uid, muted)
            .await
        {
            warn!(
                room_id = %self.config.room_id,
                uid = self.config.uid,
                error = %err,
                "failed to persist mute state"
            );
        }
    }
}

/// Why the signaling task stopped serving a connection.
enum SessionEnd {
    Stop(Stop),
    Closed { code: Option<u16>, reason: String },
    Lost(String),
}

/// Explicit disconnect, or the supervisor went away.
struct Stop {
    reply: Option<oneshot::Sender<()>>,
}

struct CallRunner {
    config: Arc<ClientConfig>,
    reporter: Reporter,
    audio: LocalAudio,
    engine: NegotiationEngine,
    link_events: mpsc::UnboundedReceiver<LinkEvent>,
    outbound: mpsc::UnboundedReceiver<SignalMessage>,
    commands: mpsc::UnboundedReceiver<Command>,
}

impl CallRunner {
    async fn run(mut self) {
        let policy = self.config.reconnect.clone();
        let mut attempt = 0u32;
        loop {
            let url = self.config.join_url();
            let connect = tokio::time::timeout(self.config.connect_timeout, connect_async(url.as_str()));
            let end = match connect.await {
                Ok(Ok((stream, _))) => {
                    attempt = 0;
                    info!(
                        room_id = %self.config.room_id,
                        uid = self.config.uid,
                        "signaling connected"
                    );
                    self.reporter.set_status(ConnectionStatus::Connected);
                    self.serve(stream).await
                }
                Ok(Err(err)) => SessionEnd::Lost(format!("websocket connect failed: {err}")),
                Err(_) => SessionEnd::Lost(format!(
                    "websocket connect timed out after {:?}",
                    self.config.connect_timeout
                )),
            };

            self.engine.reset();
            match end {
                SessionEnd::Stop(stop) => return self.finish(stop, ConnectionStatus::Disconnected),
                SessionEnd::Closed { code, reason } if code.is_some_and(close::is_normal) => {
                    info!(?code, %reason, "signaling closed by relay");
                    return self.finish(Stop { reply: None }, ConnectionStatus::Disconnected);
                }
                SessionEnd::Closed {
                    code: Some(close::POLICY),
                    reason,
                } if reason == close::REASON_REPLACED => {
                    warn!(%reason, "another connection took over this uid");
                    self.reporter.emit(CallEvent::Error(CallError::Transport(format!(
                        "closed by relay: {reason}"
                    ))));
                    return self.finish(Stop { reply: None }, ConnectionStatus::Error);
                }
                SessionEnd::Closed { code, reason } => {
                    warn!(?code, %reason, "signaling closed abnormally");
                    self.reporter.emit(CallEvent::Error(CallError::Transport(format!(
                        "closed with code {code:?}: {reason}"
                    ))));
                }
                SessionEnd::Lost(reason) => {
                    warn!(%reason, "signaling connection lost");
                    self.reporter
                        .emit(CallEvent::Error(CallError::Transport(reason)));
                }
            }

            attempt += 1;
            if attempt > policy.max_retries {
                warn!(attempts = policy.max_retries, "giving up on signaling reconnects");
                self.reporter.emit(CallEvent::Error(CallError::RetriesExhausted {
                    attempts: policy.max_retries,
                }));
                return self.finish(Stop { reply: None }, ConnectionStatus::Error);
            }
            let delay = policy.delay_for(attempt);
            info!(attempt, ?delay, "scheduling signaling reconnect");
            self.reporter.set_status(ConnectionStatus::Connecting);
            self.reporter
                .emit(CallEvent::Reconnecting { attempt, delay });
            if let Some(stop) = self.pause(delay).await {
                return self.finish(stop, ConnectionStatus::Disconnected);
            }
        }
    }

    async fn serve(&mut self, stream: WsStream) -> SessionEnd {
        let (mut sink, mut source) = stream.split();
        while self.outbound.try_recv().is_ok() {}

        // The relay registers every participant unmuted.
        if self.engine.is_muted() {
            let notice = SignalMessage::mute(self.config.room_id.clone(), self.config.uid, true);
            if let Err(err) = send_signal(&mut sink, &notice).await {
                return SessionEnd::Lost(err);
            }
        }

        let period = self.config.heartbeat_interval;
        let mut heartbeat = interval_at(Instant::now() + period, period);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                command = self.commands.recv() => {
                    let stop = match command {
                        Some(command) => self.apply(command),
                        None => Some(Stop { reply: None }),
                    };
                    if let Some(stop) = stop {
                        self.leave(&mut sink).await;
                        return SessionEnd::Stop(stop);
                    }
                }
                frame = source.next() => match frame {
                    Some(Ok(Message::Text(text))) => self.handle_text(&text),
                    Some(Ok(Message::Binary(data))) => match String::from_utf8(data) {
                        Ok(text) => self.handle_text(&text),
                        Err(_) => debug!("ignoring non-utf8 binary frame"),
                    },
                    Some(Ok(Message::Close(frame))) => {
                        let (code, reason) = frame
                            .map(|frame| (Some(u16::from(frame.code)), frame.reason.into_owned()))
                            .unwrap_or_default();
                        return SessionEnd::Closed { code, reason };
                    }
                    Some(Ok(_)) => {}
                    Some(Err(err)) => return SessionEnd::Lost(describe(&err)),
                    None => return SessionEnd::Lost("signaling stream ended".into()),
                },
                Some(message) = self.outbound.recv() => {
                    if let Err(err) = send_signal(&mut sink, &message).await {
                        return SessionEnd::Lost(err);
                    }
                }
                Some(event) = self.link_events.recv() => self.engine.handle_link_event(event),
                _ = heartbeat.tick() => {
                    let beat = SignalMessage::heartbeat(self.config.room_id.clone(), self.config.uid);
                    if let Err(err) = send_signal(&mut sink, &beat).await {
                        return SessionEnd::Lost(err);
                    }
                }
            }
        }
    }

    /// Waits out a reconnect delay while still answering commands.
    async fn pause(&mut self, delay: Duration) -> Option<Stop> {
        let wake = Instant::now() + delay;
        loop {
            tokio::select! {
                _ = sleep_until(wake) => return None,
                command = self.commands.recv() => {
                    let stop = match command {
                        Some(command) => self.apply(command),
                        None => Some(Stop { reply: None }),
                    };
                    if stop.is_some() {
                        return stop;
                    }
                }
                Some(event) = self.link_events.recv() => self.engine.handle_link_event(event),
            }
        }
    }

    fn apply(&mut self, command: Command) -> Option<Stop> {
        match command {
            Command::SetMuted { muted, reply } => {
                let _ = reply.send(self.engine.set_muted(muted));
                None
            }
            Command::InitiateCall { uid, reply } => {
                let _ = reply.send(self.engine.initiate_call(uid));
                None
            }
            Command::Disconnect { reply } => Some(Stop { reply: Some(reply) }),
        }
    }

    fn handle_text(&mut self, text: &str) {
        match SignalMessage::decode(text) {
            Ok(message) => {
                trace!(kind = message.signal.kind(), from = message.origin(), "signal received");
                self.engine.handle_signal(message);
            }
            Err(err) => warn!(error = %err, "dropping malformed signaling frame"),
        }
    }

    async fn leave(&self, sink: &mut WsSink) {
        let uid = self.config.uid;
        let notice = SignalMessage::leave(self.config.room_id.clone(), uid, uid);
        if let Err(err) = send_signal(sink, &notice).await {
            debug!(error = %err, "could not send leave");
            return;
        }
        let frame = CloseFrame {
            code: CloseCode::Normal,
            reason: Cow::Borrowed(close::REASON_LEFT),
        };
        if let Err(err) = sink.send(Message::Close(Some(frame))).await {
            debug!(error = %err, "could not send close frame");
        }
    }

    fn finish(mut self, stop: Stop, status: ConnectionStatus) {
        self.engine.reset();
        self.audio.stop();
        self.reporter.set_status(status);
        if let Some(reply) = stop.reply {
            let _ = reply.send(());
        }
    }
}

async fn send_signal(sink: &mut WsSink, message: &SignalMessage) -> Result<(), String> {
    let text = message.encode().map_err(|err| err.to_string())?;
    sink.send(Message::Text(text))
        .await
        .map_err(|err| format!("websocket send failed: {err}"))
}

fn describe(err: &WsError) -> String {
    match err {
        WsError::ConnectionClosed
        | WsError::AlreadyClosed
        | WsError::Protocol(ProtocolError::ResetWithoutClosingHandshake) => {
            "signaling connection reset".to_string()
        }
        other => format!("signaling websocket error: {other}"),
    }
}

#[cfg(test)]
mod tests {
    use beach_bonfire_core::Role;

    use super::*;
    use crate::{config::ReconnectPolicy, media::MediaError, testing::FakeMediaBackend};

    async fn unreachable_url() -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        format!("ws://{addr}/ws")
    }

    fn fast_policy(max_retries: u32) -> ReconnectPolicy {
        ReconnectPolicy {
            max_retries,
            base_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(40),
        }
    }

    fn drain(events: &mut mpsc::UnboundedReceiver<CallEvent>) -> Vec<CallEvent> {
        let mut out = Vec::new();
        while let Ok(event) = events.try_recv() {
            out.push(event);
        }
        out
    }

    #[test_timeout::tokio_timeout_test]
    async fn media_failure_abandons_connect() {
        let backend = FakeMediaBackend::new();
        backend.fail_acquire(MediaError::PermissionDenied);
        let config = ClientConfig::new(&unreachable_url().await, "r1", 1, Role::Speaker).unwrap();
        let (supervisor, mut events) = ConnectionSupervisor::new(config, Arc::new(backend));

        let err = supervisor.connect().await.unwrap_err();
        assert!(matches!(err, CallError::Media(MediaError::PermissionDenied)));
        assert_eq!(supervisor.status(), ConnectionStatus::Error);
        assert!(drain(&mut events).iter().any(|event| matches!(
            event,
            CallEvent::Error(CallError::Media(MediaError::PermissionDenied))
        )));
    }

    #[test_timeout::tokio_timeout_test]
    async fn retries_then_reports_permanent_failure() {
        let backend = FakeMediaBackend::new();
        let config = ClientConfig::new(&unreachable_url().await, "r1", 1, Role::Speaker)
            .unwrap()
            .with_reconnect(fast_policy(2));
        let (supervisor, mut events) = ConnectionSupervisor::new(config, Arc::new(backend.clone()));
        let mut status = supervisor.subscribe_status();

        supervisor.connect().await.unwrap();
        status
            .wait_for(|status| *status == ConnectionStatus::Error)
            .await
            .unwrap();

        let events = drain(&mut events);
        let attempts: Vec<u32> = events
            .iter()
            .filter_map(|event| match event {
                CallEvent::Reconnecting { attempt, .. } => Some(*attempt),
                _ => None,
            })
            .collect();
        assert_eq!(attempts, vec![1, 2]);
        assert!(events.iter().any(|event| matches!(
            event,
            CallEvent::Error(CallError::RetriesExhausted { attempts: 2 })
        )));
        assert!(backend.acquired()[0].is_stopped());
    }

    #[test_timeout::tokio_timeout_test]
    async fn stalled_handshake_counts_as_a_failed_attempt() {
        // Accepted by the kernel backlog, never answered.
        let silent = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}/ws", silent.local_addr().unwrap());
        let config = ClientConfig::new(&url, "r1", 1, Role::Speaker)
            .unwrap()
            .with_connect_timeout(Duration::from_millis(100))
            .with_reconnect(fast_policy(1));
        let (supervisor, mut events) = ConnectionSupervisor::new(config, Arc::new(FakeMediaBackend::new()));
        let mut status = supervisor.subscribe_status();

        supervisor.connect().await.unwrap();
        status
            .wait_for(|status| *status == ConnectionStatus::Error)
            .await
            .unwrap();

        let events = drain(&mut events);
        let timeouts = events
            .iter()
            .filter(|event| matches!(
                event,
                CallEvent::Error(CallError::Transport(reason)) if reason.contains("timed out")
            ))
            .count();
        assert_eq!(timeouts, 2);
        assert!(events.iter().any(|event| matches!(
            event,
            CallEvent::Error(CallError::RetriesExhausted { attempts: 1 })
        )));
        drop(silent);
    }

    #[test_timeout::tokio_timeout_test]
    async fn second_connect_is_refused_while_active() {
        let config = ClientConfig::new(&unreachable_url().await, "r1", 1, Role::Speaker)
            .unwrap()
            .with_reconnect(ReconnectPolicy {
                max_retries: 5,
                base_delay: Duration::from_secs(30),
                max_delay: Duration::from_secs(30),
            });
        let (supervisor, _events) = ConnectionSupervisor::new(config, Arc::new(FakeMediaBackend::new()));

        supervisor.connect().await.unwrap();
        assert!(matches!(
            supervisor.connect().await,
            Err(CallError::AlreadyConnected)
        ));

        supervisor.disconnect().await;
        assert_eq!(supervisor.status(), ConnectionStatus::Disconnected);
    }

    #[test_timeout::tokio_timeout_test]
    async fn mute_requires_a_connection() {
        let config = ClientConfig::new("ws://127.0.0.1:9/ws", "r1", 1, Role::Speaker).unwrap();
        let (supervisor, _events) = ConnectionSupervisor::new(config, Arc::new(FakeMediaBackend::new()));
        assert!(matches!(
            supervisor.set_muted(true).await,
            Err(CallError::NotConnected)
        ));
        assert!(matches!(
            supervisor.toggle_mute().await,
            Err(CallError::NotConnected)
        ));
    }
}
