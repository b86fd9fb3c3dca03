//! One negotiation worker per remote participant.
//!
//! Every command for a given remote uid is handled by that uid's worker task in
//! arrival order, so offer/answer production for one peer never overlaps while
//! different peers negotiate independently. Dropping or aborting the worker
//! drops its session event channel with it.

use std::{collections::VecDeque, future::Future, sync::Arc, time::Duration};

use beach_bonfire_core::{IceCandidate, RoomId, SignalMessage, Uid};
use parking_lot::Mutex;
use tokio::{
    sync::mpsc,
    task::JoinHandle,
    time::{sleep_until, Instant},
};
use tracing::{debug, info, warn};

use crate::{
    config::NegotiationConfig,
    media::{
        LocalAudio, MediaBackend, MediaConnectionState, MediaError, MediaSession,
        SessionDescription, SessionEvent,
    },
    negotiation::should_initiate,
    NegotiationError,
};

/// Where a peer link stands from the local client's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationState {
    /// Link exists but nothing has been exchanged yet.
    Idle,
    OfferSent,
    OfferReceived,
    /// Descriptions exchanged; waiting for the media transport to come up.
    Connecting,
    Established,
    /// Media transport failed; waiting for an ICE restart.
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SignalingPhase {
    Stable,
    HaveLocalOffer,
    HaveRemoteOffer,
}

#[derive(Debug)]
pub(crate) enum LinkCommand {
    Initiate,
    RemoteOffer(String),
    RemoteAnswer(String),
    RemoteCandidate(IceCandidate),
}

/// Reports from link workers back to the engine. `generation` lets the engine
/// ignore reports from links it has already replaced.
#[derive(Debug)]
pub enum LinkEvent {
    State {
        uid: Uid,
        generation: u64,
        state: NegotiationState,
    },
    RemoteTrack {
        uid: Uid,
        generation: u64,
        track_id: String,
    },
    Ended {
        uid: Uid,
        generation: u64,
        error: Option<NegotiationError>,
    },
}

/// Collaborators shared by every link of one client.
pub(crate) struct LinkContext {
    pub local_uid: Uid,
    pub room_id: RoomId,
    pub config: NegotiationConfig,
    pub backend: Arc<dyn MediaBackend>,
    pub local_audio: Option<LocalAudio>,
    pub outbound: mpsc::UnboundedSender<SignalMessage>,
    pub events: mpsc::UnboundedSender<LinkEvent>,
}

struct LinkShared {
    state: NegotiationState,
    session: Option<Arc<dyn MediaSession>>,
}

/// Engine-side handle to a running link worker.
pub(crate) struct PeerLinkHandle {
    generation: u64,
    commands: mpsc::UnboundedSender<LinkCommand>,
    shared: Arc<Mutex<LinkShared>>,
    task: JoinHandle<()>,
}

impl PeerLinkHandle {
    pub fn spawn(ctx: Arc<LinkContext>, remote_uid: Uid, generation: u64) -> Self {
        let (commands, rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Mutex::new(LinkShared {
            state: NegotiationState::Idle,
            session: None,
        }));
        let worker = PeerLinkWorker::new(ctx, remote_uid, generation, Arc::clone(&shared));
        let task = tokio::spawn(worker.run(rx));
        Self {
            generation,
            commands,
            shared,
            task,
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn state(&self) -> NegotiationState {
        self.shared.lock().state
    }

    pub fn send(&self, command: LinkCommand) -> bool {
        self.commands.send(command).is_ok()
    }

    /// Cancels any in-flight negotiation and releases the session.
    pub fn teardown(self) {
        self.task.abort();
        let session = self.shared.lock().session.take();
        if let Some(session) = session {
            tokio::spawn(async move { session.close().await });
        }
    }
}

struct PeerLinkWorker {
    ctx: Arc<LinkContext>,
    remote_uid: Uid,
    generation: u64,
    shared: Arc<Mutex<LinkShared>>,
    session: Option<Arc<dyn MediaSession>>,
    session_events: Option<mpsc::UnboundedReceiver<SessionEvent>>,
    signaling: SignalingPhase,
    exchanged: bool,
    connection: MediaConnectionState,
    remote_description_set: bool,
    local_media_attached: bool,
    pending_candidates: VecDeque<IceCandidate>,
    ice_restarts: u32,
    restart_at: Option<Instant>,
    give_up_at: Option<Instant>,
    answer_due: Option<Instant>,
    published: NegotiationState,
}

impl PeerLinkWorker {
    fn new(
        ctx: Arc<LinkContext>,
        remote_uid: Uid,
        generation: u64,
        shared: Arc<Mutex<LinkShared>>,
    ) -> Self {
        Self {
            ctx,
            remote_uid,
            generation,
            shared,
            session: None,
            session_events: None,
            signaling: SignalingPhase::Stable,
            exchanged: false,
            connection: MediaConnectionState::New,
            remote_description_set: false,
            local_media_attached: false,
            pending_candidates: VecDeque::new(),
            ice_restarts: 0,
            restart_at: None,
            give_up_at: None,
            answer_due: None,
            published: NegotiationState::Idle,
        }
    }

    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<LinkCommand>) {
        let outcome = loop {
            let deadline = self.next_deadline();
            let step = tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => self.handle_command(command).await,
                    None => break None,
                },
                event = recv_event(&mut self.session_events) => match event {
                    Some(event) => self.handle_session_event(event).await,
                    None => {
                        self.session_events = None;
                        Ok(())
                    }
                },
                _ = sleep_until_opt(deadline) => self.handle_deadline().await,
            };
            if let Err(err) = step {
                break Some(err);
            }
        };

        self.close_session().await;
        if let Some(err) = &outcome {
            warn!(
                remote_uid = self.remote_uid,
                error = %err,
                "peer link torn down"
            );
        }
        let _ = self.ctx.events.send(LinkEvent::Ended {
            uid: self.remote_uid,
            generation: self.generation,
            error: outcome,
        });
    }

    fn state(&self) -> NegotiationState {
        match self.signaling {
            SignalingPhase::HaveLocalOffer => NegotiationState::OfferSent,
            SignalingPhase::HaveRemoteOffer => NegotiationState::OfferReceived,
            SignalingPhase::Stable => match self.connection {
                MediaConnectionState::Connected => NegotiationState::Established,
                MediaConnectionState::Failed => NegotiationState::Failed,
                _ if self.exchanged => NegotiationState::Connecting,
                _ => NegotiationState::Idle,
            },
        }
    }

    fn publish(&mut self) {
        let state = self.state();
        self.shared.lock().state = state;
        if state != self.published {
            self.published = state;
            debug!(remote_uid = self.remote_uid, ?state, "peer link state changed");
            let _ = self.ctx.events.send(LinkEvent::State {
                uid: self.remote_uid,
                generation: self.generation,
                state,
            });
        }
    }

    fn is_initiator(&self) -> bool {
        should_initiate(self.ctx.local_uid, self.remote_uid)
    }

    async fn handle_command(&mut self, command: LinkCommand) -> Result<(), NegotiationError> {
        match command {
            LinkCommand::Initiate => self.initiate().await,
            LinkCommand::RemoteOffer(sdp) => self.receive_offer(sdp).await,
            LinkCommand::RemoteAnswer(sdp) => self.receive_answer(sdp).await,
            LinkCommand::RemoteCandidate(candidate) => {
                self.receive_candidate(candidate).await;
                Ok(())
            }
        }
    }

    /// The engine replaces half-negotiated links before asking for an offer,
    /// so anything but a fresh link means an offer is already under way.
    async fn initiate(&mut self) -> Result<(), NegotiationError> {
        let state = self.state();
        if state != NegotiationState::Idle {
            debug!(remote_uid = self.remote_uid, ?state, "initiate ignored; negotiation already started");
            return Ok(());
        }
        self.send_offer(false).await
    }

    async fn send_offer(&mut self, ice_restart: bool) -> Result<(), NegotiationError> {
        let session = self.ensure_session().await?;
        let uid = self.remote_uid;
        let offer = self
            .bounded("offer", self.ctx.config.offer_timeout, async {
                let offer = session.create_offer(ice_restart).await?;
                session.set_local_description(offer.clone()).await?;
                Ok::<_, MediaError>(offer)
            })
            .await?;

        self.signaling = SignalingPhase::HaveLocalOffer;
        self.answer_due = Some(Instant::now() + self.ctx.config.answer_timeout);
        self.publish();
        info!(remote_uid = uid, ice_restart, "sending offer");
        self.send_signal(SignalMessage::offer(
            self.ctx.room_id.clone(),
            self.ctx.local_uid,
            uid,
            offer.sdp,
        ));
        Ok(())
    }

    async fn receive_offer(&mut self, sdp: String) -> Result<(), NegotiationError> {
        if self.is_initiator() && self.signaling == SignalingPhase::HaveLocalOffer {
            debug!(
                remote_uid = self.remote_uid,
                "glare: keeping our pending offer, ignoring theirs"
            );
            return Ok(());
        }
        if self.signaling != SignalingPhase::Stable {
            self.reset_session().await;
        }

        let session = self.ensure_session().await?;
        let timeout = self.ctx.config.answer_timeout;
        let deadline = Instant::now() + timeout;

        self.bounded("offer", timeout, async {
            session
                .set_remote_description(SessionDescription::offer(sdp))
                .await
        })
        .await?;
        self.signaling = SignalingPhase::HaveRemoteOffer;
        self.remote_description_set = true;
        self.publish();
        self.flush_candidates(&session).await;

        let remaining = deadline.saturating_duration_since(Instant::now());
        let answer = self
            .bounded("answer", remaining, async {
                let answer = session.create_answer().await?;
                session.set_local_description(answer.clone()).await?;
                Ok::<_, MediaError>(answer)
            })
            .await?;

        self.signaling = SignalingPhase::Stable;
        self.exchanged = true;
        self.publish();
        info!(remote_uid = self.remote_uid, "sending answer");
        self.send_signal(SignalMessage::answer(
            self.ctx.room_id.clone(),
            self.ctx.local_uid,
            self.remote_uid,
            answer.sdp,
        ));
        Ok(())
    }

    async fn receive_answer(&mut self, sdp: String) -> Result<(), NegotiationError> {
        let session = match (&self.session, self.signaling) {
            (Some(session), SignalingPhase::HaveLocalOffer) => Arc::clone(session),
            _ => {
                warn!(
                    remote_uid = self.remote_uid,
                    state = ?self.state(),
                    "ignoring answer without a pending local offer"
                );
                return Ok(());
            }
        };

        self.bounded("answer", self.ctx.config.answer_timeout, async {
            session
                .set_remote_description(SessionDescription::answer(sdp))
                .await
        })
        .await?;
        self.answer_due = None;
        self.signaling = SignalingPhase::Stable;
        self.exchanged = true;
        self.remote_description_set = true;
        self.publish();
        self.flush_candidates(&session).await;
        Ok(())
    }

    async fn receive_candidate(&mut self, candidate: IceCandidate) {
        match (&self.session, self.remote_description_set) {
            (Some(session), true) => {
                let session = Arc::clone(session);
                self.apply_candidate(&session, candidate).await;
            }
            _ => {
                self.pending_candidates.push_back(candidate);
                debug!(
                    remote_uid = self.remote_uid,
                    queued = self.pending_candidates.len(),
                    "queued candidate until remote description is set"
                );
            }
        }
    }

    async fn flush_candidates(&mut self, session: &Arc<dyn MediaSession>) {
        while let Some(candidate) = self.pending_candidates.pop_front() {
            self.apply_candidate(session, candidate).await;
        }
    }

    async fn apply_candidate(&self, session: &Arc<dyn MediaSession>, candidate: IceCandidate) {
        if let Err(err) = session.add_remote_candidate(candidate).await {
            warn!(remote_uid = self.remote_uid, error = %err, "failed to add remote candidate");
        }
    }

    async fn handle_session_event(&mut self, event: SessionEvent) -> Result<(), NegotiationError> {
        match event {
            SessionEvent::LocalCandidate(candidate) => {
                self.send_signal(SignalMessage::ice_candidate(
                    self.ctx.room_id.clone(),
                    self.ctx.local_uid,
                    self.remote_uid,
                    candidate,
                ));
            }
            SessionEvent::RemoteTrack { track_id } => {
                let _ = self.ctx.events.send(LinkEvent::RemoteTrack {
                    uid: self.remote_uid,
                    generation: self.generation,
                    track_id,
                });
            }
            SessionEvent::ConnectionState(state) => {
                self.connection = state;
                match state {
                    MediaConnectionState::Connected => {
                        self.restart_at = None;
                        self.give_up_at = None;
                        info!(remote_uid = self.remote_uid, "peer connection established");
                    }
                    MediaConnectionState::Failed => self.schedule_recovery()?,
                    MediaConnectionState::Closed => {
                        return Err(NegotiationError::ConnectionClosed {
                            uid: self.remote_uid,
                        })
                    }
                    _ => {}
                }
                self.publish();
            }
        }
        Ok(())
    }

    fn schedule_recovery(&mut self) -> Result<(), NegotiationError> {
        let config = &self.ctx.config;
        if !self.is_initiator() {
            self.give_up_at = Some(Instant::now() + config.restart_grace());
            return Ok(());
        }
        if self.ice_restarts >= config.max_ice_restarts {
            return Err(NegotiationError::ConnectionFailed {
                uid: self.remote_uid,
            });
        }
        self.restart_at = Some(Instant::now() + config.ice_restart_delay);
        Ok(())
    }

    async fn handle_deadline(&mut self) -> Result<(), NegotiationError> {
        let now = Instant::now();
        if self.answer_due.is_some_and(|at| at <= now) {
            self.answer_due = None;
            if self.signaling == SignalingPhase::HaveLocalOffer {
                return Err(NegotiationError::Timeout {
                    uid: self.remote_uid,
                    stage: "answer",
                    timeout: self.ctx.config.answer_timeout,
                });
            }
        }
        if self.give_up_at.is_some_and(|at| at <= now) {
            self.give_up_at = None;
            if self.connection != MediaConnectionState::Connected {
                return Err(NegotiationError::ConnectionFailed {
                    uid: self.remote_uid,
                });
            }
        }
        if self.restart_at.is_some_and(|at| at <= now) {
            self.restart_at = None;
            if self.connection == MediaConnectionState::Failed
                && self.signaling == SignalingPhase::Stable
            {
                self.ice_restarts += 1;
                info!(
                    remote_uid = self.remote_uid,
                    attempt = self.ice_restarts,
                    "restarting ICE"
                );
                return self.send_offer(true).await;
            }
        }
        Ok(())
    }

    fn next_deadline(&self) -> Option<Instant> {
        [self.restart_at, self.give_up_at, self.answer_due]
            .into_iter()
            .flatten()
            .min()
    }

    async fn ensure_session(&mut self) -> Result<Arc<dyn MediaSession>, NegotiationError> {
        let session = match &self.session {
            Some(session) => Arc::clone(session),
            None => {
                let (tx, rx) = mpsc::unbounded_channel();
                let session = self
                    .ctx
                    .backend
                    .create_session(self.remote_uid, tx)
                    .await
                    .map_err(|err| self.media_error(err))?;
                self.session = Some(Arc::clone(&session));
                self.session_events = Some(rx);
                self.shared.lock().session = Some(Arc::clone(&session));
                session
            }
        };

        if !self.local_media_attached {
            if let Some(audio) = &self.ctx.local_audio {
                session
                    .add_local_track(audio)
                    .await
                    .map_err(|err| self.media_error(err))?;
                self.local_media_attached = true;
                debug!(
                    remote_uid = self.remote_uid,
                    muted = audio.is_muted(),
                    "attached local audio"
                );
            }
        }
        Ok(session)
    }

    /// Drops the current session and all per-session negotiation state.
    async fn reset_session(&mut self) {
        debug!(remote_uid = self.remote_uid, state = ?self.state(), "recreating peer session");
        self.close_session().await;
        self.signaling = SignalingPhase::Stable;
        self.exchanged = false;
        self.connection = MediaConnectionState::New;
        self.remote_description_set = false;
        self.local_media_attached = false;
        self.pending_candidates.clear();
        self.restart_at = None;
        self.give_up_at = None;
        self.answer_due = None;
        self.publish();
    }

    async fn close_session(&mut self) {
        self.session_events = None;
        self.shared.lock().session = None;
        if let Some(session) = self.session.take() {
            session.close().await;
        }
    }

    async fn bounded<T, F>(
        &self,
        stage: &'static str,
        timeout: Duration,
        work: F,
    ) -> Result<T, NegotiationError>
    where
        F: Future<Output = Result<T, MediaError>>,
    {
        match tokio::time::timeout(timeout, work).await {
            Ok(result) => result.map_err(|err| self.media_error(err)),
            Err(_) => Err(NegotiationError::Timeout {
                uid: self.remote_uid,
                stage,
                timeout,
            }),
        }
    }

    fn media_error(&self, source: MediaError) -> NegotiationError {
        NegotiationError::Media {
            uid: self.remote_uid,
            source,
        }
    }

    fn send_signal(&self, message: SignalMessage) {
        if self.ctx.outbound.send(message).is_err() {
            debug!(remote_uid = self.remote_uid, "signaling outbound closed; dropping message");
        }
    }
}

async fn recv_event(
    events: &mut Option<mpsc::UnboundedReceiver<SessionEvent>>,
) -> Option<SessionEvent> {
    match events {
        Some(events) => events.recv().await,
        None => std::future::pending().await,
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
