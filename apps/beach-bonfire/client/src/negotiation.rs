//! Client-side view of the room: the tracked roster plus one [`PeerLink`]
//! worker per visible remote participant.
//!
//! The engine itself never awaits. Signaling messages and link reports are fed
//! in by whoever owns it (normally the connection supervisor's task) and all
//! slow work happens inside the per-uid workers, so a stalled negotiation with
//! one peer never holds up another.
//!
//! [`PeerLink`]: crate::peer_link

use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
};

use beach_bonfire_core::{Participant, RoomId, Signal, SignalMessage, Uid};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::{
    config::NegotiationConfig,
    events::CallEvent,
    media::{LocalAudio, MediaBackend},
    peer_link::{LinkCommand, LinkContext, LinkEvent, NegotiationState, PeerLinkHandle},
};

/// Glare rule: of two mutually visible participants only the smaller uid
/// sends the first offer.
pub fn should_initiate(local_uid: Uid, remote_uid: Uid) -> bool {
    local_uid < remote_uid
}

pub struct NegotiationEngine {
    ctx: Arc<LinkContext>,
    links: HashMap<Uid, PeerLinkHandle>,
    roster: Vec<Participant>,
    muted: bool,
    next_generation: u64,
    app_events: mpsc::UnboundedSender<CallEvent>,
}

impl NegotiationEngine {
    /// Builds an engine for `local_uid` in `room_id`. Messages for the relay
    /// are pushed into `outbound`; the returned receiver carries reports from
    /// the link workers and must be fed back through
    /// [`handle_link_event`](Self::handle_link_event).
    pub fn new(
        local_uid: Uid,
        room_id: RoomId,
        config: NegotiationConfig,
        backend: Arc<dyn MediaBackend>,
        local_audio: Option<LocalAudio>,
        outbound: mpsc::UnboundedSender<SignalMessage>,
        app_events: mpsc::UnboundedSender<CallEvent>,
    ) -> (Self, mpsc::UnboundedReceiver<LinkEvent>) {
        let (events, link_events) = mpsc::unbounded_channel();
        let muted = local_audio.as_ref().is_some_and(LocalAudio::is_muted);
        let ctx = Arc::new(LinkContext {
            local_uid,
            room_id,
            config,
            backend,
            local_audio,
            outbound,
            events,
        });
        let engine = Self {
            ctx,
            links: HashMap::new(),
            roster: Vec::new(),
            muted,
            next_generation: 0,
            app_events,
        };
        (engine, link_events)
    }

    pub fn local_uid(&self) -> Uid {
        self.ctx.local_uid
    }

    pub fn room_id(&self) -> &RoomId {
        &self.ctx.room_id
    }

    pub fn roster(&self) -> &[Participant] {
        &self.roster
    }

    pub fn is_muted(&self) -> bool {
        self.muted
    }

    pub fn link_state(&self, remote_uid: Uid) -> Option<NegotiationState> {
        self.links.get(&remote_uid).map(PeerLinkHandle::state)
    }

    pub fn link_count(&self) -> usize {
        self.links.len()
    }

    pub fn handle_signal(&mut self, message: SignalMessage) {
        let local = self.ctx.local_uid;
        let origin = message.origin();
        match message.signal {
            Signal::ParticipantUpdate(roster) => self.apply_roster(roster.participants),
            Signal::Leave(payload) => self.remove_participant(payload.uid),
            Signal::Mute => self.apply_remote_mute(origin, true),
            Signal::Unmute => self.apply_remote_mute(origin, false),
            Signal::Offer(payload) if payload.target_uid == local && origin != local => {
                self.link_or_spawn(origin)
                    .send(LinkCommand::RemoteOffer(payload.sdp));
            }
            Signal::Answer(payload) if payload.target_uid == local => {
                match self.links.get(&origin) {
                    Some(link) => {
                        link.send(LinkCommand::RemoteAnswer(payload.sdp));
                    }
                    None => warn!(remote_uid = origin, "ignoring answer from uid without a peer link"),
                }
            }
            Signal::IceCandidate(payload) if payload.target_uid == local && origin != local => {
                self.link_or_spawn(origin)
                    .send(LinkCommand::RemoteCandidate(payload.candidate));
            }
            signal @ (Signal::Offer(_) | Signal::Answer(_) | Signal::IceCandidate(_)) => {
                debug!(
                    kind = signal.kind(),
                    target_uid = ?signal.target_uid(),
                    "ignoring signal addressed to another uid"
                );
            }
            Signal::Join(_) | Signal::Heartbeat => {}
        }
    }

    pub fn handle_link_event(&mut self, event: LinkEvent) {
        match event {
            LinkEvent::State {
                uid,
                generation,
                state,
            } => {
                if self.is_current(uid, generation) {
                    self.emit(CallEvent::PeerState { uid, state });
                }
            }
            LinkEvent::RemoteTrack {
                uid,
                generation,
                track_id,
            } => {
                if self.is_current(uid, generation) {
                    info!(remote_uid = uid, %track_id, "remote audio arrived");
                    self.emit(CallEvent::RemoteAudio { uid, track_id });
                }
            }
            LinkEvent::Ended {
                uid,
                generation,
                error,
            } => {
                if !self.is_current(uid, generation) {
                    return;
                }
                self.links.remove(&uid);
                if let Some(error) = error {
                    self.emit(CallEvent::PeerError(error));
                }
            }
        }
    }

    /// Starts negotiation with `remote_uid` if the glare rule lets this side
    /// offer. An established link is left alone; a half-negotiated one is
    /// replaced. Returns whether an offer was requested.
    pub fn initiate_call(&mut self, remote_uid: Uid) -> bool {
        let local = self.ctx.local_uid;
        if !should_initiate(local, remote_uid) {
            debug!(remote_uid, "remote side initiates; waiting for its offer");
            return false;
        }
        if let Some(state) = self.link_state(remote_uid) {
            match state {
                NegotiationState::Established => return false,
                NegotiationState::Idle => {}
                state => {
                    debug!(remote_uid, ?state, "replacing stale peer link");
                    self.teardown(remote_uid);
                }
            }
        }
        self.link_or_spawn(remote_uid).send(LinkCommand::Initiate)
    }

    /// Flips the shared capture once for every link and announces the change.
    /// Returns `false` when already in the requested state.
    pub fn set_muted(&mut self, muted: bool) -> bool {
        if let Some(audio) = &self.ctx.local_audio {
            audio.set_enabled(!muted);
        }
        if self.muted == muted {
            return false;
        }
        self.muted = muted;
        let local = self.ctx.local_uid;
        if let Some(entry) = self.roster.iter_mut().find(|p| p.uid == local) {
            entry.is_muted = muted;
        }
        let _ = self
            .ctx
            .outbound
            .send(SignalMessage::mute(self.ctx.room_id.clone(), local, muted));
        self.emit_roster();
        true
    }

    /// Cancels negotiation with `remote_uid` and releases its session.
    pub fn teardown(&mut self, remote_uid: Uid) -> bool {
        match self.links.remove(&remote_uid) {
            Some(link) => {
                debug!(remote_uid, generation = link.generation(), "tearing down peer link");
                link.teardown();
                true
            }
            None => false,
        }
    }

    pub fn teardown_all(&mut self) {
        for (remote_uid, link) in self.links.drain() {
            debug!(remote_uid, "tearing down peer link");
            link.teardown();
        }
    }

    /// Drops every link and forgets the roster. The shared capture is left
    /// running.
    pub fn reset(&mut self) {
        self.teardown_all();
        if !self.roster.is_empty() {
            self.roster.clear();
            self.emit_roster();
        }
    }

    fn apply_roster(&mut self, mut participants: Vec<Participant>) {
        let local = self.ctx.local_uid;
        for entry in participants.iter_mut().filter(|p| p.uid == local) {
            entry.is_muted = self.muted;
        }

        let visible: HashSet<Uid> = participants
            .iter()
            .map(|p| p.uid)
            .filter(|uid| *uid != local)
            .collect();
        let departed: Vec<Uid> = self
            .links
            .keys()
            .copied()
            .filter(|uid| !visible.contains(uid))
            .collect();
        for uid in departed {
            self.teardown(uid);
        }

        // Links that ended since the last update are gone from the map; an idle
        // link on the offering side never got its offer out.
        let pending: Vec<Uid> = participants
            .iter()
            .map(|p| p.uid)
            .filter(|uid| *uid != local)
            .filter(|uid| match self.link_state(*uid) {
                None => true,
                Some(state) => state == NegotiationState::Idle && should_initiate(local, *uid),
            })
            .collect();
        self.roster = participants;
        self.emit_roster();

        for uid in pending {
            if should_initiate(local, uid) {
                self.initiate_call(uid);
            } else {
                self.link_or_spawn(uid);
            }
        }
    }

    fn remove_participant(&mut self, uid: Uid) {
        if uid == self.ctx.local_uid {
            return;
        }
        self.teardown(uid);
        let before = self.roster.len();
        self.roster.retain(|p| p.uid != uid);
        if self.roster.len() != before {
            info!(remote_uid = uid, "participant left");
            self.emit_roster();
        }
    }

    fn apply_remote_mute(&mut self, uid: Uid, muted: bool) {
        match self.roster.iter_mut().find(|p| p.uid == uid) {
            Some(entry) if entry.is_muted != muted => {
                entry.is_muted = muted;
                self.emit_roster();
            }
            Some(_) => {}
            None => debug!(remote_uid = uid, muted, "mute notice for unknown participant"),
        }
    }

    fn link_or_spawn(&mut self, remote_uid: Uid) -> &PeerLinkHandle {
        let ctx = &self.ctx;
        let next_generation = &mut self.next_generation;
        self.links.entry(remote_uid).or_insert_with(|| {
            *next_generation += 1;
            debug!(remote_uid, generation = *next_generation, "creating peer link");
            PeerLinkHandle::spawn(Arc::clone(ctx), remote_uid, *next_generation)
        })
    }

    fn is_current(&self, uid: Uid, generation: u64) -> bool {
        self.links
            .get(&uid)
            .is_some_and(|link| link.generation() == generation)
    }

    fn emit_roster(&self) {
        self.emit(CallEvent::Roster(self.roster.clone()));
    }

    fn emit(&self, event: CallEvent) {
        let _ = self.app_events.send(event);
    }
}
