use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use beach_bonfire_core::{close, Participant, Role, RoomId, SignalMessage, Uid, RELAY_UID};
use dashmap::{mapref::entry::Entry, DashMap};
use metrics::{counter, gauge};
use parking_lot::Mutex;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

const DEFAULT_ROOM_CAPACITY: usize = 32;

/// Frame queued for a participant's socket writer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    Text(Arc<str>),
    Close { code: u16, reason: &'static str },
}

/// Sending half of one open signaling transport.
#[derive(Debug, Clone)]
pub struct TransportHandle {
    connection_id: Uuid,
    sender: mpsc::UnboundedSender<Outbound>,
}

impl TransportHandle {
    pub fn new(sender: mpsc::UnboundedSender<Outbound>) -> Self {
        Self {
            connection_id: Uuid::new_v4(),
            sender,
        }
    }

    pub fn channel() -> (Self, mpsc::UnboundedReceiver<Outbound>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::new(tx), rx)
    }

    pub fn connection_id(&self) -> Uuid {
        self.connection_id
    }

    pub fn send_text(&self, text: Arc<str>) -> bool {
        self.sender.send(Outbound::Text(text)).is_ok()
    }

    pub fn close(&self, code: u16, reason: &'static str) {
        let _ = self.sender.send(Outbound::Close { code, reason });
    }
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("room {room_id} is full ({capacity} participants)")]
    RoomCapacityExceeded { room_id: RoomId, capacity: usize },
}

impl RegistryError {
    pub fn metric_label(&self) -> &'static str {
        match self {
            RegistryError::RoomCapacityExceeded { .. } => "room_capacity_exceeded",
        }
    }
}

#[derive(Debug, Clone)]
pub struct RegistryConfig {
    pub room_capacity: usize,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            room_capacity: DEFAULT_ROOM_CAPACITY,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Registration {
    /// An older transport held this uid and has been told to close.
    pub replaced: bool,
    pub participants: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct RegistryStats {
    pub active_rooms: usize,
    pub active_participants: usize,
    pub rooms: Vec<RoomStats>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RoomStats {
    pub room_id: RoomId,
    pub participants: usize,
}

/// Authoritative room -> participant map.
///
/// Each room sits behind its own mutex; every mutation and the roster
/// broadcast it triggers happen while that lock is held, so a room's members
/// observe mutations in the order they were applied.
#[derive(Clone)]
pub struct RoomRegistry {
    inner: Arc<RegistryInner>,
}

struct RegistryInner {
    rooms: DashMap<RoomId, Arc<Room>>,
    config: RegistryConfig,
    participants: AtomicUsize,
}

struct Room {
    id: RoomId,
    members: Mutex<Members>,
}

#[derive(Default)]
struct Members {
    entries: Vec<Member>,
    /// Set once the room emptied and is on its way out of the map.
    retired: bool,
}

struct Member {
    participant: Participant,
    handle: TransportHandle,
    last_seen: u64,
}

impl RoomRegistry {
    pub fn new(config: RegistryConfig) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                rooms: DashMap::new(),
                config,
                participants: AtomicUsize::new(0),
            }),
        }
    }

    /// Adds `uid` to the room, creating the room on first join. A uid that is
    /// already present is taken over by the new transport.
    pub fn register(
        &self,
        room_id: &RoomId,
        uid: Uid,
        role: Role,
        handle: TransportHandle,
    ) -> Result<Registration, RegistryError> {
        loop {
            let room = self.room_or_insert(room_id);
            let mut members = room.members.lock();
            if members.retired {
                drop(members);
                self.drop_room_if_current(room_id, &room);
                continue;
            }

            let now = now_millis();
            let mut replaced = None;
            match members.position(uid) {
                Some(index) => {
                    let member = &mut members.entries[index];
                    if member.handle.connection_id != handle.connection_id {
                        replaced = Some(std::mem::replace(&mut member.handle, handle));
                        member.participant = Participant::new(uid, role);
                    } else {
                        member.participant.role = role;
                    }
                    member.last_seen = now;
                }
                None => {
                    let capacity = self.inner.config.room_capacity;
                    if members.entries.len() >= capacity {
                        return Err(RegistryError::RoomCapacityExceeded {
                            room_id: room_id.clone(),
                            capacity,
                        });
                    }
                    members.entries.push(Member {
                        participant: Participant::new(uid, role),
                        handle,
                        last_seen: now,
                    });
                    let total = self.inner.participants.fetch_add(1, Ordering::Relaxed) + 1;
                    gauge!("bonfire_participants_active", total as f64);
                    counter!("bonfire_participants_registered_total", 1);
                }
            }

            if let Some(stale) = &replaced {
                debug!(
                    room_id = %room_id,
                    uid,
                    connection_id = %stale.connection_id,
                    "closing transport replaced by newer registration"
                );
                stale.close(close::POLICY, close::REASON_REPLACED);
            }
            members.broadcast_roster(&room.id);

            return Ok(Registration {
                replaced: replaced.is_some(),
                participants: members.entries.len(),
            });
        }
    }

    /// Removes `uid` from the room. Returns `false` when there was nothing to
    /// remove, in which case nothing is broadcast.
    pub fn unregister(&self, room_id: &RoomId, uid: Uid) -> bool {
        self.remove_member(room_id, uid, None).is_some()
    }

    /// Like [`unregister`](Self::unregister) but only when `connection_id`
    /// still owns the uid, so a replaced transport cannot evict its successor.
    pub fn unregister_connection(&self, room_id: &RoomId, uid: Uid, connection_id: Uuid) -> bool {
        self.remove_member(room_id, uid, Some(connection_id))
            .is_some()
    }

    /// Unregisters a silent participant and tells its transport to close.
    pub fn evict(&self, room_id: &RoomId, uid: Uid, connection_id: Uuid) -> bool {
        match self.remove_member(room_id, uid, Some(connection_id)) {
            Some(handle) => {
                handle.close(close::POLICY, close::REASON_HEARTBEAT_TIMEOUT);
                true
            }
            None => false,
        }
    }

    /// Updates the advisory mute flag on behalf of the transport that owns
    /// `uid`. Absent participants, other transports and unchanged values are
    /// ignored.
    pub fn set_muted(&self, room_id: &RoomId, uid: Uid, connection_id: Uuid, muted: bool) -> bool {
        let Some(room) = self.room(room_id) else {
            return false;
        };
        let mut members = room.members.lock();
        let Some(index) = members.owned_by(uid, connection_id) else {
            return false;
        };
        if members.entries[index].participant.is_muted == muted {
            return false;
        }
        members.entries[index].participant.is_muted = muted;

        let notice = SignalMessage::mute(room.id.clone(), uid, muted);
        members.broadcast_except(uid, &notice);
        members.broadcast_roster(&room.id);
        true
    }

    /// Changes the role of `uid` when `connection_id` still owns it. The
    /// roster is rebroadcast only when the role actually changed.
    pub fn set_role(&self, room_id: &RoomId, uid: Uid, connection_id: Uuid, role: Role) -> bool {
        let Some(room) = self.room(room_id) else {
            return false;
        };
        let mut members = room.members.lock();
        let Some(index) = members.owned_by(uid, connection_id) else {
            return false;
        };
        if members.entries[index].participant.role == role {
            return false;
        }
        members.entries[index].participant.role = role;
        members.broadcast_roster(&room.id);
        true
    }

    /// Participants in registration order.
    pub fn snapshot(&self, room_id: &RoomId) -> Vec<Participant> {
        self.room(room_id)
            .map(|room| room.members.lock().roster())
            .unwrap_or_default()
    }

    pub fn room_is_empty(&self, room_id: &RoomId) -> bool {
        self.room(room_id)
            .map(|room| room.members.lock().entries.is_empty())
            .unwrap_or(true)
    }

    /// Encoded participant-update for the current roster.
    pub fn roster_frame(&self, room_id: &RoomId) -> Option<Arc<str>> {
        let room = self.room(room_id)?;
        let members = room.members.lock();
        encode_frame(&SignalMessage::participant_update(
            room.id.clone(),
            members.roster(),
        ))
    }

    /// Records activity for the transport that owns `uid`.
    pub fn touch(&self, room_id: &RoomId, uid: Uid, connection_id: Uuid) -> bool {
        let Some(room) = self.room(room_id) else {
            return false;
        };
        let mut members = room.members.lock();
        match members.owned_by(uid, connection_id) {
            Some(index) => {
                members.entries[index].last_seen = now_millis();
                true
            }
            None => false,
        }
    }

    /// Transport currently registered for `uid`, if any.
    pub fn route(&self, room_id: &RoomId, uid: Uid) -> Option<TransportHandle> {
        let room = self.room(room_id)?;
        let members = room.members.lock();
        members
            .entries
            .iter()
            .find(|m| m.participant.uid == uid)
            .map(|m| m.handle.clone())
    }

    /// `(room, uid, connection)` triples that have been silent for longer than
    /// `timeout` as of `now` (milliseconds since the epoch).
    pub fn stale_participants(&self, now: u64, timeout: Duration) -> Vec<(RoomId, Uid, Uuid)> {
        let rooms: Vec<Arc<Room>> = self
            .inner
            .rooms
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        let limit = timeout.as_millis() as u64;

        let mut stale = Vec::new();
        for room in rooms {
            let members = room.members.lock();
            for member in &members.entries {
                if now.saturating_sub(member.last_seen) > limit {
                    stale.push((
                        room.id.clone(),
                        member.participant.uid,
                        member.handle.connection_id,
                    ));
                }
            }
        }
        stale
    }

    pub fn stats(&self) -> RegistryStats {
        let mut rooms: Vec<RoomStats> = self
            .inner
            .rooms
            .iter()
            .map(|entry| RoomStats {
                room_id: entry.key().clone(),
                participants: entry.value().members.lock().entries.len(),
            })
            .filter(|room| room.participants > 0)
            .collect();
        rooms.sort_by(|a, b| a.room_id.cmp(&b.room_id));

        RegistryStats {
            active_rooms: rooms.len(),
            active_participants: rooms.iter().map(|room| room.participants).sum(),
            rooms,
        }
    }

    fn room(&self, room_id: &RoomId) -> Option<Arc<Room>> {
        self.inner
            .rooms
            .get(room_id)
            .map(|entry| Arc::clone(entry.value()))
    }

    fn room_or_insert(&self, room_id: &RoomId) -> Arc<Room> {
        let (room, created) = match self.inner.rooms.entry(room_id.clone()) {
            Entry::Occupied(entry) => (Arc::clone(entry.get()), false),
            Entry::Vacant(entry) => {
                let room = Arc::new(Room {
                    id: room_id.clone(),
                    members: Mutex::new(Members::default()),
                });
                entry.insert(Arc::clone(&room));
                (room, true)
            }
        };
        // shard lock is released here; `len` would deadlock while it is held
        if created {
            gauge!("bonfire_rooms_active", self.inner.rooms.len() as f64);
            debug!(room_id = %room_id, "room created");
        }
        room
    }

    fn drop_room_if_current(&self, room_id: &RoomId, room: &Arc<Room>) {
        if self
            .inner
            .rooms
            .remove_if(room_id, |_, current| Arc::ptr_eq(current, room))
            .is_some()
        {
            gauge!("bonfire_rooms_active", self.inner.rooms.len() as f64);
            debug!(room_id = %room_id, "room emptied and dropped");
        }
    }

    fn remove_member(
        &self,
        room_id: &RoomId,
        uid: Uid,
        connection_id: Option<Uuid>,
    ) -> Option<TransportHandle> {
        let room = self.room(room_id)?;
        let mut members = room.members.lock();
        let index = members.position(uid)?;
        if let Some(expected) = connection_id {
            if members.entries[index].handle.connection_id != expected {
                return None;
            }
        }

        let removed = members.entries.remove(index);
        let total = self
            .inner
            .participants
            .fetch_sub(1, Ordering::Relaxed)
            .saturating_sub(1);
        gauge!("bonfire_participants_active", total as f64);

        let emptied = members.entries.is_empty();
        if emptied {
            members.retired = true;
        } else {
            let notice = SignalMessage::leave(room.id.clone(), RELAY_UID, uid);
            members.broadcast_except(uid, &notice);
            members.broadcast_roster(&room.id);
        }
        drop(members);

        if emptied {
            self.drop_room_if_current(room_id, &room);
        }
        Some(removed.handle)
    }
}

impl Members {
    fn position(&self, uid: Uid) -> Option<usize> {
        self.entries.iter().position(|m| m.participant.uid == uid)
    }

    fn owned_by(&self, uid: Uid, connection_id: Uuid) -> Option<usize> {
        self.entries
            .iter()
            .position(|m| m.participant.uid == uid && m.handle.connection_id == connection_id)
    }

    fn roster(&self) -> Vec<Participant> {
        self.entries.iter().map(|m| m.participant.clone()).collect()
    }

    /// Sends one encoding of the roster to every member.
    fn broadcast_roster(&self, room_id: &RoomId) -> usize {
        let update = SignalMessage::participant_update(room_id.clone(), self.roster());
        let Some(frame) = encode_frame(&update) else {
            return 0;
        };
        counter!("bonfire_roster_broadcasts_total", 1);
        self.entries
            .iter()
            .filter(|m| m.handle.send_text(Arc::clone(&frame)))
            .count()
    }

    fn broadcast_except(&self, skip: Uid, message: &SignalMessage) -> usize {
        let Some(frame) = encode_frame(message) else {
            return 0;
        };
        self.entries
            .iter()
            .filter(|m| m.participant.uid != skip)
            .filter(|m| m.handle.send_text(Arc::clone(&frame)))
            .count()
    }
}

fn encode_frame(message: &SignalMessage) -> Option<Arc<str>> {
    match message.encode() {
        Ok(text) => Some(Arc::from(text)),
        Err(err) => {
            warn!(error = %err, kind = message.signal.kind(), "failed to encode signaling frame");
            None
        }
    }
}

pub(crate) fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use beach_bonfire_core::Signal;

    fn room() -> RoomId {
        RoomId::new("r1")
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<Outbound>) -> Vec<Outbound> {
        let mut frames = Vec::new();
        while let Ok(frame) = rx.try_recv() {
            frames.push(frame);
        }
        frames
    }

    fn decode(frame: &Outbound) -> SignalMessage {
        match frame {
            Outbound::Text(text) => SignalMessage::decode(text).unwrap(),
            other => panic!("expected text frame, got {other:?}"),
        }
    }

    fn rosters(frames: &[Outbound]) -> Vec<Vec<Participant>> {
        frames
            .iter()
            .filter(|f| matches!(f, Outbound::Text(_)))
            .filter_map(|f| match decode(f).signal {
                Signal::ParticipantUpdate(payload) => Some(payload.participants),
                _ => None,
            })
            .collect()
    }

    #[test_timeout::timeout]
    fn register_broadcasts_full_roster_in_join_order() {
        let registry = RoomRegistry::new(RegistryConfig::default());
        let (first, mut first_rx) = TransportHandle::channel();
        let (second, mut second_rx) = TransportHandle::channel();

        registry.register(&room(), 1, Role::Listener, first).unwrap();
        registry.register(&room(), 2, Role::Speaker, second).unwrap();

        let expected = vec![
            Participant::new(1, Role::Listener),
            Participant::new(2, Role::Speaker),
        ];
        assert_eq!(rosters(&drain(&mut first_rx)).last(), Some(&expected));
        assert_eq!(rosters(&drain(&mut second_rx)), vec![expected.clone()]);
        assert_eq!(registry.snapshot(&room()), expected);
    }

    #[test_timeout::timeout]
    fn second_unregister_is_a_silent_noop() {
        let registry = RoomRegistry::new(RegistryConfig::default());
        let (first, mut first_rx) = TransportHandle::channel();
        let (second, _second_rx) = TransportHandle::channel();
        registry.register(&room(), 1, Role::Speaker, first).unwrap();
        registry.register(&room(), 2, Role::Speaker, second).unwrap();
        drain(&mut first_rx);

        assert!(registry.unregister(&room(), 2));
        let frames = drain(&mut first_rx);
        assert_eq!(rosters(&frames), vec![vec![Participant::new(1, Role::Speaker)]]);
        assert!(frames.iter().any(|f| matches!(
            decode(f).signal,
            Signal::Leave(ref payload) if payload.uid == 2
        )));

        assert!(!registry.unregister(&room(), 2));
        assert!(drain(&mut first_rx).is_empty());
    }

    #[test_timeout::timeout]
    fn last_registration_wins_and_old_connection_cannot_evict() {
        let registry = RoomRegistry::new(RegistryConfig::default());
        let (old, mut old_rx) = TransportHandle::channel();
        let old_id = old.connection_id();
        let (new, mut new_rx) = TransportHandle::channel();

        registry.register(&room(), 5, Role::Listener, old).unwrap();
        let registration = registry.register(&room(), 5, Role::Speaker, new).unwrap();
        assert!(registration.replaced);
        assert_eq!(registration.participants, 1);

        let old_frames = drain(&mut old_rx);
        assert_eq!(
            old_frames.last(),
            Some(&Outbound::Close {
                code: close::POLICY,
                reason: close::REASON_REPLACED
            })
        );

        assert!(!registry.unregister_connection(&room(), 5, old_id));
        assert!(!registry.set_muted(&room(), 5, old_id, true));
        assert!(!registry.set_role(&room(), 5, old_id, Role::Listener));
        assert!(!registry.touch(&room(), 5, old_id));
        assert_eq!(registry.snapshot(&room()), vec![Participant::new(5, Role::Speaker)]);
        assert_eq!(rosters(&drain(&mut new_rx)).len(), 1);
    }

    #[test_timeout::timeout]
    fn consecutive_roster_frames_are_identical() {
        let registry = RoomRegistry::new(RegistryConfig::default());
        let (first, _rx) = TransportHandle::channel();
        let first_id = first.connection_id();
        registry.register(&room(), 3, Role::Speaker, first).unwrap();
        registry.set_muted(&room(), 3, first_id, true);

        let a = registry.roster_frame(&room()).unwrap();
        let b = registry.roster_frame(&room()).unwrap();
        assert_eq!(a.as_bytes(), b.as_bytes());
    }

    #[test_timeout::timeout]
    fn set_muted_ignores_absent_and_unchanged() {
        let registry = RoomRegistry::new(RegistryConfig::default());
        let (first, mut first_rx) = TransportHandle::channel();
        let (second, mut second_rx) = TransportHandle::channel();
        let second_id = second.connection_id();
        registry.register(&room(), 1, Role::Speaker, first).unwrap();
        registry.register(&room(), 2, Role::Speaker, second).unwrap();
        drain(&mut first_rx);
        drain(&mut second_rx);

        assert!(!registry.set_muted(&room(), 9, second_id, true));
        assert!(!registry.set_muted(&room(), 2, second_id, false));
        assert!(drain(&mut first_rx).is_empty());

        assert!(registry.set_muted(&room(), 2, second_id, true));
        let frames = drain(&mut first_rx);
        assert_eq!(decode(&frames[0]).signal, Signal::Mute);
        assert_eq!(decode(&frames[0]).uid, 2);
        assert_eq!(
            rosters(&frames),
            vec![vec![
                Participant::new(1, Role::Speaker),
                Participant::new(2, Role::Speaker).with_muted(true),
            ]]
        );
        // the muted participant only gets the roster, not its own notice
        assert_eq!(drain(&mut second_rx).len(), 1);
    }

    #[test_timeout::timeout]
    fn capacity_is_enforced_per_room() {
        let registry = RoomRegistry::new(RegistryConfig { room_capacity: 1 });
        let (first, _a) = TransportHandle::channel();
        let (second, _b) = TransportHandle::channel();
        let (third, _c) = TransportHandle::channel();

        registry.register(&room(), 1, Role::Speaker, first).unwrap();
        let err = registry
            .register(&room(), 2, Role::Listener, second)
            .unwrap_err();
        assert_eq!(err.metric_label(), "room_capacity_exceeded");
        registry
            .register(&RoomId::new("r2"), 2, Role::Listener, third)
            .unwrap();
        assert_eq!(registry.stats().active_participants, 2);
    }

    #[test_timeout::timeout]
    fn empty_rooms_are_dropped_and_recreated() {
        let registry = RoomRegistry::new(RegistryConfig::default());
        let (first, _a) = TransportHandle::channel();
        registry.register(&room(), 1, Role::Speaker, first).unwrap();
        assert!(registry.unregister(&room(), 1));
        assert!(registry.room_is_empty(&room()));
        assert_eq!(registry.stats().active_rooms, 0);

        let (again, mut rx) = TransportHandle::channel();
        registry.register(&room(), 1, Role::Listener, again).unwrap();
        assert_eq!(rosters(&drain(&mut rx)), vec![vec![Participant::new(1, Role::Listener)]]);
    }

    #[test_timeout::timeout]
    fn stale_participants_reports_silent_members_only() {
        let registry = RoomRegistry::new(RegistryConfig::default());
        let (first, _a) = TransportHandle::channel();
        let first_id = first.connection_id();
        registry.register(&room(), 1, Role::Speaker, first).unwrap();

        let now = now_millis();
        assert!(registry
            .stale_participants(now, Duration::from_secs(90))
            .is_empty());
        let later = now + 91_000;
        assert_eq!(
            registry.stale_participants(later, Duration::from_secs(90)),
            vec![(room(), 1, first_id)]
        );
        assert!(registry.evict(&room(), 1, first_id));
        assert!(registry.room_is_empty(&room()));
    }
}
