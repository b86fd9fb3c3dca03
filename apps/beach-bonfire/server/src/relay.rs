use std::{sync::Arc, time::Duration};

use beach_bonfire_core::{close, ProtocolError, Role, RoomId, Signal, SignalMessage, Uid};
use metrics::counter;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::registry::{now_millis, RegistryError, RoomRegistry, TransportHandle};

const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
const DEFAULT_TIMEOUT_FACTOR: u32 = 3;

#[derive(Debug, Clone)]
pub struct LivenessConfig {
    /// Interval clients are expected to heartbeat at; also the sweep period.
    pub heartbeat_interval: Duration,
    /// Missed intervals tolerated before a participant is evicted.
    pub timeout_factor: u32,
}

impl LivenessConfig {
    pub fn timeout(&self) -> Duration {
        self.heartbeat_interval * self.timeout_factor.max(1)
    }
}

impl Default for LivenessConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            timeout_factor: DEFAULT_TIMEOUT_FACTOR,
        }
    }
}

/// Identity of one registered signaling transport.
#[derive(Debug, Clone)]
pub struct Connection {
    pub room_id: RoomId,
    pub uid: Uid,
    pub role: Role,
    pub handle: TransportHandle,
}

/// What the socket loop should do after a frame was handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Continue,
    Close,
}

/// Applies inbound signaling to the registry and routes point-to-point
/// messages between participants of the same room.
#[derive(Clone)]
pub struct SignalingRelay {
    registry: RoomRegistry,
    liveness: Arc<LivenessConfig>,
}

impl SignalingRelay {
    pub fn new(registry: RoomRegistry, liveness: LivenessConfig) -> Self {
        Self {
            registry,
            liveness: Arc::new(liveness),
        }
    }

    pub fn registry(&self) -> &RoomRegistry {
        &self.registry
    }

    pub fn liveness(&self) -> &LivenessConfig {
        &self.liveness
    }

    /// Registers a freshly opened transport; the registry broadcasts the new
    /// roster before this returns.
    pub fn open(
        &self,
        room_id: RoomId,
        uid: Uid,
        role: Role,
        handle: TransportHandle,
    ) -> Result<Connection, RegistryError> {
        let registration = self
            .registry
            .register(&room_id, uid, role, handle.clone())
            .map_err(|err| {
                counter!("bonfire_registrations_rejected_total", 1, "reason" => err.metric_label());
                err
            })?;

        info!(
            room_id = %room_id,
            uid,
            role = %role,
            connection_id = %handle.connection_id(),
            participants = registration.participants,
            replaced = registration.replaced,
            "participant joined"
        );

        Ok(Connection {
            room_id,
            uid,
            role,
            handle,
        })
    }

    pub fn handle_text(&self, connection: &Connection, text: &str) -> Disposition {
        match SignalMessage::decode(text) {
            Ok(message) => self.handle_signal(connection, message),
            Err(err) => {
                self.reject(connection, &err);
                Disposition::Continue
            }
        }
    }

    pub fn handle_signal(&self, connection: &Connection, message: SignalMessage) -> Disposition {
        let Connection {
            room_id, uid, handle, ..
        } = connection;
        if !self.registry.touch(room_id, *uid, handle.connection_id()) {
            counter!("bonfire_signals_dropped_total", 1, "kind" => "stale_connection");
            debug!(
                room_id = %room_id,
                uid,
                connection_id = %handle.connection_id(),
                kind = message.signal.kind(),
                "connection no longer owns its uid; closing"
            );
            return Disposition::Close;
        }

        if message.room_id != *room_id || message.uid != *uid {
            debug!(
                room_id = %room_id,
                uid,
                claimed_room = %message.room_id,
                claimed_uid = message.uid,
                "overriding sender identity claimed by client"
            );
        }

        let kind = message.signal.kind();
        match message.signal {
            Signal::Heartbeat => Disposition::Continue,
            Signal::Join(payload) => {
                if self
                    .registry
                    .set_role(room_id, *uid, handle.connection_id(), payload.role)
                {
                    debug!(room_id = %room_id, uid, role = %payload.role, "join changed role");
                }
                Disposition::Continue
            }
            Signal::Leave(payload) => {
                if payload.uid != *uid {
                    debug!(room_id = %room_id, uid, subject = payload.uid, "leave for another uid treated as self-leave");
                }
                if self
                    .registry
                    .unregister_connection(room_id, *uid, handle.connection_id())
                {
                    info!(room_id = %room_id, uid, "participant left");
                }
                handle.close(close::NORMAL, close::REASON_LEFT);
                Disposition::Close
            }
            Signal::Mute => self.apply_mute(connection, true),
            Signal::Unmute => self.apply_mute(connection, false),
            signal @ (Signal::Offer(_) | Signal::Answer(_) | Signal::IceCandidate(_)) => {
                let forward = SignalMessage::new(room_id.clone(), *uid, signal);
                self.forward(forward.with_sender(*uid));
                Disposition::Continue
            }
            Signal::ParticipantUpdate(_) => {
                counter!("bonfire_signals_dropped_total", 1, "kind" => kind);
                debug!(room_id = %room_id, uid, "ignoring roster sent by client");
                Disposition::Continue
            }
        }
    }

    /// Unregisters the transport if it still owns its uid.
    pub fn close(&self, connection: &Connection) -> bool {
        let removed = self.registry.unregister_connection(
            &connection.room_id,
            connection.uid,
            connection.handle.connection_id(),
        );
        if removed {
            info!(
                room_id = %connection.room_id,
                uid = connection.uid,
                connection_id = %connection.handle.connection_id(),
                "participant disconnected"
            );
        }
        removed
    }

    /// Evicts every participant that has not been heard from within the
    /// liveness window.
    pub fn evict_stale(&self, now: u64) -> usize {
        let timeout = self.liveness.timeout();
        let mut evicted = 0usize;
        for (room_id, uid, connection_id) in self.registry.stale_participants(now, timeout) {
            if self.registry.evict(&room_id, uid, connection_id) {
                counter!("bonfire_heartbeat_evictions_total", 1);
                warn!(
                    room_id = %room_id,
                    uid,
                    timeout_secs = timeout.as_secs_f64(),
                    "evicted participant after missed heartbeats"
                );
                evicted += 1;
            }
        }
        evicted
    }

    pub fn spawn_liveness_sweeper(&self) -> JoinHandle<()> {
        let relay = self.clone();
        let mut interval = tokio::time::interval(self.liveness.heartbeat_interval);
        tokio::spawn(async move {
            loop {
                interval.tick().await;
                relay.evict_stale(now_millis());
            }
        })
    }

    fn apply_mute(&self, connection: &Connection, muted: bool) -> Disposition {
        if self
            .registry
            .set_muted(
                &connection.room_id,
                connection.uid,
                connection.handle.connection_id(),
                muted,
            )
        {
            debug!(room_id = %connection.room_id, uid = connection.uid, muted, "mute state changed");
        }
        Disposition::Continue
    }

    fn forward(&self, message: SignalMessage) {
        let kind = message.signal.kind();
        let Some(target) = message.signal.target_uid() else {
            return;
        };
        if target == message.uid {
            counter!("bonfire_signals_dropped_total", 1, "kind" => kind);
            debug!(room_id = %message.room_id, uid = message.uid, kind, "dropping self-addressed signal");
            return;
        }

        let Some(handle) = self.registry.route(&message.room_id, target) else {
            counter!("bonfire_signals_dropped_total", 1, "kind" => kind);
            debug!(
                room_id = %message.room_id,
                uid = message.uid,
                target,
                kind,
                "target not in room; dropping"
            );
            return;
        };

        match message.encode() {
            Ok(text) => {
                if handle.send_text(Arc::from(text)) {
                    counter!("bonfire_signals_forwarded_total", 1, "kind" => kind);
                } else {
                    counter!("bonfire_signals_dropped_total", 1, "kind" => kind);
                }
            }
            Err(err) => warn!(error = %err, kind, "failed to encode forwarded signal"),
        }
    }

    fn reject(&self, connection: &Connection, err: &ProtocolError) {
        counter!("bonfire_signals_dropped_total", 1, "kind" => "malformed");
        warn!(
            room_id = %connection.room_id,
            uid = connection.uid,
            error = %err,
            "discarding malformed frame"
        );
    }
}
