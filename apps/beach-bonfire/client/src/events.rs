use std::time::Duration;

use beach_bonfire_core::{Participant, Uid};

use crate::{peer_link::NegotiationState, CallError, NegotiationError};

/// Lifecycle of the signaling connection. Replaces any combination of
/// "connecting"/"connected"/"failed" flags with a single value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Idle,
    Connecting,
    Connected,
    Disconnected,
    Error,
}

/// Everything the application hears about a call.
#[derive(Debug, Clone)]
pub enum CallEvent {
    Status(ConnectionStatus),
    Roster(Vec<Participant>),
    PeerState { uid: Uid, state: NegotiationState },
    RemoteAudio { uid: Uid, track_id: String },
    PeerError(NegotiationError),
    Reconnecting { attempt: u32, delay: Duration },
    Error(CallError),
}
