//! Shared primitives for Beach Bonfire voice rooms: room and participant
//! identifiers, the roster entry type, and the signaling wire protocol spoken
//! between the relay and its clients.

pub mod close;
mod protocol;

use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};

pub use protocol::{
    CandidatePayload, IceCandidate, JoinPayload, LeavePayload, ProtocolError, RosterPayload,
    SessionPayload, Signal, SignalMessage, RELAY_UID,
};

/// Room-scoped participant identifier chosen by the client.
pub type Uid = u32;

/// Opaque room identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RoomId(String);

impl RoomId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RoomId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RoomId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for RoomId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Speaker,
    Listener,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Speaker => "speaker",
            Role::Listener => "listener",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = ProtocolError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "speaker" => Ok(Role::Speaker),
            "listener" => Ok(Role::Listener),
            other => Err(ProtocolError::InvalidRole(other.to_string())),
        }
    }
}

/// One roster entry as carried by `participant-update`.
///
/// `is_muted` is advisory for peers; the owning client is authoritative for its
/// own capture state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Participant {
    pub uid: Uid,
    pub role: Role,
    pub is_muted: bool,
}

impl Participant {
    pub fn new(uid: Uid, role: Role) -> Self {
        Self {
            uid,
            role,
            is_muted: false,
        }
    }

    pub fn with_muted(mut self, muted: bool) -> Self {
        self.is_muted = muted;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_timeout::timeout]
    fn role_parses_case_insensitively() {
        assert_eq!("Speaker".parse::<Role>().unwrap(), Role::Speaker);
        assert_eq!(" listener ".parse::<Role>().unwrap(), Role::Listener);
        assert!(matches!(
            "host".parse::<Role>(),
            Err(ProtocolError::InvalidRole(value)) if value == "host"
        ));
    }

    #[test_timeout::timeout]
    fn participant_uses_camel_case_mute_flag() {
        let json = serde_json::to_value(Participant::new(7, Role::Listener).with_muted(true))
            .unwrap();
        assert_eq!(
            json,
            serde_json::json!({ "uid": 7, "role": "listener", "isMuted": true })
        );
    }
}
