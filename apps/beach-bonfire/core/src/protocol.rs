use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{Participant, Role, RoomId, Uid};

/// Sender uid stamped on messages that originate at the relay itself.
pub const RELAY_UID: Uid = 0;

/// Errors raised while encoding or decoding signaling frames.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("malformed signaling frame: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("unknown participant role: {0}")]
    InvalidRole(String),
}

/// Envelope for every frame exchanged over the signaling transport.
///
/// On the wire this is a flat JSON object:
/// `{"type": "...", "roomId": "...", "uid": 1, "data": {...}}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignalMessage {
    pub room_id: RoomId,
    pub uid: Uid,
    #[serde(flatten)]
    pub signal: Signal,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "kebab-case")]
pub enum Signal {
    Join(JoinPayload),
    Leave(LeavePayload),
    Mute,
    Unmute,
    Offer(SessionPayload),
    Answer(SessionPayload),
    IceCandidate(CandidatePayload),
    ParticipantUpdate(RosterPayload),
    Heartbeat,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinPayload {
    pub role: Role,
}

/// Names the participant that left; may differ from the envelope sender when
/// the relay announces a departure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeavePayload {
    pub uid: Uid,
}

/// Offer or answer addressed to a single participant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionPayload {
    pub target_uid: Uid,
    pub sdp: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from_uid: Option<Uid>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CandidatePayload {
    pub target_uid: Uid,
    pub candidate: IceCandidate,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from_uid: Option<Uid>,
}

/// Network candidate in the browser-compatible `RTCIceCandidateInit` shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(
        default,
        rename = "sdpMLineIndex",
        skip_serializing_if = "Option::is_none"
    )]
    pub sdp_mline_index: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username_fragment: Option<String>,
}

/// Full roster, in registration order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RosterPayload {
    pub participants: Vec<Participant>,
}

impl Signal {
    /// Stable label used for logging and metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            Signal::Join(_) => "join",
            Signal::Leave(_) => "leave",
            Signal::Mute => "mute",
            Signal::Unmute => "unmute",
            Signal::Offer(_) => "offer",
            Signal::Answer(_) => "answer",
            Signal::IceCandidate(_) => "ice-candidate",
            Signal::ParticipantUpdate(_) => "participant-update",
            Signal::Heartbeat => "heartbeat",
        }
    }

    /// Target of a point-to-point message, `None` for everything else.
    pub fn target_uid(&self) -> Option<Uid> {
        match self {
            Signal::Offer(payload) | Signal::Answer(payload) => Some(payload.target_uid),
            Signal::IceCandidate(payload) => Some(payload.target_uid),
            _ => None,
        }
    }

    /// Originator recorded by the relay on point-to-point messages.
    pub fn from_uid(&self) -> Option<Uid> {
        match self {
            Signal::Offer(payload) | Signal::Answer(payload) => payload.from_uid,
            Signal::IceCandidate(payload) => payload.from_uid,
            _ => None,
        }
    }
}

impl SignalMessage {
    pub fn new(room_id: RoomId, uid: Uid, signal: Signal) -> Self {
        Self {
            room_id,
            uid,
            signal,
        }
    }

    pub fn join(room_id: RoomId, uid: Uid, role: Role) -> Self {
        Self::new(room_id, uid, Signal::Join(JoinPayload { role }))
    }

    pub fn heartbeat(room_id: RoomId, uid: Uid) -> Self {
        Self::new(room_id, uid, Signal::Heartbeat)
    }

    pub fn mute(room_id: RoomId, uid: Uid, muted: bool) -> Self {
        let signal = if muted { Signal::Mute } else { Signal::Unmute };
        Self::new(room_id, uid, signal)
    }

    pub fn leave(room_id: RoomId, sender: Uid, subject: Uid) -> Self {
        Self::new(room_id, sender, Signal::Leave(LeavePayload { uid: subject }))
    }

    pub fn offer(room_id: RoomId, uid: Uid, target_uid: Uid, sdp: String) -> Self {
        Self::new(
            room_id,
            uid,
            Signal::Offer(SessionPayload {
                target_uid,
                sdp,
                from_uid: None,
            }),
        )
    }

    pub fn answer(room_id: RoomId, uid: Uid, target_uid: Uid, sdp: String) -> Self {
        Self::new(
            room_id,
            uid,
            Signal::Answer(SessionPayload {
                target_uid,
                sdp,
                from_uid: None,
            }),
        )
    }

    pub fn ice_candidate(
        room_id: RoomId,
        uid: Uid,
        target_uid: Uid,
        candidate: IceCandidate,
    ) -> Self {
        Self::new(
            room_id,
            uid,
            Signal::IceCandidate(CandidatePayload {
                target_uid,
                candidate,
                from_uid: None,
            }),
        )
    }

    pub fn participant_update(room_id: RoomId, participants: Vec<Participant>) -> Self {
        Self::new(
            room_id,
            RELAY_UID,
            Signal::ParticipantUpdate(RosterPayload { participants }),
        )
    }

    /// Stamps the authoritative sender on the envelope and, for point-to-point
    /// messages, on `fromUid`. Whatever the client claimed is overwritten.
    pub fn with_sender(mut self, sender: Uid) -> Self {
        self.uid = sender;
        match &mut self.signal {
            Signal::Offer(payload) | Signal::Answer(payload) => payload.from_uid = Some(sender),
            Signal::IceCandidate(payload) => payload.from_uid = Some(sender),
            _ => {}
        }
        self
    }

    /// Uid of the participant that produced the message: `fromUid` when the
    /// relay stamped one, otherwise the envelope sender.
    pub fn origin(&self) -> Uid {
        self.signal.from_uid().unwrap_or(self.uid)
    }

    pub fn encode(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_str(text)?)
    }
}
