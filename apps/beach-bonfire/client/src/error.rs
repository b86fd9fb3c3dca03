use std::time::Duration;

use beach_bonfire_core::Uid;
use thiserror::Error;

use crate::media::MediaError;

/// Failure confined to the link with one remote participant.
#[derive(Debug, Clone, Error)]
pub enum NegotiationError {
    #[error("media failure towards uid {uid}: {source}")]
    Media {
        uid: Uid,
        #[source]
        source: MediaError,
    },
    #[error("{stage} for uid {uid} timed out after {timeout:?}")]
    Timeout {
        uid: Uid,
        stage: &'static str,
        timeout: Duration,
    },
    #[error("media connection to uid {uid} failed")]
    ConnectionFailed { uid: Uid },
    #[error("media connection to uid {uid} closed")]
    ConnectionClosed { uid: Uid },
}

impl NegotiationError {
    pub fn uid(&self) -> Uid {
        match self {
            NegotiationError::Media { uid, .. }
            | NegotiationError::Timeout { uid, .. }
            | NegotiationError::ConnectionFailed { uid }
            | NegotiationError::ConnectionClosed { uid } => *uid,
        }
    }

    pub fn reason(&self) -> &'static str {
        match self {
            NegotiationError::Media { .. } => "media",
            NegotiationError::Timeout { .. } => "timeout",
            NegotiationError::ConnectionFailed { .. } => "connection_failed",
            NegotiationError::ConnectionClosed { .. } => "connection_closed",
        }
    }
}

/// Errors that affect the whole call rather than a single peer.
#[derive(Debug, Clone, Error)]
pub enum CallError {
    #[error("invalid client configuration: {0}")]
    Config(String),
    #[error("could not start local audio: {0}")]
    Media(#[from] MediaError),
    #[error("signaling transport error: {0}")]
    Transport(String),
    #[error("signaling connection lost; gave up after {attempts} reconnect attempts")]
    RetriesExhausted { attempts: u32 },
    #[error("a connection is already active or in progress")]
    AlreadyConnected,
    #[error("not connected")]
    NotConnected,
}

impl CallError {
    pub fn reason(&self) -> &'static str {
        match self {
            CallError::Config(_) => "config",
            CallError::Media(err) => err.reason(),
            CallError::Transport(_) => "transport",
            CallError::RetriesExhausted { .. } => "retries_exhausted",
            CallError::AlreadyConnected => "already_connected",
            CallError::NotConnected => "not_connected",
        }
    }
}
