//! Seam between the negotiation engine and whatever actually moves audio.
//!
//! A [`MediaBackend`] hands out one shared [`LocalAudio`] capture per client
//! and one [`MediaSession`] per remote participant. Sessions report what
//! happens on the wire through a [`SessionEvent`] channel owned by the
//! session's peer link, so events stop flowing once the link is gone.

use std::{
    any::Any,
    fmt,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use async_trait::async_trait;
use beach_bonfire_core::{IceCandidate, Uid};
use thiserror::Error;
use tokio::sync::mpsc;

pub type MediaResult<T> = Result<T, MediaError>;

/// Failures raised by the media capability. The acquisition variants are kept
/// distinct so callers can tell the user what to fix.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum MediaError {
    #[error("microphone access was denied")]
    PermissionDenied,
    #[error("no audio input device was found")]
    NotFound,
    #[error("audio input device is in use by another application")]
    DeviceBusy,
    #[error("media backend error: {0}")]
    Backend(String),
}

impl MediaError {
    pub fn reason(&self) -> &'static str {
        match self {
            MediaError::PermissionDenied => "permission_denied",
            MediaError::NotFound => "device_not_found",
            MediaError::DeviceBusy => "device_busy",
            MediaError::Backend(_) => "backend",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SdpKind {
    Offer,
    Answer,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionDescription {
    pub kind: SdpKind,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Answer,
            sdp: sdp.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    LocalCandidate(IceCandidate),
    RemoteTrack { track_id: String },
    ConnectionState(MediaConnectionState),
}

/// The client's single microphone capture, shared by every peer link.
///
/// Muting flips one flag that every attached session observes; the capture
/// itself keeps running until [`stop`](Self::stop).
#[derive(Clone)]
pub struct LocalAudio {
    inner: Arc<LocalAudioInner>,
}

struct LocalAudioInner {
    id: String,
    enabled: AtomicBool,
    stopped: AtomicBool,
    source: Option<Arc<dyn Any + Send + Sync>>,
}

impl LocalAudio {
    pub fn new(id: impl Into<String>) -> Self {
        Self::build(id.into(), None)
    }

    /// Capture carrying a backend-specific track object, retrievable again
    /// with [`source`](Self::source).
    pub fn with_source<T: Any + Send + Sync>(id: impl Into<String>, source: Arc<T>) -> Self {
        Self::build(id.into(), Some(source as Arc<dyn Any + Send + Sync>))
    }

    fn build(id: String, source: Option<Arc<dyn Any + Send + Sync>>) -> Self {
        Self {
            inner: Arc::new(LocalAudioInner {
                id,
                enabled: AtomicBool::new(true),
                stopped: AtomicBool::new(false),
                source,
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn source<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        self.inner
            .source
            .as_ref()
            .and_then(|source| Arc::clone(source).downcast::<T>().ok())
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.enabled.load(Ordering::Acquire)
    }

    pub fn is_muted(&self) -> bool {
        !self.is_enabled()
    }

    /// Returns `true` when the flag actually changed.
    pub fn set_enabled(&self, enabled: bool) -> bool {
        self.inner.enabled.swap(enabled, Ordering::AcqRel) != enabled
    }

    pub fn stop(&self) {
        self.inner.stopped.store(true, Ordering::Release);
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.stopped.load(Ordering::Acquire)
    }
}

impl fmt::Debug for LocalAudio {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalAudio")
            .field("id", &self.inner.id)
            .field("enabled", &self.is_enabled())
            .field("stopped", &self.is_stopped())
            .finish()
    }
}

#[async_trait]
pub trait MediaBackend: Send + Sync {
    /// Opens the local microphone. Never retried by the caller.
    async fn acquire_local_audio(&self) -> MediaResult<LocalAudio>;

    /// Creates a transport session towards `remote_uid`. The session reports
    /// through `events` until it is closed.
    async fn create_session(
        &self,
        remote_uid: Uid,
        events: mpsc::UnboundedSender<SessionEvent>,
    ) -> MediaResult<Arc<dyn MediaSession>>;
}

#[async_trait]
pub trait MediaSession: Send + Sync {
    async fn add_local_track(&self, audio: &LocalAudio) -> MediaResult<()>;
    async fn create_offer(&self, ice_restart: bool) -> MediaResult<SessionDescription>;
    async fn create_answer(&self) -> MediaResult<SessionDescription>;
    async fn set_local_description(&self, description: SessionDescription) -> MediaResult<()>;
    async fn set_remote_description(&self, description: SessionDescription) -> MediaResult<()>;
    async fn add_remote_candidate(&self, candidate: IceCandidate) -> MediaResult<()>;
    async fn close(&self);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_timeout::timeout]
    fn mute_flag_is_shared_between_clones() {
        let audio = LocalAudio::new("mic");
        let attached = audio.clone();
        assert!(attached.is_enabled());
        assert!(audio.set_enabled(false));
        assert!(!audio.set_enabled(false));
        assert!(attached.is_muted());
    }

    #[test_timeout::timeout]
    fn source_downcasts_to_original_type() {
        let audio = LocalAudio::with_source("mic", Arc::new(42u16));
        assert_eq!(audio.source::<u16>().as_deref(), Some(&42));
        assert!(audio.source::<String>().is_none());
        assert!(LocalAudio::new("bare").source::<u16>().is_none());
    }
}
