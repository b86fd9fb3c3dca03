//! Scripted in-memory [`MediaBackend`] for tests.
//!
//! Sessions record every call they receive. Once a session has both a local
//! and a remote description it reports one local candidate, a remote track and
//! a `Connected` state, which is enough for two engines wired through a relay
//! to reach `Established` without any real networking.

use std::sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    Arc,
};

use async_trait::async_trait;
use beach_bonfire_core::{IceCandidate, Uid};
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::media::{
    LocalAudio, MediaBackend, MediaConnectionState, MediaError, MediaResult, MediaSession,
    SdpKind, SessionDescription, SessionEvent,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionCall {
    AddLocalTrack { audio_id: String, muted: bool },
    CreateOffer { ice_restart: bool },
    CreateAnswer,
    SetLocal(SdpKind),
    SetRemote(SdpKind),
    AddCandidate(IceCandidate),
    Close,
}

#[derive(Clone, Default)]
pub struct FakeMediaBackend {
    inner: Arc<BackendInner>,
}

#[derive(Default)]
struct BackendInner {
    acquire_error: Mutex<Option<MediaError>>,
    stall_offers: AtomicBool,
    acquired: Mutex<Vec<LocalAudio>>,
    sessions: Mutex<Vec<Arc<FakeSession>>>,
    next_session: AtomicU64,
}

impl FakeMediaBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every following `acquire_local_audio` fail with `error`.
    pub fn fail_acquire(&self, error: MediaError) {
        *self.inner.acquire_error.lock() = Some(error);
    }

    /// Makes offers created by new sessions never complete.
    pub fn stall_offers(&self, stall: bool) {
        self.inner.stall_offers.store(stall, Ordering::SeqCst);
    }

    pub fn acquired(&self) -> Vec<LocalAudio> {
        self.inner.acquired.lock().clone()
    }

    pub fn sessions(&self) -> Vec<Arc<FakeSession>> {
        self.inner.sessions.lock().clone()
    }

    /// Most recently created session towards `remote_uid`.
    pub fn session_for(&self, remote_uid: Uid) -> Option<Arc<FakeSession>> {
        self.inner
            .sessions
            .lock()
            .iter()
            .rev()
            .find(|session| session.remote_uid == remote_uid)
            .cloned()
    }
}

#[async_trait]
impl MediaBackend for FakeMediaBackend {
    async fn acquire_local_audio(&self) -> MediaResult<LocalAudio> {
        if let Some(error) = self.inner.acquire_error.lock().clone() {
            return Err(error);
        }
        let mut acquired = self.inner.acquired.lock();
        let audio = LocalAudio::new(format!("fake-mic-{}", acquired.len() + 1));
        acquired.push(audio.clone());
        Ok(audio)
    }

    async fn create_session(
        &self,
        remote_uid: Uid,
        events: mpsc::UnboundedSender<SessionEvent>,
    ) -> MediaResult<Arc<dyn MediaSession>> {
        let id = self.inner.next_session.fetch_add(1, Ordering::SeqCst) + 1;
        let session = Arc::new(FakeSession {
            id,
            remote_uid,
            events,
            stall_offers: self.inner.stall_offers.load(Ordering::SeqCst),
            calls: Mutex::new(Vec::new()),
            audio: Mutex::new(None),
            local_set: AtomicBool::new(false),
            remote_set: AtomicBool::new(false),
            connected: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        });
        self.inner.sessions.lock().push(Arc::clone(&session));
        Ok(session)
    }
}

pub struct FakeSession {
    id: u64,
    remote_uid: Uid,
    events: mpsc::UnboundedSender<SessionEvent>,
    stall_offers: bool,
    calls: Mutex<Vec<SessionCall>>,
    audio: Mutex<Option<LocalAudio>>,
    local_set: AtomicBool,
    remote_set: AtomicBool,
    connected: AtomicBool,
    closed: AtomicBool,
}

impl FakeSession {
    pub fn remote_uid(&self) -> Uid {
        self.remote_uid
    }

    pub fn calls(&self) -> Vec<SessionCall> {
        self.calls.lock().clone()
    }

    pub fn attached_audio(&self) -> Option<LocalAudio> {
        self.audio.lock().clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Reports a failed media connection, as a lost network path would.
    pub fn fail_connection(&self) {
        self.connected.store(false, Ordering::SeqCst);
        let _ = self.events.send(SessionEvent::ConnectionState(
            MediaConnectionState::Failed,
        ));
    }

    fn record(&self, call: SessionCall) {
        self.calls.lock().push(call);
    }

    fn maybe_connect(&self) {
        if !self.local_set.load(Ordering::SeqCst) || !self.remote_set.load(Ordering::SeqCst) {
            return;
        }
        if self.connected.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.events.send(SessionEvent::LocalCandidate(IceCandidate {
            candidate: format!("candidate:{} 1 udp 2122260223 127.0.0.1 {} typ host", self.id, 40000 + self.id),
            sdp_mid: Some("0".into()),
            sdp_mline_index: Some(0),
            username_fragment: None,
        }));
        let _ = self.events.send(SessionEvent::RemoteTrack {
            track_id: format!("audio-{}", self.remote_uid),
        });
        let _ = self.events.send(SessionEvent::ConnectionState(
            MediaConnectionState::Connected,
        ));
    }
}

#[async_trait]
impl MediaSession for FakeSession {
    async fn add_local_track(&self, audio: &LocalAudio) -> MediaResult<()> {
        self.record(SessionCall::AddLocalTrack {
            audio_id: audio.id().to_string(),
            muted: audio.is_muted(),
        });
        *self.audio.lock() = Some(audio.clone());
        Ok(())
    }

    async fn create_offer(&self, ice_restart: bool) -> MediaResult<SessionDescription> {
        self.record(SessionCall::CreateOffer { ice_restart });
        if self.stall_offers {
            std::future::pending::<()>().await;
        }
        if ice_restart {
            self.remote_set.store(false, Ordering::SeqCst);
        }
        Ok(SessionDescription::offer(format!(
            "v=0 fake-offer session={} restart={ice_restart}",
            self.id
        )))
    }

    async fn create_answer(&self) -> MediaResult<SessionDescription> {
        self.record(SessionCall::CreateAnswer);
        Ok(SessionDescription::answer(format!(
            "v=0 fake-answer session={}",
            self.id
        )))
    }

    async fn set_local_description(&self, description: SessionDescription) -> MediaResult<()> {
        self.record(SessionCall::SetLocal(description.kind));
        self.local_set.store(true, Ordering::SeqCst);
        self.maybe_connect();
        Ok(())
    }

    async fn set_remote_description(&self, description: SessionDescription) -> MediaResult<()> {
        self.record(SessionCall::SetRemote(description.kind));
        self.remote_set.store(true, Ordering::SeqCst);
        self.maybe_connect();
        Ok(())
    }

    async fn add_remote_candidate(&self, candidate: IceCandidate) -> MediaResult<()> {
        self.record(SessionCall::AddCandidate(candidate));
        Ok(())
    }

    async fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.record(SessionCall::Close);
        }
    }
}
