//! [`MediaBackend`] on top of the `webrtc` crate.
//!
//! The shared capture is one Opus [`TrackLocalStaticSample`]; every peer
//! connection gets the same track, so a single muted flag silences all of
//! them. Whatever produces audio feeds it with [`write_audio_sample`].

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use beach_bonfire_core::{IceCandidate, Uid};
use bytes::Bytes;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};
use webrtc::{
    api::{
        interceptor_registry::register_default_interceptors, media_engine::MediaEngine,
        media_engine::MIME_TYPE_OPUS, APIBuilder, API,
    },
    ice_transport::{
        ice_candidate::{RTCIceCandidate, RTCIceCandidateInit},
        ice_server::RTCIceServer,
    },
    interceptor::registry::Registry,
    media::Sample,
    peer_connection::{
        configuration::RTCConfiguration, offer_answer_options::RTCOfferOptions,
        peer_connection_state::RTCPeerConnectionState,
        sdp::session_description::RTCSessionDescription, RTCPeerConnection,
    },
    rtp_transceiver::rtp_codec::RTCRtpCodecCapability,
    track::{
        track_local::{track_local_static_sample::TrackLocalStaticSample, TrackLocal},
        track_remote::TrackRemote,
    },
};

use crate::{
    config::IceServerConfig,
    media::{
        LocalAudio, MediaBackend, MediaConnectionState, MediaError, MediaResult, MediaSession,
        SdpKind, SessionDescription, SessionEvent,
    },
};

const OPUS_CLOCK_RATE: u32 = 48_000;
const OPUS_CHANNELS: u16 = 2;
const LOCAL_TRACK_ID: &str = "bonfire-audio";
const LOCAL_STREAM_ID: &str = "bonfire-local";

pub struct WebRtcMediaBackend {
    api: API,
    ice_servers: Vec<RTCIceServer>,
}

impl WebRtcMediaBackend {
    pub fn new(ice_servers: &[IceServerConfig]) -> MediaResult<Self> {
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs().map_err(backend)?;
        let registry = register_default_interceptors(Registry::new(), &mut media_engine)
            .map_err(backend)?;
        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let ice_servers = ice_servers
            .iter()
            .map(|server| RTCIceServer {
                urls: server.urls.clone(),
                username: server.username.clone().unwrap_or_default(),
                credential: server.credential.clone().unwrap_or_default(),
                ..Default::default()
            })
            .collect();
        Ok(Self { api, ice_servers })
    }
}

#[async_trait]
impl MediaBackend for WebRtcMediaBackend {
    async fn acquire_local_audio(&self) -> MediaResult<LocalAudio> {
        let track = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_owned(),
                clock_rate: OPUS_CLOCK_RATE,
                channels: OPUS_CHANNELS,
                sdp_fmtp_line: "minptime=10;useinbandfec=1".to_owned(),
                rtcp_feedback: vec![],
            },
            LOCAL_TRACK_ID.to_owned(),
            LOCAL_STREAM_ID.to_owned(),
        ));
        Ok(LocalAudio::with_source(LOCAL_TRACK_ID, track))
    }

    async fn create_session(
        &self,
        remote_uid: Uid,
        events: mpsc::UnboundedSender<SessionEvent>,
    ) -> MediaResult<Arc<dyn MediaSession>> {
        let config = RTCConfiguration {
            ice_servers: self.ice_servers.clone(),
            ..Default::default()
        };
        let pc = Arc::new(self.api.new_peer_connection(config).await.map_err(backend)?);

        let candidate_tx = events.clone();
        pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let tx = candidate_tx.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else {
                    return;
                };
                match candidate.to_json() {
                    Ok(init) => {
                        let _ = tx.send(SessionEvent::LocalCandidate(IceCandidate {
                            candidate: init.candidate,
                            sdp_mid: init.sdp_mid,
                            sdp_mline_index: init.sdp_mline_index,
                            username_fragment: init.username_fragment,
                        }));
                    }
                    Err(err) => warn!(remote_uid, error = %err, "failed to serialize local candidate"),
                }
            })
        }));

        let track_tx = events.clone();
        pc.on_track(Box::new(move |track: Arc<TrackRemote>, _receiver, _transceiver| {
            let tx = track_tx.clone();
            Box::pin(async move {
                debug!(remote_uid, track_id = %track.id(), kind = %track.kind(), "remote track");
                let _ = tx.send(SessionEvent::RemoteTrack {
                    track_id: track.id(),
                });
                tokio::spawn(async move {
                    while track.read_rtp().await.is_ok() {}
                    trace!(remote_uid, "remote track ended");
                });
            })
        }));

        let state_tx = events;
        pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            let tx = state_tx.clone();
            Box::pin(async move {
                let mapped = match state {
                    RTCPeerConnectionState::New => MediaConnectionState::New,
                    RTCPeerConnectionState::Connecting => MediaConnectionState::Connecting,
                    RTCPeerConnectionState::Connected => MediaConnectionState::Connected,
                    RTCPeerConnectionState::Disconnected => MediaConnectionState::Disconnected,
                    RTCPeerConnectionState::Failed => MediaConnectionState::Failed,
                    RTCPeerConnectionState::Closed => MediaConnectionState::Closed,
                    RTCPeerConnectionState::Unspecified => return,
                };
                let _ = tx.send(SessionEvent::ConnectionState(mapped));
            })
        }));

        Ok(Arc::new(WebRtcSession { remote_uid, pc }))
    }
}

struct WebRtcSession {
    remote_uid: Uid,
    pc: Arc<RTCPeerConnection>,
}

#[async_trait]
impl MediaSession for WebRtcSession {
    async fn add_local_track(&self, audio: &LocalAudio) -> MediaResult<()> {
        let track = audio
            .source::<TrackLocalStaticSample>()
            .ok_or_else(|| MediaError::Backend("local audio has no webrtc track".into()))?;
        let sender = self
            .pc
            .add_track(track as Arc<dyn TrackLocal + Send + Sync>)
            .await
            .map_err(backend)?;

        // RTCP has to be drained for the interceptors to run.
        tokio::spawn(async move {
            let mut buf = vec![0u8; 1500];
            while sender.read(&mut buf).await.is_ok() {}
        });
        Ok(())
    }

    async fn create_offer(&self, ice_restart: bool) -> MediaResult<SessionDescription> {
        let options = RTCOfferOptions {
            ice_restart,
            ..Default::default()
        };
        let offer = self.pc.create_offer(Some(options)).await.map_err(backend)?;
        Ok(SessionDescription::offer(offer.sdp))
    }

    async fn create_answer(&self) -> MediaResult<SessionDescription> {
        let answer = self.pc.create_answer(None).await.map_err(backend)?;
        Ok(SessionDescription::answer(answer.sdp))
    }

    async fn set_local_description(&self, description: SessionDescription) -> MediaResult<()> {
        let description = to_rtc(description)?;
        self.pc
            .set_local_description(description)
            .await
            .map_err(backend)
    }

    async fn set_remote_description(&self, description: SessionDescription) -> MediaResult<()> {
        let description = to_rtc(description)?;
        self.pc
            .set_remote_description(description)
            .await
            .map_err(backend)
    }

    async fn add_remote_candidate(&self, candidate: IceCandidate) -> MediaResult<()> {
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_mline_index,
            username_fragment: candidate.username_fragment,
        };
        self.pc.add_ice_candidate(init).await.map_err(backend)
    }

    async fn close(&self) {
        if let Err(err) = self.pc.close().await {
            debug!(remote_uid = self.remote_uid, error = %err, "peer connection close failed");
        }
    }
}

/// Pushes one encoded Opus frame into the shared capture. Frames are dropped
/// while the capture is muted or stopped.
pub async fn write_audio_sample(
    audio: &LocalAudio,
    data: Bytes,
    duration: Duration,
) -> MediaResult<bool> {
    if audio.is_stopped() || audio.is_muted() {
        return Ok(false);
    }
    let track = audio
        .source::<TrackLocalStaticSample>()
        .ok_or_else(|| MediaError::Backend("local audio has no webrtc track".into()))?;
    track
        .write_sample(&Sample {
            data,
            duration,
            ..Default::default()
        })
        .await
        .map_err(backend)?;
    Ok(true)
}

fn to_rtc(description: SessionDescription) -> MediaResult<RTCSessionDescription> {
    match description.kind {
        SdpKind::Offer => RTCSessionDescription::offer(description.sdp),
        SdpKind::Answer => RTCSessionDescription::answer(description.sdp),
    }
    .map_err(backend)
}

fn backend(err: webrtc::Error) -> MediaError {
    MediaError::Backend(err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_timeout::tokio_timeout_test]
    async fn muted_capture_drops_samples() {
        let backend = WebRtcMediaBackend::new(&[]).unwrap();
        let audio = backend.acquire_local_audio().await.unwrap();
        assert!(audio.source::<TrackLocalStaticSample>().is_some());

        audio.set_enabled(false);
        let written = write_audio_sample(
            &audio,
            Bytes::from_static(&[0xF8, 0xFF, 0xFE]),
            Duration::from_millis(20),
        )
        .await
        .unwrap();
        assert!(!written);
    }

    #[test_timeout::tokio_timeout_test]
    async fn offer_carries_local_audio() {
        let backend = WebRtcMediaBackend::new(&[]).unwrap();
        let audio = backend.acquire_local_audio().await.unwrap();
        let (tx, _rx) = mpsc::unbounded_channel();
        let session = backend.create_session(2, tx).await.unwrap();

        session.add_local_track(&audio).await.unwrap();
        let offer = session.create_offer(false).await.unwrap();
        assert_eq!(offer.kind, SdpKind::Offer);
        assert!(offer.sdp.contains("m=audio"));
        assert!(offer.sdp.to_lowercase().contains("opus"));
        session.close().await;
    }
}
