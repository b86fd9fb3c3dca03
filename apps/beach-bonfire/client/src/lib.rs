//! Client side of Beach Bonfire voice rooms.
//!
//! [`ConnectionSupervisor`] keeps the signaling connection alive and drives a
//! [`NegotiationEngine`], which in turn runs one peer link per remote
//! participant on top of a pluggable [`MediaBackend`].

pub mod config;
pub mod directory;
mod error;
pub mod events;
pub mod media;
pub mod negotiation;
pub mod peer_link;
pub mod supervisor;
#[cfg(any(test, feature = "test-support"))]
pub mod testing;
#[cfg(feature = "webrtc-media")]
pub mod webrtc_media;

pub use config::{ClientConfig, IceServerConfig, NegotiationConfig, ReconnectPolicy};
pub use directory::{DirectoryError, RoomDirectory};
pub use error::{CallError, NegotiationError};
pub use events::{CallEvent, ConnectionStatus};
pub use media::{
    LocalAudio, MediaBackend, MediaConnectionState, MediaError, MediaResult, MediaSession,
    SdpKind, SessionDescription, SessionEvent,
};
pub use negotiation::{should_initiate, NegotiationEngine};
pub use peer_link::{LinkEvent, NegotiationState};
pub use supervisor::ConnectionSupervisor;
#[cfg(feature = "webrtc-media")]
pub use webrtc_media::WebRtcMediaBackend;
