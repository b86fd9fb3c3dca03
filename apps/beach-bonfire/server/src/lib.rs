//! Signaling relay for Beach Bonfire voice rooms.
//!
//! Participants open a WebSocket at `/ws?roomId=..&uid=..&role=..`. The relay
//! keeps the authoritative roster per room, rebroadcasts it on every change,
//! and routes offers, answers and candidates to their target uid.

pub mod config;
pub mod registry;
pub mod relay;
pub mod routes;
pub mod telemetry;

pub use config::{Cli, ServerConfig};
pub use registry::{
    Outbound, Registration, RegistryConfig, RegistryError, RegistryStats, RoomRegistry,
    TransportHandle,
};
pub use relay::{Connection, Disposition, LivenessConfig, SignalingRelay};
pub use routes::{router, serve, AppState};
