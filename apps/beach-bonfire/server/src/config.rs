use std::{net::SocketAddr, time::Duration};

use anyhow::{bail, Context};
use clap::Parser;

use crate::{registry::RegistryConfig, relay::LivenessConfig};

#[derive(Debug, Parser)]
#[command(
    name = "beach-bonfire-server",
    author,
    version,
    about = "Beach Bonfire voice-room signaling relay"
)]
pub struct Cli {
    /// Address to bind the HTTP/WebSocket listener to.
    #[arg(long, env = "BONFIRE_LISTEN_ADDR", default_value = "0.0.0.0:8080")]
    pub listen_addr: String,

    /// Interval clients heartbeat at; the liveness sweep runs on the same period.
    #[arg(long, env = "BONFIRE_HEARTBEAT_INTERVAL_SECS", default_value_t = 30)]
    pub heartbeat_interval_secs: u64,

    /// Missed heartbeat intervals tolerated before a participant is evicted.
    #[arg(long, env = "BONFIRE_HEARTBEAT_TIMEOUT_FACTOR", default_value_t = 3)]
    pub heartbeat_timeout_factor: u32,

    /// Maximum participants admitted to a single room.
    #[arg(long, env = "BONFIRE_ROOM_CAPACITY", default_value_t = 32)]
    pub room_capacity: usize,

    /// Grace period applied during shutdown.
    #[arg(long, env = "BONFIRE_SHUTDOWN_GRACE_SECS", default_value_t = 2)]
    pub shutdown_grace_secs: u64,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub listen_addr: SocketAddr,
    pub liveness: LivenessConfig,
    pub registry: RegistryConfig,
    pub shutdown_grace: Duration,
}

impl TryFrom<Cli> for ServerConfig {
    type Error = anyhow::Error;

    fn try_from(cli: Cli) -> Result<Self, Self::Error> {
        let listen_addr: SocketAddr = cli
            .listen_addr
            .parse()
            .with_context(|| format!("invalid listen address: {}", cli.listen_addr))?;
        if cli.heartbeat_interval_secs == 0 {
            bail!("heartbeat interval must be at least one second");
        }
        if cli.heartbeat_timeout_factor == 0 {
            bail!("heartbeat timeout factor must be at least 1");
        }
        if cli.room_capacity == 0 {
            bail!("room capacity must be at least 1");
        }

        Ok(ServerConfig {
            listen_addr,
            liveness: LivenessConfig {
                heartbeat_interval: Duration::from_secs(cli.heartbeat_interval_secs),
                timeout_factor: cli.heartbeat_timeout_factor,
            },
            registry: RegistryConfig {
                room_capacity: cli.room_capacity,
            },
            shutdown_grace: Duration::from_secs(cli.shutdown_grace_secs),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_timeout::timeout]
    fn defaults_match_client_heartbeat() {
        let cli = Cli::try_parse_from(["beach-bonfire-server"]).unwrap();
        let config = ServerConfig::try_from(cli).unwrap();
        assert_eq!(config.listen_addr.port(), 8080);
        assert_eq!(config.liveness.timeout(), Duration::from_secs(90));
        assert_eq!(config.registry.room_capacity, 32);
    }

    #[test_timeout::timeout]
    fn rejects_invalid_values() {
        let cli = Cli::try_parse_from(["beach-bonfire-server", "--listen-addr", "nope"]).unwrap();
        assert!(ServerConfig::try_from(cli).is_err());

        let cli = Cli::try_parse_from(["beach-bonfire-server", "--room-capacity", "0"]).unwrap();
        assert!(ServerConfig::try_from(cli).is_err());
    }
}
