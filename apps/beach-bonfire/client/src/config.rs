use std::time::Duration;

use beach_bonfire_core::{Role, RoomId, Uid};
use url::Url;

use crate::CallError;

const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_NEGOTIATION_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_ICE_RESTART_DELAY: Duration = Duration::from_secs(2);

const DEFAULT_STUN_URLS: &[&str] = &[
    "stun:stun.l.google.com:19302",
    "stun:stun1.l.google.com:19302",
    "stun:stun2.l.google.com:19302",
    "stun:stun3.l.google.com:19302",
    "stun:stun4.l.google.com:19302",
    "stun:stun.stunprotocol.org:3478",
    "stun:stun.cloudflare.com:3478",
];

/// Timing knobs for offer/answer production and recovery of failed links.
#[derive(Debug, Clone)]
pub struct NegotiationConfig {
    pub offer_timeout: Duration,
    pub answer_timeout: Duration,
    /// Pause before the initiating side restarts ICE on a failed link.
    pub ice_restart_delay: Duration,
    pub max_ice_restarts: u32,
}

impl NegotiationConfig {
    /// How long the non-initiating side waits for a restart offer before
    /// giving up on a failed link.
    pub fn restart_grace(&self) -> Duration {
        self.ice_restart_delay + self.offer_timeout
    }
}

impl Default for NegotiationConfig {
    fn default() -> Self {
        Self {
            offer_timeout: DEFAULT_NEGOTIATION_TIMEOUT,
            answer_timeout: DEFAULT_NEGOTIATION_TIMEOUT,
            ice_restart_delay: DEFAULT_ICE_RESTART_DELAY,
            max_ice_restarts: 1,
        }
    }
}

/// Bounded exponential backoff for signaling reconnects.
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl ReconnectPolicy {
    /// Delay before reconnect attempt `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        self.base_delay
            .saturating_mul(1u32 << exponent)
            .min(self.max_delay)
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            base_delay: Duration::from_secs(3),
            max_delay: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IceServerConfig {
    pub urls: Vec<String>,
    pub username: Option<String>,
    pub credential: Option<String>,
}

impl IceServerConfig {
    pub fn stun(url: impl Into<String>) -> Self {
        Self {
            urls: vec![url.into()],
            username: None,
            credential: None,
        }
    }

    /// Public STUN servers, overridable with `BONFIRE_STUN_URLS`, plus TURN
    /// servers from `BONFIRE_TURN_URLS` / `BONFIRE_TURN_USERNAME` /
    /// `BONFIRE_TURN_CREDENTIAL` when set.
    pub fn from_env() -> Vec<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Vec<Self> {
        let stun_urls = lookup("BONFIRE_STUN_URLS")
            .map(|value| split_urls(&value))
            .filter(|urls| !urls.is_empty())
            .unwrap_or_else(|| DEFAULT_STUN_URLS.iter().map(|url| url.to_string()).collect());
        let mut servers: Vec<Self> = stun_urls.into_iter().map(Self::stun).collect();

        if let Some(turn_urls) = lookup("BONFIRE_TURN_URLS").map(|value| split_urls(&value)) {
            if !turn_urls.is_empty() {
                servers.push(Self {
                    urls: turn_urls,
                    username: lookup("BONFIRE_TURN_USERNAME").filter(|v| !v.is_empty()),
                    credential: lookup("BONFIRE_TURN_CREDENTIAL").filter(|v| !v.is_empty()),
                });
            }
        }
        servers
    }
}

fn split_urls(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|url| !url.is_empty())
        .map(str::to_string)
        .collect()
}

/// Everything a client needs to join one room.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub signaling_url: Url,
    pub room_id: RoomId,
    pub uid: Uid,
    pub role: Role,
    pub heartbeat_interval: Duration,
    /// Bound on opening the signaling transport, handshake included.
    pub connect_timeout: Duration,
    pub reconnect: ReconnectPolicy,
    pub negotiation: NegotiationConfig,
    pub ice_servers: Vec<IceServerConfig>,
    /// Base URL of the room/participant persistence API, if mute state should
    /// be persisted there.
    pub directory_url: Option<Url>,
}

impl ClientConfig {
    pub fn new(
        signaling_url: &str,
        room_id: impl Into<RoomId>,
        uid: Uid,
        role: Role,
    ) -> Result<Self, CallError> {
        let signaling_url = Url::parse(signaling_url)
            .map_err(|err| CallError::Config(format!("invalid signaling url {signaling_url}: {err}")))?;
        if !matches!(signaling_url.scheme(), "ws" | "wss") {
            return Err(CallError::Config(format!(
                "signaling url must use ws:// or wss://, got {}",
                signaling_url.scheme()
            )));
        }
        Ok(Self {
            signaling_url,
            room_id: room_id.into(),
            uid,
            role,
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            reconnect: ReconnectPolicy::default(),
            negotiation: NegotiationConfig::default(),
            ice_servers: IceServerConfig::from_env(),
            directory_url: None,
        })
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_reconnect(mut self, policy: ReconnectPolicy) -> Self {
        self.reconnect = policy;
        self
    }

    pub fn with_negotiation(mut self, negotiation: NegotiationConfig) -> Self {
        self.negotiation = negotiation;
        self
    }

    pub fn with_directory(mut self, url: Url) -> Self {
        self.directory_url = Some(url);
        self
    }

    /// Signaling URL carrying the handshake query parameters.
    pub fn join_url(&self) -> Url {
        let mut url = self.signaling_url.clone();
        url.query_pairs_mut()
            .append_pair("roomId", self.room_id.as_str())
            .append_pair("uid", &self.uid.to_string())
            .append_pair("role", self.role.as_str());
        url
    }
}
