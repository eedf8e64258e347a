#![forbid(unsafe_code)]

// Host configuration: network surface, viewer limits, reconnection policy,
// bitrate adaptation envelope, and ICE transport setup.

use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr};
use std::num::NonZeroUsize;
use std::time::Duration;

use crate::error::{CoreError, CoreResult};

/// Top-level host configuration, assembled once at startup.
#[derive(Debug, Clone)]
pub struct HostConfig {
    /// Port the signaling gateway binds to. 0 asks the OS for an ephemeral port.
    pub port: u16,
    /// Address advertised in join URLs (not the bind address, which is 0.0.0.0).
    pub host_ip: IpAddr,
    /// Directory served as the viewer web bundle.
    pub web_root: String,
    /// Concurrent-viewer cap. `None` means unlimited.
    pub max_viewers: Option<NonZeroUsize>,
    pub session: SessionConfig,
    pub reconnect: ReconnectPolicy,
    pub bitrate: BitratePolicy,
    pub sweep: SweepPolicy,
    pub ice: IceConfig,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            port: 8420,
            host_ip: IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)),
            web_root: "web/dist".to_string(),
            max_viewers: NonZeroUsize::new(16),
            session: SessionConfig::default(),
            reconnect: ReconnectPolicy::default(),
            bitrate: BitratePolicy::default(),
            sweep: SweepPolicy::default(),
            ice: IceConfig::default(),
        }
    }
}

impl HostConfig {
    /// Load from `LANCAST_*` environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            port: env_parse("LANCAST_PORT", defaults.port),
            host_ip: env_parse("LANCAST_HOST_IP", defaults.host_ip),
            web_root: std::env::var("LANCAST_WEB_ROOT").unwrap_or(defaults.web_root),
            // 0 lifts the cap; malformed input keeps the default
            max_viewers: match std::env::var("LANCAST_MAX_VIEWERS") {
                Ok(v) => viewer_cap(&v, defaults.max_viewers),
                Err(_) => defaults.max_viewers,
            },
            session: SessionConfig::from_env(),
            reconnect: ReconnectPolicy::from_env(),
            bitrate: BitratePolicy::from_env(),
            sweep: SweepPolicy::from_env(),
            ice: IceConfig::from_env(),
        }
    }

    /// The URL viewers open to join a room.
    pub fn join_url(&self, code: &str) -> String {
        format!("http://{}:{}/room/{}", self.host_ip, self.port, code)
    }

    /// Rejects configurations that cannot work before anything is started.
    pub fn validate(&self) -> CoreResult<()> {
        if self.session.max_message_bytes < 1024 {
            return Err(CoreError::Resource(
                "session.max_message_bytes below 1024".into(),
            ));
        }
        if self.session.idle_timeout.is_zero() {
            return Err(CoreError::Resource("session.idle_timeout is zero".into()));
        }
        if self.reconnect.max_attempts == 0 {
            return Err(CoreError::Resource("reconnect.max_attempts is zero".into()));
        }
        if self.bitrate.min_bitrate >= self.bitrate.max_bitrate {
            return Err(CoreError::Resource(
                "bitrate.min_bitrate must be below bitrate.max_bitrate".into(),
            ));
        }
        if self.sweep.inactivity_window < self.sweep.interval {
            return Err(CoreError::Resource(
                "sweep.inactivity_window shorter than sweep.interval".into(),
            ));
        }
        self.ice.validate()
    }
}

/// Per-WebSocket-session limits.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Largest inbound frame the gateway will accept.
    pub max_message_bytes: usize,
    /// Sessions silent for this long are closed.
    pub idle_timeout: Duration,
    /// Outbound message buffer per session; slow viewers drop, never block.
    pub outbound_buffer: usize,
    /// Token-bucket burst size for inbound messages.
    pub rate_limit_burst: u32,
    /// Token-bucket refill per second.
    pub rate_limit_per_sec: u32,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_message_bytes: 64 * 1024,
            idle_timeout: Duration::from_secs(300),
            outbound_buffer: 64,
            rate_limit_burst: 30,
            rate_limit_per_sec: 15,
        }
    }
}

impl SessionConfig {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            max_message_bytes: env_parse("LANCAST_MAX_MESSAGE_BYTES", d.max_message_bytes),
            idle_timeout: env_secs("LANCAST_IDLE_TIMEOUT_SECS", d.idle_timeout),
            outbound_buffer: d.outbound_buffer,
            rate_limit_burst: env_parse("LANCAST_RATE_BURST", d.rate_limit_burst),
            rate_limit_per_sec: env_parse("LANCAST_RATE_PER_SEC", d.rate_limit_per_sec),
        }
    }
}

/// Reconnection behaviour after a transport drop.
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    /// Attempts before the connection is torn down for good.
    pub max_attempts: u32,
    /// Fixed delay before each attempt.
    pub backoff: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            backoff: Duration::from_secs(2),
        }
    }
}

impl ReconnectPolicy {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            max_attempts: env_parse("LANCAST_RECONNECT_MAX_ATTEMPTS", d.max_attempts),
            backoff: env_millis("LANCAST_RECONNECT_BACKOFF_MS", d.backoff),
        }
    }
}

/// Envelope and pacing for the adaptive bitrate loop.
#[derive(Debug, Clone)]
pub struct BitratePolicy {
    /// How often transport stats are sampled per connection.
    pub sample_interval: Duration,
    /// Minimum spacing between two committed adjustments for one connection.
    pub cooldown: Duration,
    /// Floor of the recommendation envelope, bits per second.
    pub min_bitrate: u64,
    /// Ceiling of the recommendation envelope, bits per second.
    pub max_bitrate: u64,
}

impl Default for BitratePolicy {
    fn default() -> Self {
        Self {
            sample_interval: Duration::from_secs(2),
            cooldown: Duration::from_secs(5),
            min_bitrate: 250_000,
            max_bitrate: 8_000_000,
        }
    }
}

impl BitratePolicy {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            sample_interval: env_millis("LANCAST_BITRATE_INTERVAL_MS", d.sample_interval),
            cooldown: env_millis("LANCAST_BITRATE_COOLDOWN_MS", d.cooldown),
            min_bitrate: env_parse("LANCAST_MIN_BITRATE", d.min_bitrate),
            max_bitrate: env_parse("LANCAST_MAX_BITRATE", d.max_bitrate),
        }
    }
}

/// Eviction of connections whose transport has gone silent.
#[derive(Debug, Clone)]
pub struct SweepPolicy {
    /// A connection with no transport activity for this long is evicted.
    pub inactivity_window: Duration,
    /// How often the sweep runs.
    pub interval: Duration,
}

impl Default for SweepPolicy {
    fn default() -> Self {
        Self {
            inactivity_window: Duration::from_secs(60),
            interval: Duration::from_secs(20),
        }
    }
}

impl SweepPolicy {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            inactivity_window: env_secs("LANCAST_SWEEP_WINDOW_SECS", d.inactivity_window),
            interval: env_secs("LANCAST_SWEEP_INTERVAL_SECS", d.interval),
        }
    }
}

/// ICE transport setup handed to the media engine for every peer connection.
#[derive(Debug, Clone)]
pub struct IceConfig {
    pub stun_urls: Vec<String>,
    pub turn: Option<TurnServer>,
    pub bundle_policy: BundlePolicy,
    pub candidate_pool_size: u8,
}

/// A TURN server with static credentials, for hosts behind strict LAN segments.
#[derive(Debug, Clone)]
pub struct TurnServer {
    pub urls: Vec<String>,
    pub username: String,
    pub credential: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BundlePolicy {
    Balanced,
    MaxCompat,
    MaxBundle,
}

/// ICE server entry in the shape the engine and browser clients expect.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceServer {
    pub urls: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

impl Default for IceConfig {
    fn default() -> Self {
        Self {
            stun_urls: vec!["stun:stun.l.google.com:19302".to_string()],
            turn: None,
            bundle_policy: BundlePolicy::MaxBundle,
            candidate_pool_size: 0,
        }
    }
}

impl IceConfig {
    /// Load from environment variables. TURN stays off unless both
    /// LANCAST_TURN_URLS and LANCAST_TURN_USERNAME are set.
    pub fn from_env() -> Self {
        let d = Self::default();
        let stun_urls = match std::env::var("LANCAST_STUN_URLS") {
            Ok(v) => split_urls(&v),
            Err(_) => d.stun_urls,
        };
        let turn = match (
            std::env::var("LANCAST_TURN_URLS"),
            std::env::var("LANCAST_TURN_USERNAME"),
        ) {
            (Ok(urls), Ok(username)) => Some(TurnServer {
                urls: split_urls(&urls),
                username,
                credential: std::env::var("LANCAST_TURN_CREDENTIAL").unwrap_or_default(),
            }),
            _ => None,
        };
        Self {
            stun_urls,
            turn,
            bundle_policy: d.bundle_policy,
            candidate_pool_size: env_parse("LANCAST_ICE_POOL_SIZE", d.candidate_pool_size),
        }
    }

    /// Flattened list handed to the native peer-connection factory.
    pub fn ice_servers(&self) -> Vec<IceServer> {
        let mut servers = Vec::new();
        if !self.stun_urls.is_empty() {
            servers.push(IceServer {
                urls: self.stun_urls.clone(),
                username: None,
                credential: None,
            });
        }
        if let Some(turn) = &self.turn {
            servers.push(IceServer {
                urls: turn.urls.clone(),
                username: Some(turn.username.clone()),
                credential: Some(turn.credential.clone()),
            });
        }
        servers
    }

    pub fn validate(&self) -> CoreResult<()> {
        for url in &self.stun_urls {
            if !url.starts_with("stun:") && !url.starts_with("stuns:") {
                return Err(CoreError::Resource(format!("not a STUN url: {url}")));
            }
        }
        if let Some(turn) = &self.turn {
            for url in &turn.urls {
                if !url.starts_with("turn:") && !url.starts_with("turns:") {
                    return Err(CoreError::Resource(format!("not a TURN url: {url}")));
                }
            }
        }
        Ok(())
    }
}

fn split_urls(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_secs(key: &str, default: Duration) -> Duration {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .map(Duration::from_secs)
        .unwrap_or(default)
}

fn env_millis(key: &str, default: Duration) -> Duration {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .map(Duration::from_millis)
        .unwrap_or(default)
}

fn viewer_cap(raw: &str, fallback: Option<NonZeroUsize>) -> Option<NonZeroUsize> {
    match raw.trim().parse::<usize>() {
        Ok(n) => NonZeroUsize::new(n),
        Err(_) => fallback,
    }
}
