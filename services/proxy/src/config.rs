//! Proxy configuration.
//!
//! Read from `VEIL_*` environment variables. When `VEIL_CONFIG_FILE` names
//! a JSON file, its settings are laid over the environment's. Out-of-range
//! values are clamped rather than rejected; unparseable ones are errors.

use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use serde::Deserialize;

use crate::bridge::{BridgeConfig, MAX_POLL_WAIT};
use crate::dialer::{parse_static_hosts, TargetDialer, DEFAULT_CONNECT_TIMEOUT, DEFAULT_TARGET_PORT};
use crate::edge::EdgeConfig;
use crate::handoff::{parse_strategies, Strategy, DEFAULT_ORDER};
use crate::handshake::{
    HandshakeConfig, DEFAULT_EMPTY_POLL_LIMIT, DEFAULT_FIRST_RESPONSE_TIMEOUT,
    DEFAULT_HANDSHAKE_TIMEOUT, DEFAULT_POLL_WAIT,
};
use crate::oob::RemoteOobConfig;
use crate::reaper::ReaperConfig;
use crate::relay::{RelayConfig, DEFAULT_IDLE_TIMEOUT};

/// Which halves of the proxy this process runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// Client-facing listener talking to a remote bridge.
    Edge,
    /// Target-facing HTTP control surface only.
    Bridge,
    /// Both, connected in process.
    Combined,
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Mode::Edge => "edge",
            Mode::Bridge => "bridge",
            Mode::Combined => "combined",
        };
        f.write_str(s)
    }
}

impl FromStr for Mode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "edge" => Ok(Mode::Edge),
            "bridge" => Ok(Mode::Bridge),
            "combined" => Ok(Mode::Combined),
            other => Err(format!(
                "unknown mode '{other}' (expected edge, bridge, or combined)"
            )),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub mode: Mode,
    /// Edge listener address.
    pub listen_addr: SocketAddr,
    /// Bridge HTTP control surface address.
    pub bridge_listen_addr: SocketAddr,
    /// Remote bridge base URL, used in edge mode.
    pub bridge_url: String,
    pub handshake: HandshakeConfig,
    /// Relay read deadline.
    pub idle_timeout: Duration,
    pub reaper_interval: Duration,
    /// Sessions idle this long are reaped.
    pub session_idle: Duration,
    /// How long the bridge keeps a completed, unclaimed session.
    pub completion_grace: Duration,
    pub handoff: Vec<Strategy>,
    /// Resolver overrides for target host names.
    pub static_hosts: HashMap<String, SocketAddr>,
    pub target_port: u16,
    pub max_connections: usize,
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
}

/// Raw settings before defaults and clamping. Field names double as the
/// JSON config file keys.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct Settings {
    mode: Option<Mode>,
    listen_addr: Option<SocketAddr>,
    bridge_listen_addr: Option<SocketAddr>,
    bridge_url: Option<String>,
    handshake_timeout_ms: Option<u64>,
    first_response_timeout_ms: Option<u64>,
    poll_wait_ms: Option<u64>,
    empty_poll_limit: Option<u32>,
    idle_timeout_secs: Option<u64>,
    reaper_interval_secs: Option<u64>,
    session_idle_secs: Option<u64>,
    completion_grace_secs: Option<u64>,
    handoff: Option<Vec<Strategy>>,
    static_hosts: Option<HashMap<String, SocketAddr>>,
    target_port: Option<u16>,
    max_connections: Option<usize>,
    log_level: Option<String>,
}

fn var<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    lookup(key)
        .map(|v| v.trim().parse::<T>().map_err(|e| anyhow!("{key}: {e}")))
        .transpose()
}

impl Settings {
    fn from_lookup(lookup: &impl Fn(&str) -> Option<String>) -> Result<Self> {
        Ok(Self {
            mode: var(lookup, "VEIL_MODE")?,
            listen_addr: var(lookup, "VEIL_LISTEN_ADDR")?,
            bridge_listen_addr: var(lookup, "VEIL_BRIDGE_LISTEN_ADDR")?,
            bridge_url: lookup("VEIL_BRIDGE_URL"),
            handshake_timeout_ms: var(lookup, "VEIL_HANDSHAKE_TIMEOUT_MS")?,
            first_response_timeout_ms: var(lookup, "VEIL_FIRST_RESPONSE_TIMEOUT_MS")?,
            poll_wait_ms: var(lookup, "VEIL_POLL_WAIT_MS")?,
            empty_poll_limit: var(lookup, "VEIL_EMPTY_POLL_LIMIT")?,
            idle_timeout_secs: var(lookup, "VEIL_IDLE_TIMEOUT_SECS")?,
            reaper_interval_secs: var(lookup, "VEIL_REAPER_INTERVAL_SECS")?,
            session_idle_secs: var(lookup, "VEIL_SESSION_IDLE_SECS")?,
            completion_grace_secs: var(lookup, "VEIL_COMPLETION_GRACE_SECS")?,
            handoff: lookup("VEIL_HANDOFF")
                .map(|v| parse_strategies(&v).map_err(|e| anyhow!("VEIL_HANDOFF: {e}")))
                .transpose()?,
            static_hosts: lookup("VEIL_STATIC_HOSTS")
                .map(|v| parse_static_hosts(&v).map_err(|e| anyhow!("VEIL_STATIC_HOSTS: {e}")))
                .transpose()?,
            target_port: var(lookup, "VEIL_TARGET_PORT")?,
            max_connections: var(lookup, "VEIL_MAX_CONNECTIONS")?,
            log_level: lookup("VEIL_LOG_LEVEL"),
        })
    }

    fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        serde_json::from_str(&raw)
            .with_context(|| format!("Invalid config file {}", path.display()))
    }

    /// Fields set in `other` win.
    fn overlay(self, other: Settings) -> Settings {
        Settings {
            mode: other.mode.or(self.mode),
            listen_addr: other.listen_addr.or(self.listen_addr),
            bridge_listen_addr: other.bridge_listen_addr.or(self.bridge_listen_addr),
            bridge_url: other.bridge_url.or(self.bridge_url),
            handshake_timeout_ms: other.handshake_timeout_ms.or(self.handshake_timeout_ms),
            first_response_timeout_ms: other
                .first_response_timeout_ms
                .or(self.first_response_timeout_ms),
            poll_wait_ms: other.poll_wait_ms.or(self.poll_wait_ms),
            empty_poll_limit: other.empty_poll_limit.or(self.empty_poll_limit),
            idle_timeout_secs: other.idle_timeout_secs.or(self.idle_timeout_secs),
            reaper_interval_secs: other.reaper_interval_secs.or(self.reaper_interval_secs),
            session_idle_secs: other.session_idle_secs.or(self.session_idle_secs),
            completion_grace_secs: other.completion_grace_secs.or(self.completion_grace_secs),
            handoff: other.handoff.or(self.handoff),
            static_hosts: other.static_hosts.or(self.static_hosts),
            target_port: other.target_port.or(self.target_port),
            max_connections: other.max_connections.or(self.max_connections),
            log_level: other.log_level.or(self.log_level),
        }
    }

    fn resolve(self) -> Result<Config> {
        let handoff = self.handoff.unwrap_or_else(|| DEFAULT_ORDER.to_vec());
        if handoff.is_empty() {
            return Err(anyhow!("handoff strategy list is empty"));
        }

        let ms = |v: Option<u64>, default: Duration| v.map(Duration::from_millis).unwrap_or(default);
        let secs = |v: Option<u64>, default: u64| Duration::from_secs(v.unwrap_or(default).max(1));

        let handshake_timeout = ms(self.handshake_timeout_ms, DEFAULT_HANDSHAKE_TIMEOUT)
            .clamp(Duration::from_secs(1), Duration::from_secs(60));
        let first_response_timeout = ms(
            self.first_response_timeout_ms,
            DEFAULT_FIRST_RESPONSE_TIMEOUT,
        )
        .clamp(Duration::from_millis(100), Duration::from_secs(60));
        let poll_wait = ms(self.poll_wait_ms, DEFAULT_POLL_WAIT)
            .clamp(Duration::from_millis(10), MAX_POLL_WAIT);

        Ok(Config {
            mode: self.mode.unwrap_or(Mode::Combined),
            listen_addr: self
                .listen_addr
                .unwrap_or_else(|| SocketAddr::from(([127, 0, 0, 1], 8443))),
            bridge_listen_addr: self
                .bridge_listen_addr
                .unwrap_or_else(|| SocketAddr::from(([127, 0, 0, 1], 9443))),
            bridge_url: self
                .bridge_url
                .unwrap_or_else(|| "http://127.0.0.1:9443".to_string()),
            handshake: HandshakeConfig {
                timeout: handshake_timeout,
                first_response_timeout,
                poll_wait,
                empty_poll_limit: self
                    .empty_poll_limit
                    .unwrap_or(DEFAULT_EMPTY_POLL_LIMIT)
                    .clamp(1, 5),
            },
            idle_timeout: secs(self.idle_timeout_secs, DEFAULT_IDLE_TIMEOUT.as_secs()),
            reaper_interval: secs(self.reaper_interval_secs, 60),
            session_idle: secs(self.session_idle_secs, 300),
            completion_grace: secs(self.completion_grace_secs, 30),
            handoff,
            static_hosts: self.static_hosts.unwrap_or_default(),
            target_port: self.target_port.unwrap_or(DEFAULT_TARGET_PORT),
            max_connections: self
                .max_connections
                .unwrap_or(crate::edge::DEFAULT_MAX_CONNECTIONS)
                .max(1),
            log_level: self.log_level.unwrap_or_else(|| "info".to_string()),
        })
    }
}

impl Config {
    /// Load configuration from environment variables and the optional
    /// config file.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`Config::from_env`] with variables read through `lookup`.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut settings = Settings::from_lookup(&lookup)?;
        if let Some(path) = lookup("VEIL_CONFIG_FILE") {
            settings = settings.overlay(Settings::from_file(Path::new(&path))?);
        }
        settings.resolve()
    }

    pub fn relay(&self) -> RelayConfig {
        RelayConfig {
            idle_timeout: self.idle_timeout,
            ..RelayConfig::default()
        }
    }

    pub fn edge(&self) -> EdgeConfig {
        EdgeConfig {
            max_connections: self.max_connections,
            handshake: self.handshake.clone(),
            relay: self.relay(),
            handoff: self.handoff.clone(),
            ..EdgeConfig::new(self.listen_addr)
        }
    }

    pub fn bridge(&self) -> BridgeConfig {
        BridgeConfig {
            completion_grace: self.completion_grace,
            relay: self.relay(),
            ..BridgeConfig::default()
        }
    }

    pub fn remote_oob(&self) -> RemoteOobConfig {
        RemoteOobConfig {
            base_url: self.bridge_url.clone(),
            ..RemoteOobConfig::default()
        }
    }

    pub fn reaper(&self) -> ReaperConfig {
        ReaperConfig {
            interval: self.reaper_interval,
            idle_threshold: self.session_idle,
        }
    }

    pub fn dialer(&self) -> TargetDialer {
        TargetDialer::new(self.target_port, DEFAULT_CONNECT_TIMEOUT)
            .with_overrides(self.static_hosts.clone())
    }
}
