//! Client configuration from environment variables.

use std::time::Duration;

use crate::ws::ReconnectConfig;

pub const DEFAULT_API_URL: &str = "http://localhost:8080";
pub const DEFAULT_WS_URL: &str = "ws://localhost:8080";
pub const DEFAULT_REFRESH_PATH: &str = "/api/auth/refresh";

/// Settings for the request client and token handling.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Base URL every relative request path is resolved against.
    pub api_base_url: String,
    /// Path of the token refresh endpoint, relative to `api_base_url`.
    pub refresh_path: String,
    /// Deadline for a single HTTP request, refresh calls included.
    pub request_timeout: Duration,
    /// How long a cached GET response counts as fresh.
    pub cache_ttl: Duration,
    /// Upper bound on how long a bearer token is reused without asking the
    /// session provider again.
    pub token_lifetime: Duration,
    pub stream: StreamConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            api_base_url: DEFAULT_API_URL.to_string(),
            refresh_path: DEFAULT_REFRESH_PATH.to_string(),
            request_timeout: Duration::from_secs(10),
            cache_ttl: Duration::from_secs(30),
            token_lifetime: Duration::from_secs(5 * 60),
            stream: StreamConfig::default(),
        }
    }
}

impl ClientConfig {
    /// Build the configuration from environment variables.
    ///
    /// Environment variables:
    /// - `MISSION_CONTROL_API_URL`: REST base URL (default: "http://localhost:8080")
    /// - `MISSION_CONTROL_WS_URL`: WebSocket base URL (default: "ws://localhost:8080")
    /// - `MISSION_CONTROL_REFRESH_PATH`: token refresh path (default: "/api/auth/refresh")
    /// - `MISSION_CONTROL_REQUEST_TIMEOUT_MS`: per-request timeout (default: 10000)
    /// - `MISSION_CONTROL_CACHE_TTL_MS`: GET cache lifetime (default: 30000)
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            api_base_url: std::env::var("MISSION_CONTROL_API_URL")
                .unwrap_or(defaults.api_base_url),
            refresh_path: std::env::var("MISSION_CONTROL_REFRESH_PATH")
                .unwrap_or(defaults.refresh_path),
            request_timeout: env_millis("MISSION_CONTROL_REQUEST_TIMEOUT_MS")
                .unwrap_or(defaults.request_timeout),
            cache_ttl: env_millis("MISSION_CONTROL_CACHE_TTL_MS").unwrap_or(defaults.cache_ttl),
            token_lifetime: defaults.token_lifetime,
            stream: StreamConfig {
                ws_base_url: std::env::var("MISSION_CONTROL_WS_URL")
                    .unwrap_or(defaults.stream.ws_base_url),
                ..defaults.stream
            },
        }
    }
}

/// Settings for streaming connections.
#[derive(Debug, Clone)]
pub struct StreamConfig {
    /// `ws://` or `wss://` base that endpoint paths are appended to.
    pub ws_base_url: String,
    /// Handshake deadline.
    pub connect_timeout: Duration,
    /// Interval between keepalive pings while connected.
    pub ping_interval: Duration,
    /// Inbound silence after which the link is considered dead.
    pub idle_timeout: Duration,
    /// Handshake deadline for each probe attempt.
    pub probe_timeout: Duration,
    pub reconnect: ReconnectConfig,
    /// Subprotocols tried in rotation; an empty string means "none".
    pub protocols: Vec<String>,
}

impl Default for StreamConfig {
    fn default() -> Self {
        let ping_interval = Duration::from_secs(20);
        Self {
            ws_base_url: DEFAULT_WS_URL.to_string(),
            connect_timeout: Duration::from_secs(10),
            ping_interval,
            idle_timeout: ping_interval * 2,
            probe_timeout: Duration::from_secs(5),
            reconnect: ReconnectConfig::default(),
            protocols: vec!["json".to_string(), String::new()],
        }
    }
}

impl StreamConfig {
    /// Subprotocol offered on the given attempt, `None` for no header.
    pub fn protocol_for_attempt(&self, attempt: u32) -> Option<&str> {
        if self.protocols.is_empty() {
            return None;
        }
        let protocol = &self.protocols[attempt as usize % self.protocols.len()];
        (!protocol.is_empty()).then_some(protocol.as_str())
    }
}

fn env_millis(name: &str) -> Option<Duration> {
    let raw = std::env::var(name).ok()?;
    match raw.trim().parse::<u64>() {
        Ok(ms) => Some(Duration::from_millis(ms)),
        Err(_) => {
            crate::log_warn!("Ignoring {}={:?}: not a number of milliseconds", name, raw);
            None
        }
    }
}
