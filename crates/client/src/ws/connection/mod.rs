//! Streaming connection state, backoff policy and the per-endpoint shared
//! record the registry and the connection task both look at.

use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use url::Url;

use super::handlers::{FrameParser, SharedHandlers};

mod connection_native;
mod task;
mod transport;

pub use connection_native::TungsteniteTransport;
pub(crate) use task::{Command, ConnectionTask};
pub use transport::{Frame, Socket, Transport};

/// Connection state for a stream endpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting { attempt: u32 },
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }

    pub fn is_connecting(&self) -> bool {
        matches!(
            self,
            ConnectionState::Connecting | ConnectionState::Reconnecting { .. }
        )
    }
}

/// Configuration for auto-reconnect behavior
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectConfig {
    /// Delay before the first retry, in milliseconds
    pub initial_delay_ms: u64,
    /// Maximum delay in milliseconds
    pub max_delay_ms: u64,
    /// Multiplier for exponential backoff
    pub backoff_multiplier: f64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: 2000,
            max_delay_ms: 30000,
            backoff_multiplier: 1.5,
        }
    }
}

impl ReconnectConfig {
    /// Delay before retry number `attempt` (1-based).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(64) as i32;
        let delay = self.initial_delay_ms as f64 * self.backoff_multiplier.powi(exponent);
        Duration::from_millis(delay.min(self.max_delay_ms as f64) as u64)
    }
}

/// Point-in-time view of one endpoint's connection.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionStatus {
    pub endpoint: String,
    pub state: ConnectionState,
    pub url: String,
    /// Subprotocol the server accepted on the current socket.
    pub protocol: Option<String>,
    pub message_count: u64,
    pub attempt: u32,
    pub last_activity: Option<DateTime<Utc>>,
    pub connected: bool,
}

#[derive(Debug)]
struct Stats {
    state: ConnectionState,
    protocol: Option<String>,
    message_count: u64,
    attempt: u32,
    last_activity: Option<DateTime<Utc>>,
}

/// State shared between a connection task and the registry.
pub(crate) struct ConnectionShared {
    pub(crate) endpoint: String,
    pub(crate) url: Url,
    pub(crate) handlers: SharedHandlers,
    pub(crate) parser: FrameParser,
    stats: Mutex<Stats>,
}

impl ConnectionShared {
    pub(crate) fn new(
        endpoint: String,
        url: Url,
        handlers: SharedHandlers,
        parser: FrameParser,
    ) -> Self {
        Self {
            endpoint,
            url,
            handlers,
            parser,
            stats: Mutex::new(Stats {
                state: ConnectionState::Connecting,
                protocol: None,
                message_count: 0,
                attempt: 0,
                last_activity: None,
            }),
        }
    }

    pub(crate) fn state(&self) -> ConnectionState {
        self.stats.lock().state.clone()
    }

    pub(crate) fn attempt(&self) -> u32 {
        self.stats.lock().attempt
    }

    /// Move to `state`, telling status handlers when it actually changed.
    pub(crate) fn transition(&self, state: ConnectionState) {
        let changed = {
            let mut stats = self.stats.lock();
            let changed = stats.state != state;
            stats.state = state.clone();
            changed
        };
        if changed {
            self.handlers.dispatch_status(&self.endpoint, &state);
        }
    }

    /// Record a successful open: attempts reset, activity starts now.
    pub(crate) fn opened(&self, protocol: Option<String>) {
        {
            let mut stats = self.stats.lock();
            stats.attempt = 0;
            stats.protocol = protocol;
            stats.last_activity = Some(Utc::now());
        }
        self.transition(ConnectionState::Connected);
    }

    /// Count a failed link and enter `Reconnecting`. Returns the new attempt.
    pub(crate) fn begin_retry(&self) -> u32 {
        let attempt = {
            let mut stats = self.stats.lock();
            stats.attempt = stats.attempt.saturating_add(1);
            stats.protocol = None;
            stats.attempt
        };
        self.transition(ConnectionState::Reconnecting { attempt });
        attempt
    }

    pub(crate) fn reset_attempts(&self) {
        self.stats.lock().attempt = 0;
    }

    pub(crate) fn touch(&self) {
        self.stats.lock().last_activity = Some(Utc::now());
    }

    /// Count one inbound message; returns the running total.
    pub(crate) fn count_message(&self) -> u64 {
        let mut stats = self.stats.lock();
        stats.message_count += 1;
        stats.message_count
    }

    pub(crate) fn status(&self) -> ConnectionStatus {
        let stats = self.stats.lock();
        ConnectionStatus {
            endpoint: self.endpoint.clone(),
            state: stats.state.clone(),
            url: self.url.to_string(),
            protocol: stats.protocol.clone(),
            message_count: stats.message_count,
            attempt: stats.attempt,
            last_activity: stats.last_activity,
            connected: stats.state.is_connected(),
        }
    }
}

impl std::fmt::Debug for ConnectionShared {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionShared")
            .field("endpoint", &self.endpoint)
            .field("url", &self.url.as_str())
            .field("stats", &*self.stats.lock())
            .finish()
    }
}
