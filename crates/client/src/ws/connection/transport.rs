//! Socket abstraction the connection task drives.

use async_trait::async_trait;
use mission_control_shared::ConnectionError;
use url::Url;

/// One WebSocket frame, independent of the library that carried it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Binary(Vec<u8>),
    /// Protocol-level ping; answered by the socket implementation.
    Ping(Vec<u8>),
    Pong(Vec<u8>),
    Close { code: u16, reason: String },
}

/// An open WebSocket. Owned by exactly one connection task.
#[async_trait]
pub trait Socket: Send {
    async fn send(&mut self, frame: Frame) -> Result<(), ConnectionError>;

    /// Next inbound frame; `None` once the peer is gone. Must be cancel-safe.
    async fn recv(&mut self) -> Option<Result<Frame, ConnectionError>>;

    async fn close(&mut self, code: u16, reason: &str) -> Result<(), ConnectionError>;

    /// Subprotocol the server accepted, if any.
    fn protocol(&self) -> Option<&str> {
        None
    }
}

/// Opens sockets. Swapped for an in-memory transport in tests.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn connect(
        &self,
        url: &Url,
        protocol: Option<&str>,
    ) -> Result<Box<dyn Socket>, ConnectionError>;
}
