//! Streaming connections to the mission backend.
//!
//! This module provides:
//! - One connection task per endpoint with keepalive and auto-reconnect
//! - Many subscribers per endpoint through [`Handlers`] and [`Subscription`]
//! - A [`Transport`] seam so tests can replace the network
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │                ConnectionRegistry                   │
//! │     (endpoint -> connection, shared by the app)     │
//! └─────────────────────────────────────────────────────┘
//!                         │
//!          ┌──────────────┼──────────────┐
//!          ▼              ▼              ▼
//!   ┌──────────────┐ ┌──────────────┐ ┌──────────────┐
//!   │ConnectionTask│ │ConnectionTask│ │ConnectionTask│
//!   │/ws/telemetry │ │/ws/trajectory│ │ /ws/commands │
//!   └──────────────┘ └──────────────┘ └──────────────┘
//!          │              │              │
//!          ▼              ▼              ▼
//!      handlers        handlers       handlers
//!   (message/status/error, per subscriber)
//! ```
//!
//! # Usage
//!
//! ```rust,ignore
//! let sub = registry.connect(
//!     "/ws/telemetry",
//!     &identity,
//!     ConnectOptions::new(Handlers::new().on_message(|msg| println!("{msg:?}"))),
//! )?;
//! // later
//! sub.cancel();
//! ```

mod connection;
mod handlers;
mod manager;

pub use connection::{
    ConnectionState, ConnectionStatus, Frame, ReconnectConfig, Socket, Transport,
    TungsteniteTransport,
};
pub use handlers::{
    default_parser, passthrough_parser, ErrorHandler, FrameParser, Handlers, MessageHandler,
    StatusHandler, Subscription,
};
pub use manager::{normalize_endpoint, ConnectOptions, ConnectionRegistry};
