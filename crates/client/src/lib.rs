//! Mission Control client - network access layer
//!
//! This crate holds everything the mission dashboard uses to talk to its
//! backend: resilient streaming connections with keepalive and reconnect,
//! and a REST client with caching, request coalescing and token recovery.

pub mod api_client;
pub mod auth_session;
pub mod clock;
pub mod config;
pub mod context;
pub mod logging;
pub mod response_cache;
pub mod token_cache;
pub mod ws;

pub use api_client::RequestClient;
pub use auth_session::{SessionProvider, StaticSession};
pub use clock::{Clock, ManualClock, TokioClock};
pub use config::{ClientConfig, StreamConfig};
pub use context::{NetworkContext, NetworkContextBuilder};
pub use token_cache::{Credential, TokenManager, TokenRefresher, TokenStatus};
pub use ws::{ConnectOptions, ConnectionRegistry, ConnectionState, Handlers, Subscription};
