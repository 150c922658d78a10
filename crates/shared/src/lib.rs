//! Shared types for the mission control network layer: the streaming wire
//! protocol, session/telemetry models and the error taxonomy.

pub mod error;
pub mod models;
pub mod protocol;

pub use error::*;
pub use models::*;
pub use protocol::*;
