//! Error taxonomy for the network layer, including RFC7807 Problem Details.
//!
//! Every error here is `Clone` so a single coalesced request or refresh can
//! hand the same failure to all of its waiters.

use serde::{Deserialize, Serialize};

/// RFC7807 Problem Details (application/problem+json)
///
/// The mission backend answers failed `/api/*` calls with this envelope. The
/// client only reads it to build user-facing messages.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProblemDetails {
    /// A URI reference that identifies the problem type.
    #[serde(rename = "type", default)]
    pub type_url: String,
    /// A short, human-readable summary of the problem type.
    #[serde(default)]
    pub title: String,
    /// HTTP status code.
    #[serde(default)]
    pub status: u16,
    /// Human-readable explanation specific to this occurrence.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    /// A URI reference that identifies the specific occurrence.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instance: Option<String>,
}

/// Attempt to parse an RFC7807 (or RFC7807-ish) JSON body into a user-facing message.
/// Prefers `detail`, falls back to `title`.
pub fn try_problem_detail(body: &str) -> Option<String> {
    let parsed = serde_json::from_str::<ProblemDetails>(body).ok()?;
    if let Some(detail) = parsed.detail {
        if !detail.trim().is_empty() {
            return Some(detail);
        }
    }
    if !parsed.title.trim().is_empty() {
        return Some(parsed.title);
    }
    None
}

/// Failures of a streaming link. Always retried with backoff by the
/// connection task; callers only see them through error handlers.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConnectionError {
    #[error("handshake failed: {0}")]
    Handshake(String),

    #[error("connect timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("connection closed abnormally (code {code}): {reason}")]
    Closed { code: u16, reason: String },

    #[error("no traffic for {idle_ms}ms")]
    Inactive { idle_ms: u64 },

    #[error("send failed: {0}")]
    Send(String),

    #[error("endpoint {0} is not connected")]
    NotConnected(String),

    #[error("no connection registered for endpoint {0}")]
    UnknownEndpoint(String),

    #[error("invalid stream URL: {0}")]
    InvalidUrl(String),
}

/// An inbound frame that could not be turned into a message.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error("malformed frame: {0}")]
    Malformed(String),

    #[error("frame is not a JSON object")]
    NotAnObject,

    #[error("invalid control frame: {0}")]
    InvalidControl(String),

    #[error("unknown message type: {0}")]
    UnknownType(String),

    #[error("invalid {kind} payload: {message}")]
    InvalidPayload { kind: String, message: String },
}

/// What error handlers on a stream receive.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StreamError {
    #[error(transparent)]
    Connection(#[from] ConnectionError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// The server pushed an `{"error": ...}` frame.
    #[error("server reported: {0}")]
    Server(String),
}

/// Authentication could not be recovered; the UI should send the user back
/// to the login surface.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AuthError {
    #[error("token refresh failed ({status}): {message}")]
    RefreshFailed { status: u16, message: String },

    #[error("token refresh request failed: {0}")]
    RefreshUnavailable(String),

    #[error("request rejected after token refresh")]
    Rejected,
}

/// A one-shot request failed. Never retried automatically.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RequestError {
    #[error("network error: {0}")]
    Network(String),

    #[error("request timed out")]
    Timeout,

    #[error("HTTP {status}: {body}")]
    Http { status: u16, body: String },

    #[error("invalid response body: {0}")]
    Deserialize(String),

    #[error("invalid request body: {0}")]
    Serialize(String),

    #[error("invalid request URL: {0}")]
    InvalidUrl(String),
}

impl RequestError {
    /// Message suitable for a retryable error banner.
    pub fn user_message(&self) -> String {
        match self {
            RequestError::Http { status, body } => {
                try_problem_detail(body).unwrap_or_else(|| format!("Request failed ({status})"))
            }
            RequestError::Timeout => "The server took too long to respond".to_string(),
            RequestError::Network(_) => "Unable to reach the server".to_string(),
            other => other.to_string(),
        }
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            RequestError::Http { status, .. } => Some(*status),
            _ => None,
        }
    }
}

/// Error returned by every request client call.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ClientError {
    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error(transparent)]
    Request(#[from] RequestError),
}

impl ClientError {
    /// True when the caller should force re-authentication.
    pub fn requires_login(&self) -> bool {
        matches!(self, ClientError::Auth(_))
    }
}
