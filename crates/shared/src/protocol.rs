//! Streaming wire protocol: control frames, inbound frame decoding and the
//! typed messages dashboard streams carry.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::ProtocolError;
use crate::models::{CommandUpdate, TelemetryReading, TelemetrySnapshot};

/// Close code for an intentional, client-initiated shutdown.
pub const NORMAL_CLOSE_CODE: u16 = 1000;
/// Close reason paired with [`NORMAL_CLOSE_CODE`]; together they suppress reconnection.
pub const CLIENT_CLOSE_REASON: &str = "Closed by client";
/// Close reason sent when the client drops a link it is about to replace.
pub const RECONNECT_CLOSE_REASON: &str = "Reconnecting";
/// Close code reported when the peer vanished without a close frame.
pub const ABNORMAL_CLOSE_CODE: u16 = 1006;

/// True when a close frame means "do not reconnect".
pub fn is_intentional_close(code: u16, reason: &str) -> bool {
    code == NORMAL_CLOSE_CODE && reason == CLIENT_CLOSE_REASON
}

/// Keepalive frames exchanged on every stream. Never forwarded to handlers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ControlFrame {
    Ping {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timestamp: Option<i64>,
    },
    Pong {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timestamp: Option<i64>,
    },
}

impl ControlFrame {
    pub fn ping(timestamp: i64) -> Self {
        ControlFrame::Ping {
            timestamp: Some(timestamp),
        }
    }

    pub fn pong(timestamp: i64) -> Self {
        ControlFrame::Pong {
            timestamp: Some(timestamp),
        }
    }

    pub fn to_text(&self) -> String {
        // Serialising a two-variant enum of integers cannot fail.
        serde_json::to_string(self).unwrap_or_else(|_| String::from("{\"type\":\"ping\"}"))
    }
}

/// A decoded inbound text frame.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundFrame {
    Control(ControlFrame),
    /// `{"error": ...}` pushed by the server.
    ServerError(String),
    /// Application payload, with any `data`/`payload` envelope removed.
    Data(Value),
}

/// Decode one inbound text frame.
///
/// Frames must be JSON objects. Objects whose `type` is `ping` or `pong` must
/// be well-formed control frames. Objects with an `error` member are server
/// errors. Objects with a `data` or `payload` member are unwrapped.
pub fn decode_frame(text: &str) -> Result<InboundFrame, ProtocolError> {
    let value: Value =
        serde_json::from_str(text).map_err(|e| ProtocolError::Malformed(e.to_string()))?;
    let Value::Object(mut object) = value else {
        return Err(ProtocolError::NotAnObject);
    };

    match object.get("type").and_then(Value::as_str) {
        Some("ping") | Some("pong") => {
            return serde_json::from_value(Value::Object(object))
                .map(InboundFrame::Control)
                .map_err(|e| ProtocolError::InvalidControl(e.to_string()));
        }
        _ => {}
    }

    if let Some(error) = object.get("error") {
        let message = match error {
            Value::String(s) => s.clone(),
            Value::Object(o) => o
                .get("message")
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(|| error.to_string()),
            other => other.to_string(),
        };
        return Ok(InboundFrame::ServerError(message));
    }

    for envelope in ["data", "payload"] {
        if let Some(inner) = object.remove(envelope) {
            return Ok(InboundFrame::Data(inner));
        }
    }

    Ok(InboundFrame::Data(Value::Object(object)))
}

/// Typed messages carried by dashboard streams.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamMessage {
    /// `{"type":"telemetry","spacecraftId":7,...}`
    Telemetry(TelemetryReading),
    /// `{"type":"command_status","commandId":...}`
    CommandStatus(CommandUpdate),
    /// Untyped `{"telemetry":{...},"operatorId":...}` snapshot from `/ws/telemetry`.
    Snapshot(TelemetrySnapshot),
    /// Anything, forwarded as-is by a passthrough parser.
    Raw(Value),
}

impl StreamMessage {
    /// Strict decoder used when an endpoint does not supply its own parser.
    pub fn decode(value: Value) -> Result<Self, ProtocolError> {
        let Value::Object(object) = value else {
            return Err(ProtocolError::NotAnObject);
        };

        let kind = object.get("type").and_then(Value::as_str).map(str::to_string);
        match kind.as_deref() {
            Some("telemetry") => typed(object, "telemetry").map(StreamMessage::Telemetry),
            Some("command_status") => {
                typed(object, "command_status").map(StreamMessage::CommandStatus)
            }
            Some(other) => Err(ProtocolError::UnknownType(other.to_string())),
            None if object.contains_key("telemetry") => {
                typed(object, "snapshot").map(StreamMessage::Snapshot)
            }
            None => Err(ProtocolError::UnknownType("<missing>".to_string())),
        }
    }

    pub fn spacecraft_id(&self) -> Option<i64> {
        match self {
            StreamMessage::Telemetry(reading) => Some(reading.spacecraft_id),
            StreamMessage::CommandStatus(update) => Some(update.spacecraft_id),
            _ => None,
        }
    }
}

fn typed<T: serde::de::DeserializeOwned>(
    object: Map<String, Value>,
    kind: &str,
) -> Result<T, ProtocolError> {
    serde_json::from_value(Value::Object(object)).map_err(|e| ProtocolError::InvalidPayload {
        kind: kind.to_string(),
        message: e.to_string(),
    })
}
