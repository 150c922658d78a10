//! Data shared between the network layer and its collaborators.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

// --- Identity ---

/// What the identity/session provider hands the network layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_token: Option<String>,
    pub user_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enterprise_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expiry: Option<DateTime<Utc>>,
}

impl Session {
    pub fn identity(&self) -> StreamIdentity {
        StreamIdentity {
            user_id: self.user_id.clone(),
            enterprise_id: self.enterprise_id.clone(),
        }
    }
}

/// Identity embedded in every stream URL.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamIdentity {
    pub user_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enterprise_id: Option<String>,
}

impl StreamIdentity {
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            enterprise_id: None,
        }
    }

    pub fn with_enterprise(mut self, enterprise_id: impl Into<String>) -> Self {
        self.enterprise_id = Some(enterprise_id.into());
        self
    }

    /// Tenant used for the `enterpriseId` query parameter. Users without an
    /// enterprise are their own tenant.
    pub fn tenant(&self) -> &str {
        self.enterprise_id.as_deref().unwrap_or(&self.user_id)
    }
}

/// Body of a successful `POST /api/auth/refresh`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenResponse {
    pub token: String,
}

// --- Streaming payloads ---

/// A single telemetry sample pushed on a trajectory/telemetry stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TelemetryReading {
    pub spacecraft_id: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
    /// Every other field of the frame (position, velocity, ...).
    #[serde(flatten)]
    pub values: Map<String, Value>,
}

/// Status change of a command sent to a spacecraft.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandUpdate {
    pub command_id: String,
    pub spacecraft_id: i64,
    #[serde(default)]
    pub command_type: Option<String>,
    pub status: bool,
    #[serde(default)]
    pub executed_at: Option<DateTime<Utc>>,
}

/// Periodic multi-satellite snapshot from `/ws/telemetry`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TelemetrySnapshot {
    pub telemetry: BTreeMap<String, SatelliteData>,
    #[serde(default)]
    pub operator_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SatelliteData {
    pub telemetry: CurrentTelemetry,
    #[serde(default)]
    pub full_orbit_predictions: Vec<PredictedPosition>,
    #[serde(default)]
    pub short_predictions: Vec<PredictedPosition>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CurrentTelemetry {
    pub geo: GeoPosition,
    pub position: Vector3,
    pub velocity: Velocity,
    pub acceleration: f64,
    pub orbit_radius: f64,
    pub timestamp: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPosition {
    pub latitude: f64,
    pub longitude: f64,
    pub altitude: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Vector3 {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Velocity {
    pub x: f64,
    pub y: f64,
    pub z: f64,
    pub magnitude: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PredictedPosition {
    pub latitude: f64,
    pub longitude: f64,
    pub altitude: f64,
    pub timestamp: i64,
    #[serde(default)]
    pub is_full_orbit: Option<bool>,
}
