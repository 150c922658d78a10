//! Mission Control client - command line entry point
//!
//! Streams `/ws/telemetry` for the configured operator and logs what
//! arrives. An optional argument names one REST path to fetch at startup.
//!
//! ```text
//! MISSION_CONTROL_TOKEN=... MISSION_CONTROL_USER_ID=op-1 \
//!     mission-control-client /api/spacecraft
//! ```

use std::sync::Arc;

use anyhow::Context;
use mission_control_client::logging::{init_tracing, DEFAULT_FILTER};
use mission_control_client::{
    ClientConfig, ConnectOptions, Handlers, NetworkContext, StaticSession,
};
use mission_control_shared::{Session, StreamMessage};

const TELEMETRY_ENDPOINT: &str = "/ws/telemetry";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing(DEFAULT_FILTER);

    let config = ClientConfig::from_env();
    let session = StaticSession::new(session_from_env());
    let context = NetworkContext::new(config, Arc::new(session.clone()))
        .context("failed to build HTTP client")?;

    let identity = session
        .identity()
        .context("MISSION_CONTROL_USER_ID is not set")?;

    let handlers = Handlers::new()
        .on_message(|message| match message {
            StreamMessage::Snapshot(snapshot) => tracing::info!(
                satellites = snapshot.telemetry.len(),
                operator = ?snapshot.operator_id,
                "telemetry snapshot"
            ),
            StreamMessage::Telemetry(reading) => {
                tracing::info!(spacecraft = reading.spacecraft_id, "telemetry reading")
            }
            StreamMessage::CommandStatus(update) => tracing::info!(
                command = %update.command_id,
                executed = update.status,
                "command status"
            ),
            StreamMessage::Raw(value) => tracing::info!(%value, "message"),
        })
        .on_status(|state| tracing::info!(?state, "stream state"))
        .on_error(|error| tracing::warn!(%error, "stream error"));

    let _subscription = context
        .streams
        .connect(TELEMETRY_ENDPOINT, &identity, ConnectOptions::new(handlers))
        .context("failed to open telemetry stream")?;

    if let Some(path) = std::env::args().nth(1) {
        match context.requests.get(&path, &[]).await {
            Ok(body) => println!("{}", serde_json::to_string_pretty(&body)?),
            Err(err) if err.requires_login() => {
                tracing::error!(%err, "not authorized; sign in again");
            }
            Err(err) => tracing::error!(%err, "GET {} failed", path),
        }
    }

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for Ctrl-C")?;
    tracing::info!("shutting down");
    context.shutdown().await;
    Ok(())
}

fn session_from_env() -> Option<Session> {
    let user_id = std::env::var("MISSION_CONTROL_USER_ID").ok()?;
    Some(Session {
        access_token: std::env::var("MISSION_CONTROL_TOKEN").ok(),
        user_id,
        enterprise_id: std::env::var("MISSION_CONTROL_ENTERPRISE_ID").ok(),
        expiry: None,
    })
}
