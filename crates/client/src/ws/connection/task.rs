//! The per-endpoint connection task.
//!
//! One task owns one socket at a time and runs the whole lifecycle:
//! handshake with timeout, keepalive pings, the inactivity watchdog, inbound
//! dispatch and backoff between attempts. Every timer is a local of the
//! phase that armed it, so leaving a phase drops them all.

use std::sync::Arc;
use std::time::Duration;

use futures_channel::mpsc::UnboundedReceiver;
use futures_channel::oneshot;
use futures_util::StreamExt;
use mission_control_shared::{
    decode_frame, is_intentional_close, ConnectionError, ControlFrame, InboundFrame, StreamError,
    ABNORMAL_CLOSE_CODE, CLIENT_CLOSE_REASON, NORMAL_CLOSE_CODE, RECONNECT_CLOSE_REASON,
};
use tokio::task::JoinHandle;

use super::transport::{Frame, Socket, Transport};
use super::{ConnectionShared, ConnectionState};
use crate::clock::Clock;
use crate::config::StreamConfig;

/// How long a client-initiated close may take before the socket is dropped.
const CLOSE_GRACE: Duration = Duration::from_secs(1);
/// Log a message-count line every this many inbound frames.
const STATS_LOG_EVERY: u64 = 10;

/// Requests from the registry to a running connection.
pub(crate) enum Command {
    /// Transmit a text frame if connected.
    Send {
        text: String,
        reply: oneshot::Sender<Result<(), ConnectionError>>,
    },
    /// Drop the current socket and connect again right away.
    Reconnect,
    /// Close normally and stop for good.
    Disconnect,
    /// Close normally and stop without telling subscribers; a replacement
    /// connection already owns them.
    Retire,
}

enum Outcome {
    Lost(ConnectionError),
    Restart,
    Stop { notify: bool },
}

pub(crate) struct ConnectionTask {
    shared: Arc<ConnectionShared>,
    config: Arc<StreamConfig>,
    transport: Arc<dyn Transport>,
    clock: Arc<dyn Clock>,
    commands: UnboundedReceiver<Command>,
    predecessor: Option<JoinHandle<()>>,
}

impl ConnectionTask {
    pub(crate) fn new(
        shared: Arc<ConnectionShared>,
        config: Arc<StreamConfig>,
        transport: Arc<dyn Transport>,
        clock: Arc<dyn Clock>,
        commands: UnboundedReceiver<Command>,
        predecessor: Option<JoinHandle<()>>,
    ) -> Self {
        Self {
            shared,
            config,
            transport,
            clock,
            commands,
            predecessor,
        }
    }

    pub(crate) async fn run(mut self) {
        // The connection being replaced must have closed its socket first.
        if let Some(previous) = self.predecessor.take() {
            let _ = previous.await;
        }

        let notify = loop {
            match self.session().await {
                Outcome::Stop { notify } => break notify,
                Outcome::Restart => {
                    crate::log_info!("Reconnecting {} on request", self.shared.endpoint);
                    self.shared.reset_attempts();
                }
                Outcome::Lost(error) => {
                    crate::log_warn!("Connection to {} lost: {}", self.shared.endpoint, error);
                    self.shared
                        .handlers
                        .dispatch_error(&self.shared.endpoint, &StreamError::Connection(error));

                    let attempt = self.shared.begin_retry();
                    let delay = self.config.reconnect.delay_for_attempt(attempt);
                    crate::log_info!(
                        "Reconnecting to {} in {}ms (attempt {})",
                        self.shared.endpoint,
                        delay.as_millis(),
                        attempt
                    );
                    match self.backoff(delay).await {
                        None => {}
                        Some(Outcome::Stop { notify }) => break notify,
                        Some(_) => self.shared.reset_attempts(),
                    }
                }
            }
        };

        crate::log_info!("Connection to {} stopped", self.shared.endpoint);
        if notify {
            self.shared.transition(ConnectionState::Disconnected);
        }
    }

    /// One attempt: handshake, then serve the socket until it ends.
    async fn session(&mut self) -> Outcome {
        self.shared.transition(ConnectionState::Connecting);
        let attempt = self.shared.attempt();
        let protocol = self.config.protocol_for_attempt(attempt).map(str::to_string);
        crate::log_info!(
            "Connecting to {} (attempt {}, protocol {:?})",
            self.shared.url,
            attempt,
            protocol
        );

        let mut socket = match self.handshake(protocol.as_deref()).await {
            Ok(socket) => socket,
            Err(outcome) => return outcome,
        };

        let negotiated = socket.protocol().map(str::to_string);
        crate::log_info!(
            "Connected to {} (protocol {:?})",
            self.shared.endpoint,
            negotiated
        );
        self.shared.opened(negotiated);

        let outcome = self.serve(socket.as_mut()).await;
        self.teardown(socket, &outcome).await;
        outcome
    }

    async fn handshake(&mut self, protocol: Option<&str>) -> Result<Box<dyn Socket>, Outcome> {
        let transport = self.transport.clone();
        let url = self.shared.url.clone();
        let mut connect = transport.connect(&url, protocol);
        let mut timeout = self.clock.sleep(self.config.connect_timeout);

        loop {
            tokio::select! {
                result = &mut connect => {
                    return result.map_err(Outcome::Lost);
                }
                _ = &mut timeout => {
                    return Err(Outcome::Lost(ConnectionError::Timeout {
                        timeout_ms: self.config.connect_timeout.as_millis() as u64,
                    }));
                }
                command = self.commands.next() => {
                    if let Some(outcome) = self.idle_command(command) {
                        return Err(outcome);
                    }
                }
            }
        }
    }

    async fn serve(&mut self, socket: &mut dyn Socket) -> Outcome {
        let ping_interval = self.config.ping_interval;
        let idle_timeout = self.config.idle_timeout;
        let mut ping = self.clock.sleep(ping_interval);
        let mut last_inbound = self.clock.now();

        loop {
            let idle_for = self.clock.now().saturating_duration_since(last_inbound);
            let watchdog = self.clock.sleep(idle_timeout.saturating_sub(idle_for));

            tokio::select! {
                frame = socket.recv() => match frame {
                    Some(Ok(frame)) => {
                        last_inbound = self.clock.now();
                        self.shared.touch();
                        if let Some(outcome) = self.on_frame(socket, frame).await {
                            return outcome;
                        }
                    }
                    Some(Err(error)) => return Outcome::Lost(error),
                    None => {
                        return Outcome::Lost(ConnectionError::Closed {
                            code: ABNORMAL_CLOSE_CODE,
                            reason: "connection dropped".to_string(),
                        })
                    }
                },
                command = self.commands.next() => match command {
                    Some(Command::Send { text, reply }) => {
                        let result = socket.send(Frame::Text(text)).await;
                        let failed = result.clone().err();
                        let _ = reply.send(result);
                        if let Some(error) = failed {
                            return Outcome::Lost(error);
                        }
                    }
                    other => {
                        if let Some(outcome) = self.idle_command(other) {
                            return outcome;
                        }
                    }
                },
                _ = &mut ping => {
                    let frame = ControlFrame::ping(self.clock.epoch_millis());
                    crate::log_debug!("Ping {}", self.shared.endpoint);
                    if let Err(error) = socket.send(Frame::Text(frame.to_text())).await {
                        return Outcome::Lost(error);
                    }
                    ping = self.clock.sleep(ping_interval);
                }
                _ = watchdog => {
                    return Outcome::Lost(ConnectionError::Inactive {
                        idle_ms: idle_timeout.as_millis() as u64,
                    });
                }
            }
        }
    }

    async fn on_frame(&self, socket: &mut dyn Socket, frame: Frame) -> Option<Outcome> {
        let endpoint = self.shared.endpoint.as_str();
        let text = match frame {
            Frame::Text(text) => text,
            Frame::Close { code, reason } => {
                if is_intentional_close(code, &reason) {
                    crate::log_info!("{} closed normally by peer", endpoint);
                    return Some(Outcome::Stop { notify: true });
                }
                return Some(Outcome::Lost(ConnectionError::Closed { code, reason }));
            }
            Frame::Binary(data) => {
                crate::log_debug!("Ignoring {} byte binary frame on {}", data.len(), endpoint);
                return None;
            }
            Frame::Ping(_) | Frame::Pong(_) => return None,
        };

        let count = self.shared.count_message();
        if count % STATS_LOG_EVERY == 0 {
            crate::log_debug!("{} messages received on {}", count, endpoint);
        }

        let handlers = &self.shared.handlers;
        match decode_frame(&text) {
            Ok(InboundFrame::Control(ControlFrame::Ping { timestamp })) => {
                let pong = ControlFrame::pong(timestamp.unwrap_or_else(|| self.clock.epoch_millis()));
                if let Err(error) = socket.send(Frame::Text(pong.to_text())).await {
                    return Some(Outcome::Lost(error));
                }
            }
            Ok(InboundFrame::Control(ControlFrame::Pong { .. })) => {
                crate::log_debug!("Pong {}", endpoint);
            }
            Ok(InboundFrame::ServerError(message)) => {
                crate::log_warn!("Server error on {}: {}", endpoint, message);
                handlers.dispatch_error(endpoint, &StreamError::Server(message));
            }
            Ok(InboundFrame::Data(value)) => match (self.shared.parser)(value) {
                Ok(message) => handlers.dispatch_message(endpoint, &message),
                Err(error) => {
                    crate::log_warn!("Rejected frame on {}: {}", endpoint, error);
                    handlers.dispatch_error(endpoint, &StreamError::Protocol(error));
                }
            },
            Err(error) => {
                crate::log_warn!("Undecodable frame on {}: {}", endpoint, error);
                handlers.dispatch_error(endpoint, &StreamError::Protocol(error));
            }
        }
        None
    }

    /// Wait out a reconnect delay. `None` means the delay elapsed.
    async fn backoff(&mut self, delay: Duration) -> Option<Outcome> {
        let mut sleep = self.clock.sleep(delay);
        loop {
            tokio::select! {
                _ = &mut sleep => return None,
                command = self.commands.next() => {
                    if let Some(outcome) = self.idle_command(command) {
                        return Some(outcome);
                    }
                }
            }
        }
    }

    /// Handle a command while no socket is open.
    fn idle_command(&self, command: Option<Command>) -> Option<Outcome> {
        match command {
            Some(Command::Send { reply, .. }) => {
                let _ = reply.send(Err(ConnectionError::NotConnected(
                    self.shared.endpoint.clone(),
                )));
                None
            }
            Some(Command::Reconnect) => Some(Outcome::Restart),
            Some(Command::Disconnect) => Some(Outcome::Stop { notify: true }),
            // Registry gone or connection replaced.
            Some(Command::Retire) | None => Some(Outcome::Stop { notify: false }),
        }
    }

    /// Single exit path for an open socket.
    async fn teardown(&self, mut socket: Box<dyn Socket>, outcome: &Outcome) {
        let reason = match outcome {
            Outcome::Restart | Outcome::Stop { .. } => CLIENT_CLOSE_REASON,
            // The peer may still be there; tell it this link is being replaced.
            Outcome::Lost(ConnectionError::Inactive { .. } | ConnectionError::Send(_)) => {
                RECONNECT_CLOSE_REASON
            }
            Outcome::Lost(_) => return,
        };
        tokio::select! {
            result = socket.close(NORMAL_CLOSE_CODE, reason) => {
                if let Err(error) = result {
                    crate::log_debug!("Close of {} failed: {}", self.shared.endpoint, error);
                }
            }
            _ = self.clock.sleep(CLOSE_GRACE) => {
                crate::log_warn!(
                    "Close of {} not acknowledged after {:?}",
                    self.shared.endpoint,
                    CLOSE_GRACE
                );
            }
        }
    }
}
