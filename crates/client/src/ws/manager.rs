//! Registry of streaming connections, one per endpoint.

use std::collections::HashMap;
use std::sync::Arc;

use futures_channel::mpsc::{unbounded, UnboundedSender};
use futures_channel::oneshot;
use mission_control_shared::{
    ConnectionError, StreamIdentity, CLIENT_CLOSE_REASON, NORMAL_CLOSE_CODE,
};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::task::JoinHandle;
use url::Url;

use super::connection::{
    Command, ConnectionShared, ConnectionState, ConnectionStatus, ConnectionTask, Transport,
};
use super::handlers::{default_parser, invoke, FrameParser, Handlers, SharedHandlers, Subscription};
use crate::clock::Clock;
use crate::config::StreamConfig;

/// Normalize an endpoint for use as a key: always one leading `/`.
pub fn normalize_endpoint(endpoint: &str) -> String {
    format!("/{}", endpoint.trim().trim_start_matches('/'))
}

/// What a subscriber brings to `connect()`.
#[derive(Clone, Default)]
pub struct ConnectOptions {
    /// Extra query pairs appended after the identity parameters.
    pub extra_params: Vec<(String, String)>,
    pub handlers: Handlers,
    /// Replaces the default decoder when a new connection is created.
    pub parser: Option<FrameParser>,
}

impl ConnectOptions {
    pub fn new(handlers: Handlers) -> Self {
        Self {
            handlers,
            ..Self::default()
        }
    }

    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.extra_params.push((key.into(), value.into()));
        self
    }

    pub fn with_parser(mut self, parser: FrameParser) -> Self {
        self.parser = Some(parser);
        self
    }
}

struct ConnectionEntry {
    shared: Arc<ConnectionShared>,
    commands: UnboundedSender<Command>,
    task: JoinHandle<()>,
}

impl ConnectionEntry {
    /// Open or opening, with its task still running.
    fn is_healthy(&self) -> bool {
        !self.task.is_finished()
            && matches!(
                self.shared.state(),
                ConnectionState::Connecting | ConnectionState::Connected
            )
    }
}

/// Owns every streaming connection of the application.
pub struct ConnectionRegistry {
    config: Arc<StreamConfig>,
    transport: Arc<dyn Transport>,
    clock: Arc<dyn Clock>,
    connections: Mutex<HashMap<String, ConnectionEntry>>,
}

impl ConnectionRegistry {
    pub fn new(config: StreamConfig, transport: Arc<dyn Transport>, clock: Arc<dyn Clock>) -> Self {
        Self {
            config: Arc::new(config),
            transport,
            clock,
            connections: Mutex::new(HashMap::new()),
        }
    }

    /// Subscribe to `endpoint`, opening a connection if none is healthy.
    ///
    /// Must be called inside a tokio runtime.
    pub fn connect(
        &self,
        endpoint: &str,
        identity: &StreamIdentity,
        options: ConnectOptions,
    ) -> Result<Subscription, ConnectionError> {
        let endpoint = normalize_endpoint(endpoint);
        let mut connections = self.connections.lock();

        if let Some(entry) = connections.get(&endpoint).filter(|e| e.is_healthy()) {
            crate::log_debug!("Reusing connection for {}", endpoint);
            let already_connected = entry.shared.state().is_connected();
            let status = options.handlers.status.clone();
            let subscription = entry.shared.handlers.attach(&endpoint, options.handlers);
            drop(connections);

            if already_connected {
                if let Some(status) = status {
                    invoke(&endpoint, "status", &[status], &ConnectionState::Connected);
                }
            }
            return Ok(subscription);
        }

        let url = self.stream_url(&endpoint, identity, &options.extra_params)?;
        let (handlers, parser, predecessor) = match connections.remove(&endpoint) {
            Some(stale) => {
                crate::log_info!("Replacing stale connection for {}", endpoint);
                let _ = stale.commands.unbounded_send(Command::Retire);
                let parser = options.parser.unwrap_or_else(|| stale.shared.parser.clone());
                (stale.shared.handlers.clone(), parser, Some(stale.task))
            }
            None => (
                SharedHandlers::default(),
                options.parser.unwrap_or_else(default_parser),
                None,
            ),
        };

        let subscription = handlers.attach(&endpoint, options.handlers);
        let entry = self.spawn(endpoint.clone(), url, handlers, parser, predecessor);
        connections.insert(endpoint, entry);
        Ok(subscription)
    }

    /// Close `endpoint` for good. Returns false when it was not registered.
    pub async fn disconnect(&self, endpoint: &str) -> bool {
        let endpoint = normalize_endpoint(endpoint);
        let Some(entry) = self.connections.lock().remove(&endpoint) else {
            return false;
        };
        crate::log_info!("Disconnecting {}", endpoint);
        let _ = entry.commands.unbounded_send(Command::Disconnect);
        let _ = entry.task.await;
        true
    }

    pub async fn disconnect_all(&self) {
        let entries: Vec<ConnectionEntry> = self
            .connections
            .lock()
            .drain()
            .map(|(_, entry)| entry)
            .collect();
        if !entries.is_empty() {
            crate::log_info!("Disconnecting {} streams", entries.len());
        }
        for entry in &entries {
            let _ = entry.commands.unbounded_send(Command::Disconnect);
        }
        futures_util::future::join_all(entries.into_iter().map(|entry| entry.task)).await;
    }

    /// Drop the current socket and connect again without waiting out backoff.
    pub fn reconnect(&self, endpoint: &str) -> Result<(), ConnectionError> {
        let endpoint = normalize_endpoint(endpoint);
        let mut connections = self.connections.lock();
        let entry = connections
            .get_mut(&endpoint)
            .ok_or_else(|| ConnectionError::UnknownEndpoint(endpoint.clone()))?;

        if entry.task.is_finished() {
            crate::log_info!("Restarting stopped connection for {}", endpoint);
            let shared = entry.shared.clone();
            *entry = self.spawn(
                endpoint,
                shared.url.clone(),
                shared.handlers.clone(),
                shared.parser.clone(),
                None,
            );
            return Ok(());
        }

        entry
            .commands
            .unbounded_send(Command::Reconnect)
            .map_err(|e| ConnectionError::Send(e.to_string()))
    }

    /// Serialize `message` as JSON and send it.
    pub async fn send<T: Serialize + ?Sized>(
        &self,
        endpoint: &str,
        message: &T,
    ) -> Result<(), ConnectionError> {
        let text =
            serde_json::to_string(message).map_err(|e| ConnectionError::Send(e.to_string()))?;
        self.send_text(endpoint, text).await
    }

    /// Send a text frame. Fails instead of queueing when not connected.
    pub async fn send_text(
        &self,
        endpoint: &str,
        text: impl Into<String>,
    ) -> Result<(), ConnectionError> {
        let endpoint = normalize_endpoint(endpoint);
        let (reply, response) = oneshot::channel();
        {
            let connections = self.connections.lock();
            let entry = connections
                .get(&endpoint)
                .ok_or_else(|| ConnectionError::UnknownEndpoint(endpoint.clone()))?;
            if !entry.shared.state().is_connected() {
                return Err(ConnectionError::NotConnected(endpoint));
            }
            entry
                .commands
                .unbounded_send(Command::Send {
                    text: text.into(),
                    reply,
                })
                .map_err(|_| ConnectionError::NotConnected(endpoint.clone()))?;
        }
        response
            .await
            .unwrap_or_else(|_| Err(ConnectionError::NotConnected(endpoint)))
    }

    pub fn is_connected(&self, endpoint: &str) -> bool {
        self.connections
            .lock()
            .get(&normalize_endpoint(endpoint))
            .is_some_and(|entry| entry.shared.state().is_connected())
    }

    pub fn status(&self, endpoint: &str) -> Option<ConnectionStatus> {
        self.connections
            .lock()
            .get(&normalize_endpoint(endpoint))
            .map(|entry| entry.shared.status())
    }

    pub fn endpoints(&self) -> Vec<String> {
        let mut endpoints: Vec<String> = self.connections.lock().keys().cloned().collect();
        endpoints.sort();
        endpoints
    }

    /// Number of live subscriptions on `endpoint`.
    pub fn subscriber_count(&self, endpoint: &str) -> usize {
        self.connections
            .lock()
            .get(&normalize_endpoint(endpoint))
            .map_or(0, |entry| entry.shared.handlers.subscriber_count())
    }

    /// Try a handshake with every configured subprotocol at once and report
    /// whether any of them succeeded. Probe sockets are closed right away.
    pub async fn probe(
        &self,
        endpoint: &str,
        identity: &StreamIdentity,
    ) -> Result<bool, ConnectionError> {
        let endpoint = normalize_endpoint(endpoint);
        let url = self.stream_url(&endpoint, identity, &[])?;
        let mut protocols: Vec<Option<String>> = self
            .config
            .protocols
            .iter()
            .map(|p| (!p.is_empty()).then(|| p.clone()))
            .collect();
        if protocols.is_empty() {
            protocols.push(None);
        }

        let attempts = protocols.into_iter().map(|protocol| {
            let url = &url;
            async move {
                tokio::select! {
                    result = self.transport.connect(url, protocol.as_deref()) => match result {
                        Ok(mut socket) => {
                            let _ = socket.close(NORMAL_CLOSE_CODE, CLIENT_CLOSE_REASON).await;
                            true
                        }
                        Err(error) => {
                            crate::log_debug!("Probe of {} with {:?} failed: {}", url, protocol, error);
                            false
                        }
                    },
                    _ = self.clock.sleep(self.config.probe_timeout) => {
                        crate::log_debug!("Probe of {} with {:?} timed out", url, protocol);
                        false
                    }
                }
            }
        });
        let results = futures_util::future::join_all(attempts).await;
        let reachable = results.into_iter().any(|ok| ok);
        crate::log_info!("Probe of {}: {}", endpoint, if reachable { "reachable" } else { "unreachable" });
        Ok(reachable)
    }

    fn spawn(
        &self,
        endpoint: String,
        url: Url,
        handlers: SharedHandlers,
        parser: FrameParser,
        predecessor: Option<JoinHandle<()>>,
    ) -> ConnectionEntry {
        let shared = Arc::new(ConnectionShared::new(endpoint, url, handlers, parser));
        let (commands, receiver) = unbounded();
        let task = ConnectionTask::new(
            shared.clone(),
            self.config.clone(),
            self.transport.clone(),
            self.clock.clone(),
            receiver,
            predecessor,
        );
        ConnectionEntry {
            shared,
            commands,
            task: tokio::spawn(task.run()),
        }
    }

    fn stream_url(
        &self,
        endpoint: &str,
        identity: &StreamIdentity,
        extra: &[(String, String)],
    ) -> Result<Url, ConnectionError> {
        let base = self.config.ws_base_url.trim_end_matches('/');
        let raw = format!("{base}{endpoint}");
        let mut url =
            Url::parse(&raw).map_err(|e| ConnectionError::InvalidUrl(format!("{raw}: {e}")))?;
        if !matches!(url.scheme(), "ws" | "wss") {
            return Err(ConnectionError::InvalidUrl(format!(
                "{raw}: expected a ws:// or wss:// URL"
            )));
        }
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("userId", &identity.user_id);
            query.append_pair("enterpriseId", identity.tenant());
            for (key, value) in extra {
                query.append_pair(key, value);
            }
        }
        Ok(url)
    }
}
