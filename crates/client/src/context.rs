//! Wiring for the whole network layer.
//!
//! The application builds one [`NetworkContext`] at startup and hands clones
//! of its parts to whatever needs them.

use std::sync::Arc;

use mission_control_shared::{RequestError, StreamIdentity};

use crate::api_client::RequestClient;
use crate::auth_session::SessionProvider;
use crate::clock::{Clock, TokioClock};
use crate::config::ClientConfig;
use crate::token_cache::{HttpTokenRefresher, TokenManager, TokenRefresher};
use crate::ws::{ConnectionRegistry, Transport, TungsteniteTransport};

pub struct NetworkContext {
    pub config: ClientConfig,
    pub session: Arc<dyn SessionProvider>,
    pub tokens: Arc<TokenManager>,
    pub requests: RequestClient,
    pub streams: Arc<ConnectionRegistry>,
}

impl NetworkContext {
    /// Production wiring: tokio clock, tungstenite sockets, HTTP refresh.
    pub fn new(
        config: ClientConfig,
        session: Arc<dyn SessionProvider>,
    ) -> Result<Self, RequestError> {
        NetworkContextBuilder::new(config, session).build()
    }

    pub fn builder(
        config: ClientConfig,
        session: Arc<dyn SessionProvider>,
    ) -> NetworkContextBuilder {
        NetworkContextBuilder::new(config, session)
    }

    /// Identity streams should be opened with, if someone is signed in.
    pub async fn stream_identity(&self) -> Option<StreamIdentity> {
        self.session.session().await.map(|s| s.identity())
    }

    /// Close every stream and forget cached state.
    pub async fn shutdown(&self) {
        self.streams.disconnect_all().await;
        self.requests.clear_cache(None);
        self.tokens.invalidate();
        crate::log_info!("Network layer shut down");
    }
}

/// Overrides for the collaborators [`NetworkContext::new`] would pick.
pub struct NetworkContextBuilder {
    config: ClientConfig,
    session: Arc<dyn SessionProvider>,
    clock: Option<Arc<dyn Clock>>,
    transport: Option<Arc<dyn Transport>>,
    refresher: Option<Arc<dyn TokenRefresher>>,
}

impl NetworkContextBuilder {
    fn new(config: ClientConfig, session: Arc<dyn SessionProvider>) -> Self {
        Self {
            config,
            session,
            clock: None,
            transport: None,
            refresher: None,
        }
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn refresher(mut self, refresher: Arc<dyn TokenRefresher>) -> Self {
        self.refresher = Some(refresher);
        self
    }

    pub fn build(self) -> Result<NetworkContext, RequestError> {
        let config = self.config;
        let http = RequestClient::http_client(&config)?;
        let clock = self.clock.unwrap_or_else(|| Arc::new(TokioClock));
        let transport = self
            .transport
            .unwrap_or_else(|| Arc::new(TungsteniteTransport));
        let refresher = self.refresher.unwrap_or_else(|| {
            Arc::new(HttpTokenRefresher::new(
                http.clone(),
                &config.api_base_url,
                &config.refresh_path,
            ))
        });

        let tokens = Arc::new(TokenManager::new(
            self.session.clone(),
            refresher,
            clock.clone(),
            config.token_lifetime,
        ));
        let requests = RequestClient::new(
            http,
            config.api_base_url.clone(),
            tokens.clone(),
            clock.clone(),
            config.cache_ttl,
        );
        let streams = Arc::new(ConnectionRegistry::new(
            config.stream.clone(),
            transport,
            clock,
        ));

        crate::log_debug!(
            "Network layer ready (api {}, streams {})",
            config.api_base_url,
            config.stream.ws_base_url
        );
        Ok(NetworkContext {
            config,
            session: self.session,
            tokens,
            requests,
            streams,
        })
    }
}
