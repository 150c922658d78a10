//! Bearer token caching and refresh coordination.
//!
//! [`TokenCache`] is a single slot holding one credential and its expiry.
//! [`TokenManager`] fills it from the [`SessionProvider`] and, when the API
//! answers 401, runs at most one refresh at a time through a
//! [`TokenRefresher`]; concurrent callers await that same refresh.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures_util::future::{BoxFuture, FutureExt, Shared};
use mission_control_shared::{AuthError, TokenResponse};
use parking_lot::Mutex;
use serde::Serialize;

use crate::auth_session::SessionProvider;
use crate::clock::Clock;

/// A bearer token and the identity it belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credential {
    pub token: String,
    /// User id of the session the token was issued for. Used to scope caches.
    pub subject: Option<String>,
}

/// Single-slot token store.
#[derive(Debug, Default)]
pub struct TokenCache {
    slot: Option<(Credential, Instant)>,
}

impl TokenCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// The cached credential if it has not expired at `now`.
    pub fn get(&self, now: Instant) -> Option<&Credential> {
        match &self.slot {
            Some((credential, expiry)) if now < *expiry => Some(credential),
            _ => None,
        }
    }

    pub fn set(&mut self, credential: Credential, ttl: Duration, now: Instant) {
        self.slot = Some((credential, now + ttl));
    }

    pub fn clear(&mut self) {
        self.slot = None;
    }

    /// Remaining lifetime at `now`, `None` when empty or expired.
    pub fn remaining(&self, now: Instant) -> Option<Duration> {
        let (_, expiry) = self.slot.as_ref()?;
        expiry.checked_duration_since(now).filter(|d| !d.is_zero())
    }
}

/// Obtains a fresh token after the API rejected the current one.
#[async_trait]
pub trait TokenRefresher: Send + Sync {
    async fn refresh(&self) -> Result<String, AuthError>;
}

/// `POST <api>/<refresh path>` returning `{"token": "..."}`.
#[derive(Debug, Clone)]
pub struct HttpTokenRefresher {
    client: reqwest::Client,
    url: String,
}

impl HttpTokenRefresher {
    pub fn new(client: reqwest::Client, api_base_url: &str, refresh_path: &str) -> Self {
        let base = api_base_url.trim_end_matches('/');
        let path = refresh_path.trim_start_matches('/');
        Self {
            client,
            url: format!("{base}/{path}"),
        }
    }
}

#[async_trait]
impl TokenRefresher for HttpTokenRefresher {
    async fn refresh(&self) -> Result<String, AuthError> {
        crate::log_info!("Refreshing access token via {}", self.url);
        let resp = self
            .client
            .post(&self.url)
            .header("Content-Type", "application/json")
            .send()
            .await
            .map_err(|e| AuthError::RefreshUnavailable(e.to_string()))?;

        let status = resp.status().as_u16();
        let is_success = resp.status().is_success();
        let text = resp
            .text()
            .await
            .map_err(|e| AuthError::RefreshUnavailable(format!("failed to read body: {e}")))?;

        if !is_success {
            crate::log_error!("Token refresh failed with status {}", status);
            return Err(AuthError::RefreshFailed {
                status,
                message: text,
            });
        }

        let body: TokenResponse =
            serde_json::from_str(&text).map_err(|e| AuthError::RefreshFailed {
                status,
                message: format!("unexpected refresh response: {e}"),
            })?;
        Ok(body.token)
    }
}

type SharedRefresh = Shared<BoxFuture<'static, Result<String, AuthError>>>;

/// Snapshot of the token cache for diagnostics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenStatus {
    pub cached: bool,
    pub subject: Option<String>,
    pub remaining_secs: Option<u64>,
    pub refresh_in_flight: bool,
}

pub struct TokenManager {
    cache: Mutex<TokenCache>,
    inflight: Mutex<Option<SharedRefresh>>,
    session: Arc<dyn SessionProvider>,
    refresher: Arc<dyn TokenRefresher>,
    clock: Arc<dyn Clock>,
    lifetime: Duration,
}

impl TokenManager {
    pub fn new(
        session: Arc<dyn SessionProvider>,
        refresher: Arc<dyn TokenRefresher>,
        clock: Arc<dyn Clock>,
        lifetime: Duration,
    ) -> Self {
        Self {
            cache: Mutex::new(TokenCache::new()),
            inflight: Mutex::new(None),
            session,
            refresher,
            clock,
            lifetime,
        }
    }

    /// Credential to attach to the next request.
    ///
    /// Served from the cache while it is valid, otherwise loaded from the
    /// session provider and cached for the configured lifetime (or until the
    /// session's own expiry, whichever comes first).
    pub async fn credential(&self) -> Option<Credential> {
        let now = self.clock.now();
        if let Some(credential) = self.cache.lock().get(now) {
            return Some(credential.clone());
        }

        crate::log_debug!("Token cache miss, asking session provider");
        let session = self.session.session().await?;
        let token = session.access_token.clone()?;
        let credential = Credential {
            token,
            subject: Some(session.user_id.clone()),
        };

        let mut ttl = self.lifetime;
        if let Some(expiry) = session.expiry {
            let left = (expiry - chrono::Utc::now()).to_std().unwrap_or(Duration::ZERO);
            ttl = ttl.min(left);
        }
        if !ttl.is_zero() {
            self.cache.lock().set(credential.clone(), ttl, self.clock.now());
        }
        Some(credential)
    }

    /// Drop the cached credential.
    pub fn invalidate(&self) {
        self.cache.lock().clear();
    }

    /// Recover from a 401 answered to a request made with `rejected`.
    ///
    /// If another caller already replaced the rejected token, that newer
    /// credential is returned without refreshing. Otherwise the cache is
    /// cleared and a single refresh runs; concurrent callers share it.
    pub async fn recover(&self, rejected: Option<&Credential>) -> Result<Credential, AuthError> {
        let subject = rejected.and_then(|c| c.subject.clone());
        {
            let mut cache = self.cache.lock();
            if let Some(current) = cache.get(self.clock.now()) {
                if Some(&current.token) != rejected.map(|c| &c.token) {
                    return Ok(current.clone());
                }
            }
            cache.clear();
        }

        let refresh = self.join_refresh();
        let result = refresh.clone().await;

        let mut inflight = self.inflight.lock();
        let first_to_finish = inflight
            .as_ref()
            .is_some_and(|running| running.ptr_eq(&refresh));
        if first_to_finish {
            // Publish the token before the slot frees up so a new 401 sees it.
            if let Ok(token) = &result {
                crate::log_info!("Access token refreshed");
                let credential = Credential {
                    token: token.clone(),
                    subject: subject.clone(),
                };
                self.cache
                    .lock()
                    .set(credential, self.lifetime, self.clock.now());
            }
            *inflight = None;
        }
        drop(inflight);

        Ok(Credential {
            token: result?,
            subject,
        })
    }

    fn join_refresh(&self) -> SharedRefresh {
        let mut inflight = self.inflight.lock();
        if let Some(running) = inflight.as_ref() {
            // A finished refresh left behind by callers that gave up is stale.
            if running.peek().is_none() {
                return running.clone();
            }
        }
        let refresher = self.refresher.clone();
        let refresh = async move { refresher.refresh().await }.boxed().shared();
        *inflight = Some(refresh.clone());
        refresh
    }

    pub fn status(&self) -> TokenStatus {
        let now = self.clock.now();
        let cache = self.cache.lock();
        let current = cache.get(now);
        TokenStatus {
            cached: current.is_some(),
            subject: current.and_then(|c| c.subject.clone()),
            remaining_secs: cache.remaining(now).map(|d| d.as_secs()),
            refresh_in_flight: self.inflight.lock().is_some(),
        }
    }
}
