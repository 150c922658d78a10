//! HTTP request client with response caching, request coalescing and
//! bearer-token recovery.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::{BoxFuture, FutureExt, Shared};
use mission_control_shared::{AuthError, ClientError, RequestError};
use parking_lot::Mutex;
use reqwest::{header, Client, Method};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use uuid::Uuid;

use crate::clock::Clock;
use crate::config::ClientConfig;
use crate::response_cache::{invalidation_base, is_under, CacheKey, ResponseCache};
use crate::token_cache::{Credential, TokenManager};

type SharedFetch = Shared<BoxFuture<'static, Result<Value, ClientError>>>;

/// Request client for the mission REST API.
///
/// Cheap to clone; clones share the cache, the in-flight table and the token
/// manager.
#[derive(Clone)]
pub struct RequestClient {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    http: Client,
    base_url: String,
    tokens: Arc<TokenManager>,
    clock: Arc<dyn Clock>,
    state: Mutex<CacheState>,
    ttl: Mutex<Duration>,
}

#[derive(Default)]
struct CacheState {
    cache: ResponseCache,
    pending: HashMap<CacheKey, PendingFetch>,
    /// Bumped by every mutation. A fetch started under an older generation
    /// may have read pre-write data and must not be cached.
    generation: u64,
}

struct PendingFetch {
    generation: u64,
    fetch: SharedFetch,
}

struct RawResponse {
    status: u16,
    etag: Option<String>,
    body: String,
}

impl RequestClient {
    pub fn new(
        http: Client,
        base_url: impl Into<String>,
        tokens: Arc<TokenManager>,
        clock: Arc<dyn Clock>,
        cache_ttl: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(ClientInner {
                http,
                base_url: base_url.into(),
                tokens,
                clock,
                state: Mutex::new(CacheState::default()),
                ttl: Mutex::new(cache_ttl),
            }),
        }
    }

    /// Build the underlying `reqwest` client with the configured timeout.
    pub fn http_client(config: &ClientConfig) -> Result<Client, RequestError> {
        Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| RequestError::Network(e.to_string()))
    }

    /// GET with the default cache lifetime.
    pub async fn get(&self, path: &str, params: &[(&str, &str)]) -> Result<Value, ClientError> {
        let ttl = *self.inner.ttl.lock();
        self.get_with_ttl(path, params, ttl).await
    }

    /// GET, serving a cached response younger than `ttl` without touching
    /// the network. Concurrent identical calls share one request.
    pub async fn get_with_ttl(
        &self,
        path: &str,
        params: &[(&str, &str)],
        ttl: Duration,
    ) -> Result<Value, ClientError> {
        let params: Vec<(String, String)> = params
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        let scope = self
            .inner
            .tokens
            .credential()
            .await
            .and_then(|credential| credential.subject);
        let key = CacheKey::new(scope, path, &params);

        let fetch = {
            let mut state = self.inner.state.lock();
            if let Some(hit) = state.cache.fresh(&key, self.inner.clock.now(), ttl) {
                crate::log_debug!("Cache hit for {}", key.resource);
                return Ok(hit);
            }
            match state.pending.get(&key) {
                Some(pending) => {
                    crate::log_debug!("Joining in-flight request for {}", key.resource);
                    pending.fetch.clone()
                }
                None => {
                    let generation = state.generation;
                    let fetch = self.inner.clone().fetch(
                        key.clone(),
                        path.to_string(),
                        params,
                        generation,
                    );
                    state.pending.insert(
                        key,
                        PendingFetch {
                            generation,
                            fetch: fetch.clone(),
                        },
                    );
                    // Driven by its own task so the pending slot is always released.
                    tokio::spawn(fetch.clone());
                    fetch
                }
            }
        };
        fetch.await
    }

    /// GET and deserialize into `T`.
    pub async fn get_json<T: DeserializeOwned>(
        &self,
        path: &str,
        params: &[(&str, &str)],
    ) -> Result<T, ClientError> {
        let value = self.get(path, params).await?;
        Self::decode(value)
    }

    pub fn decode<T: DeserializeOwned>(value: Value) -> Result<T, ClientError> {
        serde_json::from_value(value)
            .map_err(|e| RequestError::Deserialize(e.to_string()).into())
    }

    pub async fn post<B: Serialize + ?Sized>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<Value, ClientError> {
        self.mutate(Method::POST, path, Some(to_body(body)?)).await
    }

    pub async fn put<B: Serialize + ?Sized>(&self, path: &str, body: &B) -> Result<Value, ClientError> {
        self.mutate(Method::PUT, path, Some(to_body(body)?)).await
    }

    pub async fn patch<B: Serialize + ?Sized>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<Value, ClientError> {
        self.mutate(Method::PATCH, path, Some(to_body(body)?)).await
    }

    pub async fn delete(&self, path: &str) -> Result<Value, ClientError> {
        self.mutate(Method::DELETE, path, None).await
    }

    /// Change the default cache lifetime for later GETs.
    pub fn set_cache_lifetime(&self, ttl: Duration) {
        *self.inner.ttl.lock() = ttl;
    }

    /// Clear cached responses whose resource starts with one of `prefixes`,
    /// or everything when `None`.
    pub fn clear_cache(&self, prefixes: Option<&[&str]>) {
        let mut state = self.inner.state.lock();
        match prefixes {
            Some(prefixes) => {
                let removed = state.cache.clear_matching(prefixes);
                crate::log_debug!("Cleared {} cached responses", removed);
            }
            None => state.cache.clear(),
        }
    }

    pub fn cached_entries(&self) -> usize {
        self.inner.state.lock().cache.len()
    }

    pub fn in_flight(&self) -> usize {
        self.inner.state.lock().pending.len()
    }

    async fn mutate(
        &self,
        method: Method,
        path: &str,
        body: Option<Value>,
    ) -> Result<Value, ClientError> {
        let url = self.inner.url(path);
        let body = body.filter(|b| !b.is_null());
        let result = self
            .inner
            .execute(method, &url, &[], body.as_ref(), None)
            .await;

        // The server may have applied the change even when the call failed.
        let base = invalidation_base(path);
        let (removed, detached) = {
            let mut state = self.inner.state.lock();
            state.generation = state.generation.wrapping_add(1);
            let removed = state.cache.invalidate_resource(&base);
            let before = state.pending.len();
            state.pending.retain(|key, _| !is_under(&key.resource, &base));
            (removed, before - state.pending.len())
        };
        if removed > 0 || detached > 0 {
            crate::log_debug!(
                "Invalidated {} cached and {} in-flight responses under {}",
                removed,
                detached,
                base
            );
        }

        parse_body(&result?.body)
    }
}

impl ClientInner {
    fn url(&self, path: &str) -> String {
        if path.starts_with("http://") || path.starts_with("https://") {
            return path.to_string();
        }
        let base = self.base_url.trim_end_matches('/');
        let path = path.trim_start_matches('/');
        format!("{base}/{path}")
    }

    fn fetch(
        self: Arc<Self>,
        key: CacheKey,
        path: String,
        params: Vec<(String, String)>,
        generation: u64,
    ) -> SharedFetch {
        async move {
            let result = self.load(&key, &path, &params, generation).await;
            let mut state = self.state.lock();
            // A mutation may have detached this fetch and a newer one taken the slot.
            if state
                .pending
                .get(&key)
                .is_some_and(|pending| pending.generation == generation)
            {
                state.pending.remove(&key);
            }
            result
        }
        .boxed()
        .shared()
    }

    async fn load(
        &self,
        key: &CacheKey,
        path: &str,
        params: &[(String, String)],
        generation: u64,
    ) -> Result<Value, ClientError> {
        let url = self.url(path);
        let validator = self.state.lock().cache.validator(key);
        let mut response = self
            .execute(Method::GET, &url, params, None, validator.as_deref())
            .await?;

        if response.status == 304 {
            let revalidated = self.state.lock().cache.revalidate(key, self.clock.now());
            match revalidated {
                Ok(payload) => {
                    crate::log_debug!("{} not modified", key.resource);
                    return Ok(payload);
                }
                Err(err) => {
                    crate::log_warn!("304 without a usable entry ({}), fetching again", err);
                    response = self.execute(Method::GET, &url, params, None, None).await?;
                }
            }
        }

        if response.status == 304 {
            return Err(RequestError::Http {
                status: 304,
                body: response.body,
            }
            .into());
        }

        let payload = parse_body(&response.body)?;
        let mut state = self.state.lock();
        if state.generation == generation {
            state
                .cache
                .store(key.clone(), payload.clone(), response.etag, self.clock.now());
        } else {
            crate::log_debug!("Not caching {}: a mutation landed while it was in flight", key.resource);
        }
        Ok(payload)
    }

    /// Send a request with the current credential, refreshing it once on 401.
    async fn execute(
        &self,
        method: Method,
        url: &str,
        query: &[(String, String)],
        body: Option<&Value>,
        if_none_match: Option<&str>,
    ) -> Result<RawResponse, ClientError> {
        let request_id = Uuid::new_v4();
        let mut credential = self.tokens.credential().await;
        let mut retried = false;

        loop {
            let response = self
                .send_once(
                    method.clone(),
                    url,
                    query,
                    body,
                    if_none_match,
                    credential.as_ref(),
                    request_id,
                )
                .await?;

            if response.status != 401 {
                return classify(response, request_id);
            }
            if retried {
                crate::log_error!("[{}] {} {} rejected after refresh", request_id, method, url);
                self.tokens.invalidate();
                return Err(AuthError::Rejected.into());
            }

            crate::log_warn!("[{}] {} {} returned 401, refreshing token", request_id, method, url);
            credential = Some(self.tokens.recover(credential.as_ref()).await?);
            retried = true;
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn send_once(
        &self,
        method: Method,
        url: &str,
        query: &[(String, String)],
        body: Option<&Value>,
        if_none_match: Option<&str>,
        credential: Option<&Credential>,
        request_id: Uuid,
    ) -> Result<RawResponse, RequestError> {
        crate::log_debug!("[{}] {} {}", request_id, method, url);
        let mut rb = self
            .http
            .request(method, url)
            .header("X-Request-Id", request_id.to_string());
        if !query.is_empty() {
            rb = rb.query(query);
        }
        if let Some(credential) = credential {
            rb = rb.bearer_auth(&credential.token);
        }
        if let Some(etag) = if_none_match {
            rb = rb.header(header::IF_NONE_MATCH, etag);
        }
        if let Some(body) = body {
            rb = rb.json(body);
        }

        let resp = rb.send().await.map_err(map_transport_error)?;
        let status = resp.status().as_u16();
        let etag = resp
            .headers()
            .get(header::ETAG)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let body = resp.text().await.map_err(map_transport_error)?;

        Ok(RawResponse { status, etag, body })
    }
}

fn classify(response: RawResponse, request_id: Uuid) -> Result<RawResponse, ClientError> {
    if (200..300).contains(&response.status) || response.status == 304 {
        return Ok(response);
    }
    crate::log_warn!("[{}] request failed with status {}", request_id, response.status);
    Err(RequestError::Http {
        status: response.status,
        body: response.body,
    }
    .into())
}

fn map_transport_error(e: reqwest::Error) -> RequestError {
    if e.is_timeout() {
        RequestError::Timeout
    } else {
        RequestError::Network(e.to_string())
    }
}

fn parse_body(text: &str) -> Result<Value, ClientError> {
    if text.trim().is_empty() {
        return Ok(Value::Null);
    }
    serde_json::from_str(text).map_err(|e| RequestError::Deserialize(e.to_string()).into())
}

fn to_body<B: Serialize + ?Sized>(body: &B) -> Result<Value, ClientError> {
    serde_json::to_value(body).map_err(|e| RequestError::Serialize(e.to_string()).into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn empty_body_is_null() {
        assert_eq!(parse_body("").unwrap(), Value::Null);
        assert_eq!(parse_body("  \n").unwrap(), Value::Null);
        assert_eq!(parse_body(r#"{"ok":true}"#).unwrap(), json!({"ok": true}));
    }

    #[test]
    fn invalid_json_is_a_deserialize_error() {
        let err = parse_body("<html>").unwrap_err();
        assert!(matches!(
            err,
            ClientError::Request(RequestError::Deserialize(_))
        ));
    }

    #[test]
    fn not_modified_and_success_pass_classification() {
        let id = Uuid::new_v4();
        for status in [200, 204, 304] {
            let raw = RawResponse {
                status,
                etag: None,
                body: String::new(),
            };
            assert!(classify(raw, id).is_ok());
        }
        let raw = RawResponse {
            status: 500,
            etag: None,
            body: "boom".to_string(),
        };
        assert_eq!(
            classify(raw, id).err(),
            Some(ClientError::Request(RequestError::Http {
                status: 500,
                body: "boom".to_string()
            }))
        );
    }

    #[test]
    fn decode_maps_type_mismatch() {
        #[derive(Debug, serde::Deserialize)]
        struct Mission {
            #[allow(dead_code)]
            id: u32,
        }
        assert!(RequestClient::decode::<Mission>(json!({"id": 4})).is_ok());
        assert!(matches!(
            RequestClient::decode::<Mission>(json!({"id": "x"})),
            Err(ClientError::Request(RequestError::Deserialize(_)))
        ));
    }
}
