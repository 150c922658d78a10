//! GET response cache with ETag validators.
//!
//! Keys are `(scope, resource)`: the scope is the subject of the credential
//! the response was fetched with, the resource is the request path plus its
//! sorted query parameters. Invalidation works on resources and ignores scope.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CacheError {
    #[error("no cached entry for {0}")]
    Missing(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub scope: Option<String>,
    pub resource: String,
}

impl CacheKey {
    pub fn new(scope: Option<String>, path: &str, params: &[(String, String)]) -> Self {
        Self {
            scope,
            resource: resource_key(path, params),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub payload: Value,
    pub stored_at: Instant,
    pub etag: Option<String>,
}

impl CacheEntry {
    pub fn is_fresh(&self, now: Instant, ttl: Duration) -> bool {
        now.saturating_duration_since(self.stored_at) < ttl
    }
}

/// Entries kept before the oldest ones are evicted.
pub const DEFAULT_MAX_ENTRIES: usize = 512;
/// Age after which an entry is dropped on the next store, fresh or not.
pub const DEFAULT_RETENTION: Duration = Duration::from_secs(10 * 60);

#[derive(Debug)]
pub struct ResponseCache {
    entries: HashMap<CacheKey, CacheEntry>,
    max_entries: usize,
    retention: Duration,
}

impl Default for ResponseCache {
    fn default() -> Self {
        Self::with_limits(DEFAULT_MAX_ENTRIES, DEFAULT_RETENTION)
    }
}

impl ResponseCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_limits(max_entries: usize, retention: Duration) -> Self {
        Self {
            entries: HashMap::new(),
            max_entries: max_entries.max(1),
            retention,
        }
    }

    /// Cached payload if it is still fresh at `now`.
    pub fn fresh(&self, key: &CacheKey, now: Instant, ttl: Duration) -> Option<Value> {
        self.entries
            .get(key)
            .filter(|entry| entry.is_fresh(now, ttl))
            .map(|entry| entry.payload.clone())
    }

    /// ETag of the entry for `key`, fresh or not.
    pub fn validator(&self, key: &CacheKey) -> Option<String> {
        self.entries.get(key).and_then(|entry| entry.etag.clone())
    }

    /// Insert or replace an entry, then evict: first everything past the
    /// retention window, then the oldest entries while over capacity.
    pub fn store(&mut self, key: CacheKey, payload: Value, etag: Option<String>, now: Instant) {
        self.entries.insert(
            key,
            CacheEntry {
                payload,
                stored_at: now,
                etag,
            },
        );
        self.evict(now);
    }

    fn evict(&mut self, now: Instant) {
        let retention = self.retention;
        self.entries
            .retain(|_, entry| now.saturating_duration_since(entry.stored_at) < retention);

        while self.entries.len() > self.max_entries {
            let oldest = self
                .entries
                .iter()
                .min_by_key(|(_, entry)| entry.stored_at)
                .map(|(key, _)| key.clone());
            match oldest {
                Some(key) => {
                    self.entries.remove(&key);
                }
                None => break,
            }
        }
    }

    /// Handle a `304 Not Modified`: restart the entry's lifetime and hand
    /// back its payload.
    pub fn revalidate(&mut self, key: &CacheKey, now: Instant) -> Result<Value, CacheError> {
        let entry = self
            .entries
            .get_mut(key)
            .ok_or_else(|| CacheError::Missing(key.resource.clone()))?;
        entry.stored_at = now;
        Ok(entry.payload.clone())
    }

    /// Drop every entry at or under `base` in every scope.
    ///
    /// Matching stops at path boundaries: `/api/missions` covers
    /// `/api/missions`, `/api/missions/7` and `/api/missions?page=2`, but not
    /// `/api/missions-archive`. A plain string prefix would also drop the
    /// latter.
    pub fn invalidate_resource(&mut self, base: &str) -> usize {
        let before = self.entries.len();
        self.entries
            .retain(|key, _| !is_under(&key.resource, base));
        before - self.entries.len()
    }

    /// Drop entries whose resource starts with any of `prefixes`.
    pub fn clear_matching(&mut self, prefixes: &[&str]) -> usize {
        let before = self.entries.len();
        self.entries.retain(|key, _| {
            !prefixes
                .iter()
                .any(|prefix| key.resource.starts_with(&normalize_path(prefix)))
        });
        before - self.entries.len()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Canonical resource string: normalised path plus query parameters sorted
/// by name, then value.
pub fn resource_key(path: &str, params: &[(String, String)]) -> String {
    let path = normalize_path(path);
    if params.is_empty() {
        return path;
    }
    let mut sorted: Vec<&(String, String)> = params.iter().collect();
    sorted.sort();
    let query = sorted
        .iter()
        .map(|(k, v)| format!("{}={}", urlencoding::encode(k), urlencoding::encode(v)))
        .collect::<Vec<_>>()
        .join("&");
    format!("{path}?{query}")
}

/// The collection a mutated path belongs to: `/missions/42` -> `/missions`.
pub fn invalidation_base(path: &str) -> String {
    let path = normalize_path(path.split('?').next().unwrap_or(path));
    match path.rsplit_once('/') {
        Some((parent, last))
            if !last.is_empty() && last.bytes().all(|b| b.is_ascii_digit()) =>
        {
            if parent.is_empty() {
                "/".to_string()
            } else {
                parent.to_string()
            }
        }
        _ => path,
    }
}

fn normalize_path(path: &str) -> String {
    if path.starts_with("http://") || path.starts_with("https://") {
        return path.trim_end_matches('/').to_string();
    }
    let trimmed = path.trim_matches('/');
    format!("/{trimmed}")
}

/// `resource` equals `base` or lies beneath it on a path boundary.
pub fn is_under(resource: &str, base: &str) -> bool {
    if base == "/" {
        return true;
    }
    match resource.strip_prefix(base) {
        Some(rest) => rest.is_empty() || rest.starts_with('/') || rest.starts_with('?'),
        None => false,
    }
}
