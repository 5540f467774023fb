//! Named cache scopes holding full response snapshots

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use http::header::{HeaderValue, CONTENT_LENGTH, CONTENT_TYPE, DATE};
use http::{HeaderMap, StatusCode};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tracing::{debug, warn};

use super::normalize_key;
use crate::error::StorageError;

/// A response snapshot as held by a cache scope.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl StoredResponse {
    pub fn new(status: StatusCode, body: impl Into<Bytes>) -> Self {
        Self {
            status,
            headers: HeaderMap::new(),
            body: body.into(),
        }
    }

    /// Synthetic `200 OK` HTML response with an exact byte `Content-Length`.
    pub fn html(markup: impl Into<String>) -> Self {
        let body = Bytes::from(markup.into());
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("text/html"));
        headers.insert(CONTENT_LENGTH, HeaderValue::from(body.len()));
        Self {
            status: StatusCode::OK,
            headers,
            body,
        }
    }

    pub fn with_header(mut self, name: http::header::HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    pub fn content_type(&self) -> Option<&str> {
        self.headers.get(CONTENT_TYPE).and_then(|v| v.to_str().ok())
    }

    pub fn content_length(&self) -> Option<usize> {
        self.headers
            .get(CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse().ok())
    }

    /// Parsed `Date` header, if present and well formed.
    pub fn date(&self) -> Option<DateTime<Utc>> {
        let raw = self.headers.get(DATE)?.to_str().ok()?;
        DateTime::parse_from_rfc2822(raw)
            .ok()
            .map(|d| d.with_timezone(&Utc))
    }

    pub fn size_bytes(&self) -> u64 {
        self.body.len() as u64
    }
}

/// Key→response storage scoped by named cache.
#[async_trait]
pub trait CacheStorage: Send + Sync {
    async fn put(&self, cache: &str, key: &str, response: StoredResponse)
        -> Result<(), StorageError>;

    async fn match_key(&self, cache: &str, key: &str)
        -> Result<Option<StoredResponse>, StorageError>;

    async fn delete(&self, cache: &str, key: &str) -> Result<bool, StorageError>;

    /// Keys of one cache scope, sorted.
    async fn keys(&self, cache: &str) -> Result<Vec<String>, StorageError>;

    async fn cache_names(&self) -> Result<Vec<String>, StorageError>;

    async fn delete_cache(&self, cache: &str) -> Result<bool, StorageError>;
}

/// In-process cache storage with an optional byte quota.
#[derive(Debug, Default)]
pub struct MemoryCacheStorage {
    caches: DashMap<String, DashMap<String, StoredResponse>>,
    quota_bytes: Option<u64>,
    used_bytes: AtomicU64,
    unavailable: AtomicBool,
}

impl MemoryCacheStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Storage that refuses writes once `quota_bytes` of bodies are held.
    pub fn with_quota(quota_bytes: u64) -> Self {
        Self {
            quota_bytes: Some(quota_bytes),
            ..Self::default()
        }
    }

    /// Mark the storage as unavailable (e.g. private browsing, evicted origin).
    pub fn set_available(&self, available: bool) {
        self.unavailable.store(!available, Ordering::SeqCst);
    }

    pub fn used_bytes(&self) -> u64 {
        self.used_bytes.load(Ordering::SeqCst)
    }

    fn check_available(&self) -> Result<(), StorageError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StorageError::Unavailable("cache storage is closed".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl CacheStorage for MemoryCacheStorage {
    async fn put(
        &self,
        cache: &str,
        key: &str,
        response: StoredResponse,
    ) -> Result<(), StorageError> {
        self.check_available()?;
        let key = normalize_key(key);
        let scope = self.caches.entry(cache.to_string()).or_default();

        let previous = scope.get(&key).map(|r| r.size_bytes()).unwrap_or(0);
        let incoming = response.size_bytes();
        let used = self.used_bytes.load(Ordering::SeqCst);
        let projected = used.saturating_sub(previous) + incoming;

        if let Some(quota) = self.quota_bytes {
            if projected > quota {
                warn!(cache, key = %key, projected, quota, "Cache quota exceeded");
                return Err(StorageError::QuotaExceeded {
                    cache: cache.to_string(),
                    key,
                });
            }
        }

        scope.insert(key.clone(), response);
        self.used_bytes.store(projected, Ordering::SeqCst);
        debug!(cache, key = %key, bytes = incoming, "Cached response");
        Ok(())
    }

    async fn match_key(
        &self,
        cache: &str,
        key: &str,
    ) -> Result<Option<StoredResponse>, StorageError> {
        self.check_available()?;
        let key = normalize_key(key);
        let hit = match self.caches.get(cache) {
            Some(scope) => {
                let found = scope.get(&key).map(|r| r.value().clone());
                found
            }
            None => None,
        };
        Ok(hit)
    }

    async fn delete(&self, cache: &str, key: &str) -> Result<bool, StorageError> {
        self.check_available()?;
        let key = normalize_key(key);
        let removed = self
            .caches
            .get(cache)
            .and_then(|scope| scope.remove(&key));
        if let Some((_, response)) = &removed {
            self.used_bytes
                .fetch_sub(response.size_bytes(), Ordering::SeqCst);
        }
        Ok(removed.is_some())
    }

    async fn keys(&self, cache: &str) -> Result<Vec<String>, StorageError> {
        self.check_available()?;
        let mut keys: Vec<String> = match self.caches.get(cache) {
            Some(scope) => {
                let keys: Vec<String> = scope.iter().map(|e| e.key().clone()).collect();
                keys
            }
            None => Vec::new(),
        };
        keys.sort();
        Ok(keys)
    }

    async fn cache_names(&self) -> Result<Vec<String>, StorageError> {
        self.check_available()?;
        let mut names: Vec<String> = self.caches.iter().map(|e| e.key().clone()).collect();
        names.sort();
        Ok(names)
    }

    async fn delete_cache(&self, cache: &str) -> Result<bool, StorageError> {
        self.check_available()?;
        match self.caches.remove(cache) {
            Some((_, scope)) => {
                let freed: u64 = scope.iter().map(|e| e.value().size_bytes()).sum();
                self.used_bytes.fetch_sub(freed, Ordering::SeqCst);
                Ok(true)
            }
            None => Ok(false),
        }
    }
}
