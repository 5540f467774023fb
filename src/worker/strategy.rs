//! Fetch handling strategies for the background worker

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use http::{Method, StatusCode};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};
use url::Url;

use crate::cache::{CacheExpiration, CacheStorage, StoredResponse};
use crate::error::FetchError;

/// A request intercepted by the worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerRequest {
    pub method: Method,
    pub url: Url,
    /// Top-level document navigation
    pub navigate: bool,
}

impl WorkerRequest {
    pub fn get(url: Url) -> Self {
        Self {
            method: Method::GET,
            url,
            navigate: false,
        }
    }

    pub fn navigation(url: Url) -> Self {
        Self {
            method: Method::GET,
            url,
            navigate: true,
        }
    }
}

/// Network access from the worker.
#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch(&self, request: &WorkerRequest) -> Result<StoredResponse, FetchError>;
}

/// Fetcher backed by a `reqwest` client.
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new(timeout: Duration) -> Result<Self, FetchError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| FetchError::Network {
                url: String::new(),
                reason: format!("HTTP client error: {e}"),
            })?;
        Ok(Self { client })
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch(&self, request: &WorkerRequest) -> Result<StoredResponse, FetchError> {
        let network = |e: reqwest::Error| FetchError::Network {
            url: request.url.to_string(),
            reason: e.to_string(),
        };

        let response = self
            .client
            .request(request.method.clone(), request.url.clone())
            .send()
            .await
            .map_err(network)?;

        let status = response.status();
        let headers = response.headers().clone();
        let body: Bytes = response.bytes().await.map_err(network)?;

        Ok(StoredResponse {
            status,
            headers,
            body,
        })
    }
}

/// How a matched route produces a response.
#[async_trait]
pub trait Strategy: Send + Sync {
    fn cache_name(&self) -> &str;

    async fn handle(&self, request: &WorkerRequest) -> Result<StoredResponse, FetchError>;
}

// Only complete responses are worth keeping
fn is_cacheable(response: &StoredResponse) -> bool {
    response.status == StatusCode::OK
}

async fn fetch_and_put(
    fetcher: &dyn Fetcher,
    storage: &dyn CacheStorage,
    cache_name: &str,
    request: &WorkerRequest,
) -> Result<StoredResponse, FetchError> {
    let response = fetcher.fetch(request).await?;
    if is_cacheable(&response) {
        if let Err(e) = storage
            .put(cache_name, request.url.as_str(), response.clone())
            .await
        {
            warn!(url = %request.url, cache = cache_name, error = %e, "Failed to cache response");
        }
    } else {
        debug!(url = %request.url, status = %response.status, "Response not cacheable");
    }
    Ok(response)
}

async fn cached(
    storage: &dyn CacheStorage,
    cache_name: &str,
    url: &Url,
) -> Option<StoredResponse> {
    match storage.match_key(cache_name, url.as_str()).await {
        Ok(hit) => hit,
        Err(e) => {
            warn!(url = %url, cache = cache_name, error = %e, "Cache lookup failed");
            None
        }
    }
}

/// Network first, cache as fallback. With a timeout, a slow network is
/// raced against the cache: the cache answers if it can, otherwise the
/// network keeps its chance.
pub struct NetworkFirst {
    cache_name: String,
    network_timeout: Option<Duration>,
    storage: Arc<dyn CacheStorage>,
    fetcher: Arc<dyn Fetcher>,
}

impl NetworkFirst {
    pub fn new(
        cache_name: impl Into<String>,
        storage: Arc<dyn CacheStorage>,
        fetcher: Arc<dyn Fetcher>,
    ) -> Self {
        Self {
            cache_name: cache_name.into(),
            network_timeout: None,
            storage,
            fetcher,
        }
    }

    pub fn with_network_timeout(mut self, timeout: Duration) -> Self {
        self.network_timeout = Some(timeout);
        self
    }
}

#[async_trait]
impl Strategy for NetworkFirst {
    fn cache_name(&self) -> &str {
        &self.cache_name
    }

    async fn handle(&self, request: &WorkerRequest) -> Result<StoredResponse, FetchError> {
        let storage = self.storage.as_ref();
        let network = fetch_and_put(self.fetcher.as_ref(), storage, &self.cache_name, request);
        tokio::pin!(network);

        let result = match self.network_timeout {
            Some(timeout) => match tokio::time::timeout(timeout, &mut network).await {
                Ok(result) => result,
                Err(_) => {
                    if let Some(hit) = cached(storage, &self.cache_name, &request.url).await {
                        debug!(url = %request.url, timeout_ms = timeout.as_millis() as u64, "Network slow, served from cache");
                        return Ok(hit);
                    }
                    network.await
                }
            },
            None => network.await,
        };

        match result {
            Ok(response) => Ok(response),
            Err(e) => {
                debug!(url = %request.url, error = %e, "Network failed, trying cache");
                cached(storage, &self.cache_name, &request.url)
                    .await
                    .ok_or_else(|| FetchError::NoResponse(request.url.to_string()))
            }
        }
    }
}

/// Cache first; misses and stale hits go to the network and refill the
/// cache, then the expiration policy is applied.
pub struct CacheFirst {
    cache_name: String,
    expiration: Option<CacheExpiration>,
    storage: Arc<dyn CacheStorage>,
    fetcher: Arc<dyn Fetcher>,
}

impl CacheFirst {
    pub fn new(
        cache_name: impl Into<String>,
        storage: Arc<dyn CacheStorage>,
        fetcher: Arc<dyn Fetcher>,
    ) -> Self {
        Self {
            cache_name: cache_name.into(),
            expiration: None,
            storage,
            fetcher,
        }
    }

    pub fn with_expiration(mut self, policy: crate::cache::ExpirationPolicy) -> Self {
        self.expiration = Some(CacheExpiration::new(self.cache_name.clone(), policy));
        self
    }

    async fn apply_expiration(&self) {
        if let Some(expiration) = &self.expiration {
            if let Err(e) = expiration
                .expire_entries(self.storage.as_ref(), Utc::now())
                .await
            {
                warn!(cache = %self.cache_name, error = %e, "Expiration pass failed");
            }
        }
    }
}

#[async_trait]
impl Strategy for CacheFirst {
    fn cache_name(&self) -> &str {
        &self.cache_name
    }

    async fn handle(&self, request: &WorkerRequest) -> Result<StoredResponse, FetchError> {
        let storage = self.storage.as_ref();

        if let Some(hit) = cached(storage, &self.cache_name, &request.url).await {
            let fresh = self
                .expiration
                .as_ref()
                .map_or(true, |exp| exp.is_response_fresh(&hit, Utc::now()));
            if fresh {
                self.apply_expiration().await;
                return Ok(hit);
            }
            debug!(url = %request.url, "Cached response expired");
        }

        let response = fetch_and_put(self.fetcher.as_ref(), storage, &self.cache_name, request).await?;
        if is_cacheable(&response) {
            if let Some(expiration) = &self.expiration {
                expiration.update_timestamp(request.url.as_str(), Utc::now());
            }
            self.apply_expiration().await;
        }
        Ok(response)
    }
}
