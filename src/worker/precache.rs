//! Install-time precache
//!
//! Each manifest URL maps to one cache key. Revisioned entries get the
//! revision appended as a query parameter so a new revision is a new key;
//! unrevisioned entries are keyed by their URL alone. Install fills missing
//! keys, activate drops keys that left the manifest.

use async_trait::async_trait;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info, warn};
use url::Url;

use super::strategy::{Fetcher, Strategy, WorkerRequest};
use crate::cache::{CacheStorage, StoredResponse};
use crate::config::PrecacheEntry;
use crate::error::{DecodeError, Error, FetchError, StorageError};

pub const REVISION_SEARCH_PARAM: &str = "__WB_REVISION__";
const PRECACHE_MARKER: &str = "-precache-";
const DIRECTORY_INDEX: &str = "index.html";

/// Outcome of an install pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InstallReport {
    pub updated: Vec<String>,
    pub not_updated: Vec<String>,
}

pub struct PrecacheController {
    cache_name: String,
    scope: String,
    origin: Url,
    url_to_cache_key: BTreeMap<String, String>,
    storage: Arc<dyn CacheStorage>,
    fetcher: Arc<dyn Fetcher>,
}

impl PrecacheController {
    pub fn new(
        origin: Url,
        scope: &str,
        storage: Arc<dyn CacheStorage>,
        fetcher: Arc<dyn Fetcher>,
    ) -> Self {
        let scope = origin
            .join(scope)
            .map(|u| u.to_string())
            .unwrap_or_else(|_| origin.to_string());
        Self {
            cache_name: format!("offline-shell{PRECACHE_MARKER}v2-{scope}"),
            scope,
            origin,
            url_to_cache_key: BTreeMap::new(),
            storage,
            fetcher,
        }
    }

    pub fn cache_name(&self) -> &str {
        &self.cache_name
    }

    /// Add manifest entries. Two entries for one URL with different cache
    /// keys are rejected.
    pub fn add_to_cache_list(&mut self, entries: &[PrecacheEntry]) -> Result<(), Error> {
        for entry in entries {
            let (url, cache_key) = self.cache_key(entry)?;
            match self.url_to_cache_key.get(&url) {
                Some(existing) if *existing != cache_key => {
                    return Err(StorageError::ConflictingEntries {
                        url,
                        first: existing.clone(),
                        second: cache_key,
                    }
                    .into());
                }
                _ => {
                    self.url_to_cache_key.insert(url, cache_key);
                }
            }
        }
        Ok(())
    }

    fn cache_key(&self, entry: &PrecacheEntry) -> Result<(String, String), DecodeError> {
        let mut url = self.origin.join(&entry.url).map_err(|source| DecodeError::Url {
            url: entry.url.clone(),
            source,
        })?;
        url.set_fragment(None);

        let mut key = url.clone();
        if let Some(revision) = &entry.revision {
            key.query_pairs_mut()
                .append_pair(REVISION_SEARCH_PARAM, revision);
        }
        Ok((url.to_string(), key.to_string()))
    }

    pub fn cached_urls(&self) -> Vec<String> {
        self.url_to_cache_key.keys().cloned().collect()
    }

    pub fn cache_keys(&self) -> Vec<String> {
        self.url_to_cache_key.values().cloned().collect()
    }

    /// Fetch and store every key not yet cached. Any response with an
    /// error status fails the install.
    pub async fn install(&self) -> Result<InstallReport, Error> {
        let mut report = InstallReport::default();

        for (url, cache_key) in &self.url_to_cache_key {
            if self.storage.match_key(&self.cache_name, cache_key).await?.is_some() {
                report.not_updated.push(url.clone());
                continue;
            }

            let target = Url::parse(cache_key).map_err(|source| DecodeError::Url {
                url: cache_key.clone(),
                source,
            })?;
            let response = self.fetcher.fetch(&WorkerRequest::get(target)).await?;
            if response.status.as_u16() >= 400 {
                return Err(FetchError::BadPrecacheResponse {
                    url: url.clone(),
                    status: response.status.as_u16(),
                }
                .into());
            }

            self.storage
                .put(&self.cache_name, cache_key, response)
                .await?;
            report.updated.push(url.clone());
        }

        info!(
            cache = %self.cache_name,
            updated = report.updated.len(),
            not_updated = report.not_updated.len(),
            "Precache installed"
        );
        Ok(report)
    }

    /// Delete cached keys that are no longer in the manifest.
    pub async fn activate(&self) -> Result<Vec<String>, StorageError> {
        let expected: HashSet<&String> = self.url_to_cache_key.values().collect();
        let mut deleted = Vec::new();

        for key in self.storage.keys(&self.cache_name).await? {
            if !expected.contains(&key) {
                self.storage.delete(&self.cache_name, &key).await?;
                deleted.push(key);
            }
        }

        if !deleted.is_empty() {
            debug!(cache = %self.cache_name, deleted = deleted.len(), "Removed stale precache entries");
        }
        Ok(deleted)
    }

    /// Delete precache scopes of older versions for the same scope.
    pub async fn cleanup_outdated_caches(&self) -> Result<Vec<String>, StorageError> {
        let mut deleted = Vec::new();
        for name in self.storage.cache_names().await? {
            if name.contains(PRECACHE_MARKER) && name.contains(&self.scope) && name != self.cache_name {
                self.storage.delete_cache(&name).await?;
                deleted.push(name);
            }
        }
        if !deleted.is_empty() {
            info!(caches = ?deleted, "Deleted outdated precaches");
        }
        Ok(deleted)
    }

    /// Cache key for `url`, trying each navigation-tolerant variant.
    pub fn cache_key_for_url(&self, url: &Url) -> Option<&str> {
        url_variations(url)
            .iter()
            .find_map(|variant| self.url_to_cache_key.get(variant.as_str()))
            .map(String::as_str)
    }

    pub fn matches(&self, request: &WorkerRequest) -> bool {
        request.method == http::Method::GET && self.cache_key_for_url(&request.url).is_some()
    }
}

#[async_trait]
impl Strategy for PrecacheController {
    fn cache_name(&self) -> &str {
        &self.cache_name
    }

    async fn handle(&self, request: &WorkerRequest) -> Result<StoredResponse, FetchError> {
        if let Some(key) = self.cache_key_for_url(&request.url) {
            match self.storage.match_key(&self.cache_name, key).await {
                Ok(Some(hit)) => return Ok(hit),
                Ok(None) => {}
                Err(e) => warn!(url = %request.url, error = %e, "Precache lookup failed"),
            }
        }
        debug!(url = %request.url, "Precache miss, using network");
        self.fetcher.fetch(request).await
    }
}

fn is_ignored_param(name: &str) -> bool {
    name.starts_with("utm_") || name == "fbclid"
}

/// Candidate URLs for a precache lookup, most specific first.
pub fn url_variations(url: &Url) -> Vec<Url> {
    let mut variants = Vec::with_capacity(4);

    let mut base = url.clone();
    base.set_fragment(None);
    variants.push(base.clone());

    let kept: Vec<(String, String)> = base
        .query_pairs()
        .filter(|(name, _)| !is_ignored_param(name))
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    let mut stripped = base;
    if kept.is_empty() {
        stripped.set_query(None);
    } else {
        stripped.query_pairs_mut().clear().extend_pairs(kept);
    }
    variants.push(stripped.clone());

    let path = stripped.path().to_string();
    if path.ends_with('/') {
        let mut index = stripped.clone();
        index.set_path(&format!("{path}{DIRECTORY_INDEX}"));
        variants.push(index);
    }

    let mut clean = stripped;
    clean.set_path(&format!("{path}.html"));
    variants.push(clean);

    variants
}
