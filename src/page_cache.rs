//! Offline shell snapshots
//!
//! Snapshots the rendered document of an allowlisted shell route into the
//! page-level cache scope so the worker can serve it when offline. Each
//! path is written at most once per page lifetime, and only when the
//! navigation target is the document that is actually loaded.
//!
//! Failures never propagate: a missing snapshot only degrades the offline
//! fallback.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};
use url::Url;

use crate::cache::{CacheStorage, StoredResponse};
use crate::config::ShellConfig;
use crate::host::SnapshotSource;

/// What a caching attempt did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheOutcome {
    Stored,
    /// Path is not a shell route
    NotAllowlisted,
    /// Path was already written during this page lifetime
    AlreadyCached,
    /// Navigation target differs from the loaded document
    PathMismatch,
    /// Write attempted and failed (logged)
    Failed,
}

pub struct OfflinePageCache {
    storage: Arc<dyn CacheStorage>,
    snapshot: Arc<dyn SnapshotSource>,
    cache_name: String,
    routes: Vec<String>,
    cached_paths: Mutex<HashSet<String>>,
}

impl OfflinePageCache {
    pub fn new(
        storage: Arc<dyn CacheStorage>,
        snapshot: Arc<dyn SnapshotSource>,
        config: &ShellConfig,
    ) -> Self {
        Self {
            storage,
            snapshot,
            cache_name: config.cache_name.clone(),
            routes: config.routes.clone(),
            cached_paths: Mutex::new(HashSet::new()),
        }
    }

    pub fn cache_name(&self) -> &str {
        &self.cache_name
    }

    pub fn is_allowlisted(&self, path: &str) -> bool {
        self.routes.iter().any(|r| r == path)
    }

    pub fn is_cached(&self, path: &str) -> bool {
        self.paths().contains(path)
    }

    /// Snapshot the loaded document under `target` if `target` is an
    /// allowlisted path that is currently loaded and not yet cached.
    pub async fn maybe_cache(&self, target: &Url) -> CacheOutcome {
        let path = target.path();

        if !self.is_allowlisted(path) {
            return CacheOutcome::NotAllowlisted;
        }

        {
            let mut paths = self.paths();
            if paths.contains(path) {
                return CacheOutcome::AlreadyCached;
            }

            let loaded = self.snapshot.current_url();
            if loaded.path() != path {
                debug!(target = %target, loaded = %loaded, "Navigation target not loaded yet, skipping snapshot");
                return CacheOutcome::PathMismatch;
            }

            // Claimed before the write: a failed write is not retried this lifetime
            paths.insert(path.to_string());
        }

        let response = StoredResponse::html(self.snapshot.render_snapshot());
        let bytes = response.size_bytes();

        match self
            .storage
            .put(&self.cache_name, target.as_str(), response)
            .await
        {
            Ok(()) => {
                info!(url = %target, bytes, cache = %self.cache_name, "Cached shell page");
                CacheOutcome::Stored
            }
            Err(e) => {
                warn!(url = %target, error = %e, "Failed to cache shell page");
                CacheOutcome::Failed
            }
        }
    }

    /// Navigation-intent handler; `destination` is the raw target URL.
    pub async fn on_navigate(&self, destination: &str) -> CacheOutcome {
        match Url::parse(destination) {
            Ok(url) => self.maybe_cache(&url).await,
            Err(e) => {
                warn!(destination, error = %e, "Ignoring navigation to unparsable URL");
                CacheOutcome::NotAllowlisted
            }
        }
    }

    fn paths(&self) -> std::sync::MutexGuard<'_, HashSet<String>> {
        self.cached_paths.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryCacheStorage;
    use crate::host::HeadlessPage;

    fn setup(at: &str) -> (OfflinePageCache, Arc<MemoryCacheStorage>, HeadlessPage) {
        let storage = Arc::new(MemoryCacheStorage::new());
        let page = HeadlessPage::new(Url::parse(at).unwrap(), "<html>shell</html>");
        let cache = OfflinePageCache::new(
            storage.clone(),
            Arc::new(page.clone()),
            &ShellConfig::default(),
        );
        (cache, storage, page)
    }

    #[tokio::test]
    async fn test_caches_loaded_route_once() {
        let (cache, storage, _page) = setup("https://app.test/");

        assert_eq!(cache.on_navigate("https://app.test/").await, CacheOutcome::Stored);
        assert_eq!(cache.on_navigate("https://app.test/").await, CacheOutcome::AlreadyCached);
        assert_eq!(cache.on_navigate("https://app.test/").await, CacheOutcome::AlreadyCached);

        assert_eq!(storage.keys("lv-pages").await.unwrap(), vec!["https://app.test/"]);
        let stored = storage
            .match_key("lv-pages", "https://app.test/")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.content_type(), Some("text/html"));
        assert_eq!(stored.content_length(), Some("<html>shell</html>".len()));
        assert_eq!(&stored.body[..], b"<html>shell</html>");
    }

    #[tokio::test]
    async fn test_navigation_target_not_yet_loaded() {
        let (cache, storage, _page) = setup("https://app.test/");

        assert_eq!(cache.on_navigate("https://app.test/map").await, CacheOutcome::PathMismatch);
        assert!(!cache.is_cached("/map"));
        assert!(storage.keys("lv-pages").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_non_allowlisted_path_never_written() {
        let (cache, storage, page) = setup("https://app.test/settings");
        page.navigate(Url::parse("https://app.test/settings").unwrap(), "<html/>");

        assert_eq!(
            cache.on_navigate("https://app.test/settings").await,
            CacheOutcome::NotAllowlisted
        );
        // Prefix of an allowlisted route is not a match
        assert_eq!(
            cache.on_navigate("https://app.test/map/extra").await,
            CacheOutcome::NotAllowlisted
        );
        assert!(storage.cache_names().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_storage_failure_is_contained() {
        let storage = Arc::new(MemoryCacheStorage::with_quota(4));
        let page = HeadlessPage::new(Url::parse("https://app.test/map").unwrap(), "<html>too big</html>");
        let cache = OfflinePageCache::new(storage.clone(), Arc::new(page), &ShellConfig::default());

        assert_eq!(cache.on_navigate("https://app.test/map").await, CacheOutcome::Failed);
        // Claimed even though the write failed
        assert_eq!(cache.on_navigate("https://app.test/map").await, CacheOutcome::AlreadyCached);
    }

    #[tokio::test]
    async fn test_unparsable_destination_ignored() {
        let (cache, _storage, _page) = setup("https://app.test/");
        assert_eq!(cache.on_navigate("not a url").await, CacheOutcome::NotAllowlisted);
    }
}
