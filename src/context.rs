//! Application context
//!
//! Owns the connectivity monitor, the offline page cache, the worker
//! lifecycle and a handle to the collaborative document, and drives them
//! through `init` and `teardown`. Hosts build one per page load and hand it
//! down instead of relying on globals.

use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

use crate::cache::CacheStorage;
use crate::config::Config;
use crate::connectivity::{ConnectionStatus, ConnectivityMonitor, LivenessProbe, StatusIndicator};
use crate::document::{CollabDocument, Store};
use crate::error::StorageError;
use crate::events::{LiveSessionParams, WorkerLifecycleEvent};
use crate::host::{PageMetadata, Reloader, SnapshotSource};
use crate::page_cache::{CacheOutcome, OfflinePageCache};
use crate::selection::{FlightRecord, Location, SelectionBridge, SelectionRecord};
use crate::worker::{ServiceWorkerLifecycle, WorkerContainer, WorkerRegistrationState};

/// What to render when the server is unreachable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DegradedView {
    /// Map and selection form, fed from the local document
    MapAndForm,
    /// Stock view, fed from the local document
    Stock,
    /// Nothing renderable offline at this path
    Unavailable,
}

impl DegradedView {
    pub fn for_path(path: &str) -> Self {
        match path {
            "/map" => DegradedView::MapAndForm,
            "/" => DegradedView::Stock,
            _ => DegradedView::Unavailable,
        }
    }
}

/// Document data the degraded views render from.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LocalSnapshot {
    pub candidates: Vec<Location>,
    pub selections: Vec<SelectionRecord>,
    pub flight: Option<FlightRecord>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShellMode {
    /// Connected to the live session
    Live(LiveSessionParams),
    /// Rendering locally
    Degraded(DegradedView),
}

/// Capabilities the host page provides.
#[derive(Clone)]
pub struct ShellHost {
    pub page: Arc<dyn SnapshotSource>,
    pub metadata: Arc<dyn PageMetadata>,
    pub reloader: Arc<dyn Reloader>,
    pub workers: Arc<dyn WorkerContainer>,
}

pub struct ShellContext {
    config: Config,
    host: ShellHost,
    monitor: ConnectivityMonitor,
    page_cache: OfflinePageCache,
    worker: ServiceWorkerLifecycle,
    document: CollabDocument,
    mode: Mutex<Option<ShellMode>>,
}

impl ShellContext {
    pub fn new(
        config: Config,
        host: ShellHost,
        probe: Arc<dyn LivenessProbe>,
        storage: Arc<dyn CacheStorage>,
        document: CollabDocument,
    ) -> Self {
        let monitor = ConnectivityMonitor::new(probe, host.reloader.clone(), &config.connectivity);
        let page_cache = OfflinePageCache::new(storage, host.page.clone(), &config.shell);
        let worker = ServiceWorkerLifecycle::new(host.workers.clone(), host.reloader.clone(), &config.worker);
        Self {
            config,
            host,
            monitor,
            page_cache,
            worker,
            document,
            mode: Mutex::new(None),
        }
    }

    /// Page load: probe once, pick the mode, register the worker, snapshot
    /// the initial page when online and start polling when offline.
    pub async fn init(&self) -> ShellMode {
        let status = self.monitor.check_initial().await;
        let current = self.host.page.current_url();

        let mode = match status {
            ConnectionStatus::Online => {
                match LiveSessionParams::from_page(self.host.metadata.as_ref(), &self.config.live) {
                    Ok(params) => ShellMode::Live(params),
                    Err(e) => {
                        warn!(error = %e, "Cannot start live session, rendering locally");
                        ShellMode::Degraded(DegradedView::for_path(current.path()))
                    }
                }
            }
            _ => ShellMode::Degraded(DegradedView::for_path(current.path())),
        };
        info!(status = %status, path = current.path(), mode = ?mode, "Shell initialised");

        self.worker.register().await;

        if status == ConnectionStatus::Online {
            let outcome = self.page_cache.maybe_cache(&current).await;
            debug!(?outcome, "Initial page snapshot");
        } else {
            self.monitor.start_default_polling();
        }

        *self.lock_mode() = Some(mode.clone());
        mode
    }

    /// Stop polling and flush the document.
    pub fn teardown(&self) {
        self.monitor.stop_polling();
        self.document.flush();
        info!("Shell torn down");
    }

    pub fn mode(&self) -> Option<ShellMode> {
        self.lock_mode().clone()
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn monitor(&self) -> &ConnectivityMonitor {
        &self.monitor
    }

    pub fn page_cache(&self) -> &OfflinePageCache {
        &self.page_cache
    }

    pub fn worker(&self) -> &ServiceWorkerLifecycle {
        &self.worker
    }

    pub fn document(&self) -> &CollabDocument {
        &self.document
    }

    /// A new selection binding on the shared document, already mounted.
    pub fn selection_bridge(&self, user_id: &str) -> SelectionBridge {
        let bridge = SelectionBridge::new(self.document.clone(), user_id, &self.config.selection);
        bridge.mount();
        bridge
    }

    /// Read the local document for offline rendering.
    pub fn local_snapshot(&self) -> Result<LocalSnapshot, StorageError> {
        let candidates = self
            .document
            .map(Store::Airports)
            .values::<Vec<Location>>()?
            .into_iter()
            .next()
            .unwrap_or_default();
        let mut selections = self.document.map(Store::Selection).values::<SelectionRecord>()?;
        selections.sort_by_key(|r| r.input_type);

        Ok(LocalSnapshot {
            candidates,
            selections,
            flight: self.document.map(Store::Flight).get("flight")?,
        })
    }

    pub async fn indicator(&self) -> StatusIndicator {
        StatusIndicator::from(&self.monitor.state().await)
    }

    pub async fn on_navigate(&self, destination: &str) -> CacheOutcome {
        self.page_cache.on_navigate(destination).await
    }

    pub async fn on_online(&self) {
        self.monitor.handle_online().await;
    }

    pub async fn on_offline(&self) {
        self.monitor.handle_offline().await;
    }

    pub fn on_worker_event(&self, event: WorkerLifecycleEvent) {
        self.worker.handle_event(event);
    }

    pub fn worker_state(&self) -> WorkerRegistrationState {
        self.worker.state()
    }

    fn lock_mode(&self) -> std::sync::MutexGuard<'_, Option<ShellMode>> {
        self.mode.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Drop for ShellContext {
    fn drop(&mut self) {
        self.monitor.stop_polling();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryCacheStorage;
    use crate::connectivity::ScriptedProbe;
    use crate::host::{CountingReloader, HeadlessPage};
    use crate::worker::NoWorkerSupport;
    use url::Url;

    struct Harness {
        ctx: ShellContext,
        storage: Arc<MemoryCacheStorage>,
        reloader: CountingReloader,
    }

    fn harness(at: &str, reachable: Vec<bool>, csrf: bool) -> Harness {
        let page = HeadlessPage::new(Url::parse(at).unwrap(), "<html>app</html>");
        if csrf {
            page.set_meta("csrf-token", "secret");
        }
        let reloader = CountingReloader::new();
        let storage = Arc::new(MemoryCacheStorage::new());
        let host = ShellHost {
            page: Arc::new(page.clone()),
            metadata: Arc::new(page),
            reloader: Arc::new(reloader.clone()),
            workers: Arc::new(NoWorkerSupport),
        };
        let ctx = ShellContext::new(
            Config::default(),
            host,
            Arc::new(ScriptedProbe::new(reachable)),
            storage.clone(),
            CollabDocument::new(),
        );
        Harness { ctx, storage, reloader }
    }

    #[test]
    fn test_degraded_view_per_path() {
        assert_eq!(DegradedView::for_path("/map"), DegradedView::MapAndForm);
        assert_eq!(DegradedView::for_path("/"), DegradedView::Stock);
        assert_eq!(DegradedView::for_path("/settings"), DegradedView::Unavailable);
    }

    #[tokio::test]
    async fn test_online_init_goes_live_and_snapshots() {
        let h = harness("https://app.test/map", vec![true], true);

        let mode = h.ctx.init().await;
        match mode {
            ShellMode::Live(params) => assert_eq!(params.csrf_token, "secret"),
            other => panic!("expected live mode, got {other:?}"),
        }
        assert!(!h.ctx.monitor().is_polling());
        assert_eq!(
            h.storage.keys("lv-pages").await.unwrap(),
            vec!["https://app.test/map"]
        );
        assert_eq!(h.reloader.count(), 0);
    }

    #[tokio::test]
    async fn test_offline_init_degrades_and_polls() {
        let h = harness("https://app.test/", vec![false], true);

        assert_eq!(h.ctx.init().await, ShellMode::Degraded(DegradedView::Stock));
        assert!(h.ctx.monitor().is_polling());
        assert!(h.storage.cache_names().await.unwrap().is_empty());

        let indicator = h.ctx.indicator().await;
        assert!(indicator.grayscale);
        assert_eq!(indicator.last_seen, "Never");

        h.ctx.teardown();
        assert!(!h.ctx.monitor().is_polling());
    }

    #[tokio::test]
    async fn test_missing_csrf_falls_back_to_local_render() {
        let h = harness("https://app.test/map", vec![true], false);
        assert_eq!(
            h.ctx.init().await,
            ShellMode::Degraded(DegradedView::MapAndForm)
        );
        assert_eq!(h.ctx.mode(), Some(ShellMode::Degraded(DegradedView::MapAndForm)));
    }

    #[tokio::test]
    async fn test_offline_render_reads_document() {
        let h = harness("https://app.test/map", vec![false], true);
        let bridge = h.ctx.selection_bridge("u-1");
        bridge.on_airports(vec![Location::new("Oslo", "Norway", 60.19, 11.1)]);
        bridge.handle_select(Location::new("Oslo", "Norway", 60.19, 11.1), crate::InputType::Arrival);

        assert_eq!(h.ctx.init().await, ShellMode::Degraded(DegradedView::MapAndForm));
        let snapshot = h.ctx.local_snapshot().unwrap();
        assert_eq!(snapshot.candidates.len(), 1);
        assert_eq!(snapshot.selections.len(), 1);
        assert_eq!(snapshot.flight, None);
        h.ctx.teardown();
    }

    #[tokio::test]
    async fn test_unsupported_worker_does_not_block_init() {
        let h = harness("https://app.test/", vec![true], true);
        h.ctx.init().await;
        assert_eq!(h.ctx.worker_state(), WorkerRegistrationState::default());
    }
}
