//! Background worker runtime
//!
//! Wires the precache and the runtime caching routes the application uses,
//! and answers install, activate, fetch and message events.

use http::Method;
use regex::Regex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info, warn};
use url::Url;

use super::precache::{InstallReport, PrecacheController};
use super::router::{same_origin, RouteMatcher, Router};
use super::strategy::{CacheFirst, Fetcher, NetworkFirst, WorkerRequest};
use crate::cache::{CacheStorage, ExpirationPolicy, StoredResponse};
use crate::config::WorkerConfig;
use crate::error::{DecodeError, Error, FetchError};
use crate::events::WorkerMessage;

pub const DYNAMIC_ROUTES_CACHE: &str = "dynamic-routes";
pub const FONTS_CACHE: &str = "google-fonts-cache";
pub const IMAGES_CACHE: &str = "images";

const FONTS_PATTERN: &str = r"(?i)^https://fonts\.googleapis\.com/.*";
const IMAGES_PATTERN: &str = r"\.(?:png|jpg|jpeg|svg|gif)$";
const DAY: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerPhase {
    Parsed,
    Installed,
    Activated,
}

pub struct WorkerRuntime {
    router: Router,
    precache: Arc<PrecacheController>,
    phase: Mutex<WorkerPhase>,
    clients_claimed: AtomicBool,
}

impl WorkerRuntime {
    /// Worker for `origin` with the default route table:
    /// precache, then `dynamic-routes` for same-origin non-asset paths,
    /// then fonts and images.
    pub fn new(
        origin: Url,
        config: &WorkerConfig,
        storage: Arc<dyn CacheStorage>,
        fetcher: Arc<dyn Fetcher>,
    ) -> Result<Self, Error> {
        let mut precache =
            PrecacheController::new(origin.clone(), &config.scope, storage.clone(), fetcher.clone());
        precache.add_to_cache_list(&config.precache)?;
        let precache = Arc::new(precache);

        let mut router = Router::new(origin);

        let ctrl = precache.clone();
        router.register_route(
            RouteMatcher::predicate(move |request, _| ctrl.matches(request)),
            Method::GET,
            precache.clone(),
        );

        router.register_route(
            RouteMatcher::predicate(|request, origin| {
                same_origin(&request.url, origin) && !request.url.path().starts_with("/assets/")
            }),
            Method::GET,
            Arc::new(
                NetworkFirst::new(DYNAMIC_ROUTES_CACHE, storage.clone(), fetcher.clone())
                    .with_network_timeout(config.network_timeout()),
            ),
        );

        router.register_route(
            RouteMatcher::Regex(compile(FONTS_PATTERN)?),
            Method::GET,
            Arc::new(
                CacheFirst::new(FONTS_CACHE, storage.clone(), fetcher.clone())
                    .with_expiration(ExpirationPolicy::new(10, DAY * 365)),
            ),
        );

        router.register_route(
            RouteMatcher::Regex(compile(IMAGES_PATTERN)?),
            Method::GET,
            Arc::new(
                CacheFirst::new(IMAGES_CACHE, storage, fetcher)
                    .with_expiration(ExpirationPolicy::new(50, DAY * 30)),
            ),
        );

        Ok(Self {
            router,
            precache,
            phase: Mutex::new(WorkerPhase::Parsed),
            clients_claimed: AtomicBool::new(false),
        })
    }

    pub fn router(&self) -> &Router {
        &self.router
    }

    pub fn precache(&self) -> &PrecacheController {
        &self.precache
    }

    pub fn phase(&self) -> WorkerPhase {
        *self.lock_phase()
    }

    pub fn clients_claimed(&self) -> bool {
        self.clients_claimed.load(Ordering::SeqCst)
    }

    /// Fill the precache. The new worker skips waiting, so a successful
    /// install is followed directly by activation.
    pub async fn install(&self) -> Result<InstallReport, Error> {
        let report = self.precache.install().await?;
        *self.lock_phase() = WorkerPhase::Installed;
        Ok(report)
    }

    /// Drop stale precache entries and older precaches, then take control
    /// of open pages.
    pub async fn activate(&self) -> Result<(), Error> {
        self.precache.activate().await?;
        self.precache.cleanup_outdated_caches().await?;
        *self.lock_phase() = WorkerPhase::Activated;
        self.clients_claimed.store(true, Ordering::SeqCst);
        info!(cache = self.precache.cache_name(), "Worker activated, clients claimed");
        Ok(())
    }

    /// `None` lets the host fetch the request itself.
    pub async fn on_fetch(
        &self,
        request: &WorkerRequest,
    ) -> Option<Result<StoredResponse, FetchError>> {
        self.router.handle_request(request).await
    }

    pub async fn on_message(&self, message: &WorkerMessage) {
        match message {
            WorkerMessage::CacheUrls { urls_to_cache } => {
                let warmed = self.router.cache_urls(urls_to_cache).await;
                debug!(requested = urls_to_cache.len(), warmed, "Handled CACHE_URLS");
            }
            WorkerMessage::SkipWaiting => {
                // Installation already skips waiting
                debug!(phase = ?self.phase(), "SKIP_WAITING received");
            }
        }
    }

    /// Decode and dispatch a raw message payload.
    pub async fn on_raw_message(&self, payload: &serde_json::Value) {
        match WorkerMessage::decode(payload) {
            Ok(message) => self.on_message(&message).await,
            Err(e) => warn!(error = %e, "Ignoring worker message"),
        }
    }

    fn lock_phase(&self) -> std::sync::MutexGuard<'_, WorkerPhase> {
        self.phase.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn compile(pattern: &str) -> Result<Regex, DecodeError> {
    Regex::new(pattern).map_err(|e| DecodeError::Pattern {
        pattern: pattern.to_string(),
        reason: e.to_string(),
    })
}
