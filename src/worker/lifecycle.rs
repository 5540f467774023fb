//! Page-side worker lifecycle
//!
//! Registers the background worker once per page load and tracks whether
//! it is registered and controlling the page. Registration failure only
//! disables offline support; it is logged and never escalated.

use async_trait::async_trait;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, watch};
use tracing::{debug, error, info, warn};

use super::runtime::WorkerRuntime;
use crate::config::{UpdateViaCache, WorkerConfig};
use crate::error::RegistrationError;
use crate::events::WorkerLifecycleEvent;
use crate::host::Reloader;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct WorkerRegistrationState {
    pub registered: bool,
    pub controlling: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistrationOptions {
    pub scope: String,
    pub update_via_cache: UpdateViaCache,
}

/// Host-side worker registration facility.
#[async_trait]
pub trait WorkerContainer: Send + Sync {
    fn is_supported(&self) -> bool;

    async fn register(
        &self,
        script_url: &str,
        options: &RegistrationOptions,
    ) -> Result<(), RegistrationError>;
}

/// Container running the worker in-process: registering installs and
/// activates the runtime directly.
pub struct InProcessContainer {
    runtime: Arc<WorkerRuntime>,
}

impl InProcessContainer {
    pub fn new(runtime: Arc<WorkerRuntime>) -> Self {
        Self { runtime }
    }

    pub fn runtime(&self) -> &Arc<WorkerRuntime> {
        &self.runtime
    }
}

#[async_trait]
impl WorkerContainer for InProcessContainer {
    fn is_supported(&self) -> bool {
        true
    }

    async fn register(
        &self,
        script_url: &str,
        options: &RegistrationOptions,
    ) -> Result<(), RegistrationError> {
        let failed = |e: crate::error::Error| RegistrationError::Failed {
            script_url: script_url.to_string(),
            reason: e.to_string(),
        };
        debug!(script_url, scope = %options.scope, "Installing in-process worker");
        self.runtime.install().await.map_err(failed)?;
        self.runtime.activate().await.map_err(failed)?;
        Ok(())
    }
}

/// Host without background worker support.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoWorkerSupport;

#[async_trait]
impl WorkerContainer for NoWorkerSupport {
    fn is_supported(&self) -> bool {
        false
    }

    async fn register(&self, _: &str, _: &RegistrationOptions) -> Result<(), RegistrationError> {
        Err(RegistrationError::Unsupported)
    }
}

pub struct ServiceWorkerLifecycle {
    container: Arc<dyn WorkerContainer>,
    reloader: Arc<dyn Reloader>,
    config: WorkerConfig,
    state: watch::Sender<WorkerRegistrationState>,
    events: broadcast::Sender<WorkerLifecycleEvent>,
    attempted: AtomicBool,
    reloaded: AtomicBool,
}

impl ServiceWorkerLifecycle {
    pub fn new(
        container: Arc<dyn WorkerContainer>,
        reloader: Arc<dyn Reloader>,
        config: &WorkerConfig,
    ) -> Self {
        let (state, _) = watch::channel(WorkerRegistrationState::default());
        let (events, _) = broadcast::channel(16);
        Self {
            container,
            reloader,
            config: config.clone(),
            state,
            events,
            attempted: AtomicBool::new(false),
            reloaded: AtomicBool::new(false),
        }
    }

    pub fn state(&self) -> WorkerRegistrationState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<WorkerRegistrationState> {
        self.state.subscribe()
    }

    /// Lifecycle signals, for "new version available" messaging.
    pub fn subscribe(&self) -> broadcast::Receiver<WorkerLifecycleEvent> {
        self.events.subscribe()
    }

    /// Register the configured worker. Attempted once per page load;
    /// later calls return the current state.
    pub async fn register(&self) -> WorkerRegistrationState {
        if self.attempted.swap(true, Ordering::SeqCst) {
            debug!("Worker registration already attempted");
            return self.state();
        }

        if !self.container.is_supported() {
            warn!(error = %RegistrationError::Unsupported, "Offline support disabled");
            return self.state();
        }

        let options = RegistrationOptions {
            scope: self.config.scope.clone(),
            update_via_cache: self.config.update_via_cache,
        };

        match self.container.register(&self.config.script_url, &options).await {
            Ok(()) => {
                self.state.send_modify(|s| s.registered = true);
                info!(script_url = %self.config.script_url, scope = %options.scope, "Worker registered");
            }
            Err(e) => {
                error!(script_url = %self.config.script_url, error = %e, "Worker registration failed, offline support disabled");
            }
        }
        self.state()
    }

    pub fn handle_event(&self, event: WorkerLifecycleEvent) {
        match event {
            WorkerLifecycleEvent::UpdateFound => {
                info!("New worker version installing");
            }
            WorkerLifecycleEvent::ControllerChange => {
                self.state.send_modify(|s| s.controlling = true);
                info!("New worker took control");
                if self.config.reload_on_controller_change
                    && !self.reloaded.swap(true, Ordering::SeqCst)
                {
                    self.reloader.reload();
                }
            }
        }
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    /// Raw event name from the host.
    pub fn handle_event_name(&self, name: &str) {
        match name.parse::<WorkerLifecycleEvent>() {
            Ok(event) => self.handle_event(event),
            Err(e) => debug!(error = %e, "Ignoring worker event"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::CountingReloader;
    use std::sync::atomic::AtomicUsize;

    struct FlakyContainer {
        calls: AtomicUsize,
        fail: bool,
    }

    #[async_trait]
    impl WorkerContainer for FlakyContainer {
        fn is_supported(&self) -> bool {
            true
        }

        async fn register(&self, script_url: &str, options: &RegistrationOptions) -> Result<(), RegistrationError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            assert_eq!(options.update_via_cache, UpdateViaCache::None);
            if self.fail {
                return Err(RegistrationError::Failed {
                    script_url: script_url.to_string(),
                    reason: "SecurityError".into(),
                });
            }
            Ok(())
        }
    }

    fn lifecycle(fail: bool, config: WorkerConfig) -> (ServiceWorkerLifecycle, Arc<FlakyContainer>, CountingReloader) {
        let container = Arc::new(FlakyContainer {
            calls: AtomicUsize::new(0),
            fail,
        });
        let reloader = CountingReloader::new();
        let lc = ServiceWorkerLifecycle::new(container.clone(), Arc::new(reloader.clone()), &config);
        (lc, container, reloader)
    }

    #[tokio::test]
    async fn test_register_once() {
        let (lc, container, _) = lifecycle(false, WorkerConfig::default());
        assert!(lc.register().await.registered);
        assert!(lc.register().await.registered);
        assert_eq!(container.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failure_is_not_retried() {
        let (lc, container, _) = lifecycle(true, WorkerConfig::default());
        assert!(!lc.register().await.registered);
        assert!(!lc.register().await.registered);
        assert_eq!(container.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_unsupported_host() {
        let lc = ServiceWorkerLifecycle::new(
            Arc::new(NoWorkerSupport),
            Arc::new(CountingReloader::new()),
            &WorkerConfig::default(),
        );
        assert_eq!(lc.register().await, WorkerRegistrationState::default());
    }

    #[tokio::test]
    async fn test_update_found_is_surfaced_only() {
        let (lc, _, reloader) = lifecycle(false, WorkerConfig::default());
        let mut events = lc.subscribe();

        lc.handle_event_name("updatefound");
        assert_eq!(events.recv().await.unwrap(), WorkerLifecycleEvent::UpdateFound);
        assert!(!lc.state().controlling);
        assert_eq!(reloader.count(), 0);
    }

    #[test]
    fn test_controller_change_reloads_once_when_enabled() {
        let config = WorkerConfig {
            reload_on_controller_change: true,
            ..WorkerConfig::default()
        };
        let (lc, _, reloader) = lifecycle(false, config);

        lc.handle_event(WorkerLifecycleEvent::ControllerChange);
        lc.handle_event(WorkerLifecycleEvent::ControllerChange);
        assert!(lc.state().controlling);
        assert_eq!(reloader.count(), 1);
    }

    #[test]
    fn test_controller_change_without_reload_policy() {
        let (lc, _, reloader) = lifecycle(false, WorkerConfig::default());
        lc.handle_event(WorkerLifecycleEvent::ControllerChange);
        assert!(lc.state().controlling);
        assert_eq!(reloader.count(), 0);
    }
}
