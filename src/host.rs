//! Host capabilities
//!
//! The resilience layer never reaches into page globals. Whatever runs it
//! (a browser binding, a native shell, a test harness) supplies these
//! capabilities explicitly.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use url::Url;

/// Full page reload, used to re-bootstrap the app after a connectivity change.
pub trait Reloader: Send + Sync {
    fn reload(&self);
}

/// The current renderable document, pulled on demand.
pub trait SnapshotSource: Send + Sync {
    /// URL of the document that is currently loaded
    fn current_url(&self) -> Url;

    /// Full serialized markup of the rendered document
    fn render_snapshot(&self) -> String;
}

/// Read access to `<meta name=... content=...>` page metadata.
pub trait PageMetadata: Send + Sync {
    fn meta_content(&self, name: &str) -> Option<String>;
}

/// Reloader that only counts invocations.
#[derive(Debug, Default, Clone)]
pub struct CountingReloader {
    count: Arc<AtomicUsize>,
}

impl CountingReloader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn count(&self) -> usize {
        self.count.load(Ordering::SeqCst)
    }
}

impl Reloader for CountingReloader {
    fn reload(&self) {
        let n = self.count.fetch_add(1, Ordering::SeqCst) + 1;
        tracing::info!(reloads = n, "Page reload requested");
    }
}

#[derive(Debug)]
struct PageState {
    url: Url,
    html: String,
    meta: HashMap<String, String>,
}

/// In-memory page used by headless hosts: a current URL, its rendered
/// markup and its metadata tags.
#[derive(Debug, Clone)]
pub struct HeadlessPage {
    state: Arc<Mutex<PageState>>,
}

impl HeadlessPage {
    pub fn new(url: Url, html: impl Into<String>) -> Self {
        Self {
            state: Arc::new(Mutex::new(PageState {
                url,
                html: html.into(),
                meta: HashMap::new(),
            })),
        }
    }

    /// Simulate the browser finishing a navigation.
    pub fn navigate(&self, url: Url, html: impl Into<String>) {
        let mut state = self.lock();
        state.url = url;
        state.html = html.into();
    }

    pub fn set_meta(&self, name: impl Into<String>, content: impl Into<String>) {
        self.lock().meta.insert(name.into(), content.into());
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, PageState> {
        // A poisoned page only means a panicking reader; the data is still valid.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl SnapshotSource for HeadlessPage {
    fn current_url(&self) -> Url {
        self.lock().url.clone()
    }

    fn render_snapshot(&self) -> String {
        self.lock().html.clone()
    }
}

impl PageMetadata for HeadlessPage {
    fn meta_content(&self, name: &str) -> Option<String> {
        self.lock().meta.get(name).cloned()
    }
}
