//! offline-shell: client-side resilience layer for a mostly-offline web app
//!
//! Keeps a page usable when the network is unreliable:
//! - Connectivity monitoring (liveness probe, backoff polling, reload on transition)
//! - Offline shell caching (snapshot allowlisted routes once per page lifetime)
//! - Background worker lifecycle, routing and precache
//! - Collaborative selection state shared through an Automerge document
//!
//! Host integration (reload, rendered snapshot, worker container, network,
//! server-push transport) is expressed as traits in [`host`], so the same
//! logic runs in a browser host or a headless harness.
//!
//! ```text
//!   ┌───────────────┐   probe    ┌──────────────────────┐
//!   │ ShellContext  │──────────►│ ConnectivityMonitor   │──reload──► Host
//!   │  init/teardown│           └──────────────────────┘
//!   │               │ navigate   ┌──────────────────────┐
//!   │               │──────────►│ OfflinePageCache      │──put────► CacheStorage
//!   │               │           └──────────────────────┘
//!   │               │            ┌──────────────────────┐
//!   │               │──────────►│ WorkerLifecycle       │
//!   └──────┬────────┘           └──────────────────────┘
//!          │ document handle     ┌──────────────────────┐
//!          └───────────────────►│ SelectionBridge ×N    │──set/observe──► CollabDocument
//!                               └──────────────────────┘
//! ```

pub mod cache;
pub mod config;
pub mod connectivity;
pub mod context;
pub mod document;
pub mod error;
pub mod events;
pub mod host;
pub mod logging;
pub mod page_cache;
pub mod selection;
pub mod worker;

// Re-exports
pub use config::Config;
pub use connectivity::{ConnectionState, ConnectionStatus, ConnectivityMonitor};
pub use context::{DegradedView, LocalSnapshot, ShellContext, ShellHost, ShellMode};
pub use document::{ChangeOrigin, CollabDocument, MapChange};
pub use error::{Error, ErrorClass};
pub use page_cache::{CacheOutcome, OfflinePageCache};
pub use selection::{FlightRecord, InputType, Location, SelectionBridge, SelectionRecord};
pub use worker::{ServiceWorkerLifecycle, WorkerRegistrationState};
