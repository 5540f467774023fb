//! Background worker
//!
//! Page side: registration and lifecycle tracking. Worker side: request
//! routing, runtime caching strategies and the install-time precache.

pub mod lifecycle;
pub mod precache;
pub mod router;
pub mod runtime;
pub mod strategy;

// Re-exports
pub use lifecycle::{
    InProcessContainer, NoWorkerSupport, RegistrationOptions, ServiceWorkerLifecycle,
    WorkerContainer, WorkerRegistrationState,
};
pub use precache::{InstallReport, PrecacheController};
pub use router::{Route, RouteMatcher, Router};
pub use runtime::{WorkerPhase, WorkerRuntime};
pub use strategy::{CacheFirst, Fetcher, HttpFetcher, NetworkFirst, Strategy, WorkerRequest};
