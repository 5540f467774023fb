//! Connectivity monitoring
//!
//! Owns the `Checking → {Online, Offline}` state machine:
//! - one liveness probe at startup sets the initial state
//! - backoff polling re-probes while the network is in doubt
//! - every settled transition (Online ⇄ Offline) triggers exactly one reload

pub mod monitor;
pub mod probe;
pub mod state;

// Re-exports
pub use monitor::ConnectivityMonitor;
pub use probe::{HttpProbe, LivenessProbe, ScriptedProbe};
pub use state::{backoff_interval, ConnectionState, ConnectionStatus, StatusIndicator, Transition};
