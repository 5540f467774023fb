//! Collaborative document - Automerge-backed shared state
//!
//! A single document exposes three named map sub-stores (`airports`,
//! `selection`, `flight`). Each key holds a JSON-encoded value and merges
//! last-writer-wins per key. Observers fire on every local or remote
//! mutation of the store they watch.

pub mod doc;
pub mod store;

// Re-exports
pub use doc::{ChangeOrigin, CollabDocument, MapChange, MapRef, Store, Subscription};
pub use store::DocumentStore;
