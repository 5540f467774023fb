//! Collaborative selection
//!
//! Departure/arrival pickers share their selections through the
//! collaborative document and derive a flight once both are present.

pub mod bridge;
pub mod model;
pub mod reset;

// Re-exports
pub use bridge::SelectionBridge;
pub use model::{FlightRecord, InputType, Location, SelectionRecord};
pub use reset::{ResetSignal, ResetState};
