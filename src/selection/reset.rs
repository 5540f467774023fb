//! One-shot reset signal
//!
//! After a reset the signal stays raised for the debounce window so that
//! mounted widgets can clear their own visual state, then drops back on
//! the next tick. Nothing is left raised that could suppress a later
//! selection.

use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetState {
    Idle,
    Pending { expiry: Instant },
}

#[derive(Debug, Clone)]
pub struct ResetSignal {
    state: ResetState,
    debounce: Duration,
}

impl ResetSignal {
    pub fn new(debounce: Duration) -> Self {
        Self {
            state: ResetState::Idle,
            debounce,
        }
    }

    pub fn state(&self) -> ResetState {
        self.state
    }

    /// Raise the signal. A second trigger extends the window.
    pub fn trigger(&mut self, now: Instant) {
        self.state = ResetState::Pending {
            expiry: now + self.debounce,
        };
    }

    /// Clear an expired signal. Returns true when this tick cleared it.
    pub fn tick(&mut self, now: Instant) -> bool {
        match self.state {
            ResetState::Pending { expiry } if now >= expiry => {
                self.state = ResetState::Idle;
                true
            }
            _ => false,
        }
    }

    pub fn is_active(&self, now: Instant) -> bool {
        matches!(self.state, ResetState::Pending { expiry } if now < expiry)
    }

    pub fn expiry(&self) -> Option<Instant> {
        match self.state {
            ResetState::Pending { expiry } => Some(expiry),
            ResetState::Idle => None,
        }
    }

    /// Drop the signal immediately, e.g. on teardown.
    pub fn cancel(&mut self) {
        self.state = ResetState::Idle;
    }
}
