//! Connection state and backoff arithmetic

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Largest exponent honoured by [`backoff_interval`], whatever the configured cap.
const MAX_SHIFT: u32 = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    Checking,
    Online,
    Offline,
}

impl ConnectionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionStatus::Checking => "checking",
            ConnectionStatus::Online => "online",
            ConnectionStatus::Offline => "offline",
        }
    }
}

impl std::fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A change of status caused by a probe or a browser signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub from: ConnectionStatus,
    pub to: ConnectionStatus,
}

impl Transition {
    /// Leaving `Checking` is the initial settlement, not a regime change.
    pub fn requires_reload(&self) -> bool {
        self.from != ConnectionStatus::Checking
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionState {
    pub status: ConnectionStatus,
    /// Last time the server was confirmed reachable
    pub last_seen: Option<DateTime<Utc>>,
    /// Polling ticks so far, capped; never reset within a page lifetime
    pub retry_count: u32,
}

impl Default for ConnectionState {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionState {
    pub fn new() -> Self {
        Self {
            status: ConnectionStatus::Checking,
            last_seen: None,
            retry_count: 0,
        }
    }

    pub fn is_online(&self) -> bool {
        self.status == ConnectionStatus::Online
    }

    /// Record a reachability observation.
    pub fn observe(&mut self, reachable: bool, now: DateTime<Utc>) -> Option<Transition> {
        let to = if reachable {
            self.last_seen = Some(now);
            ConnectionStatus::Online
        } else {
            ConnectionStatus::Offline
        };
        self.set_status(to)
    }

    pub fn set_status(&mut self, to: ConnectionStatus) -> Option<Transition> {
        let from = self.status;
        if from == to {
            return None;
        }
        self.status = to;
        Some(Transition { from, to })
    }

    /// Count one polling tick, saturating at `cap`.
    pub fn record_tick(&mut self, cap: u32) {
        self.retry_count = (self.retry_count + 1).min(cap);
    }
}

/// `base * 2^min(retry_count, cap)`
pub fn backoff_interval(base: Duration, retry_count: u32, cap: u32) -> Duration {
    let exponent = retry_count.min(cap).min(MAX_SHIFT);
    base.saturating_mul(1u32 << exponent)
}

/// Presentation of the connection state for the host's status badge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatusIndicator {
    pub status: ConnectionStatus,
    pub last_seen: String,
    pub icon: &'static str,
    pub pulse: bool,
    pub grayscale: bool,
    pub title: String,
}

impl From<&ConnectionState> for StatusIndicator {
    fn from(state: &ConnectionState) -> Self {
        let last_seen = state
            .last_seen
            .map(|t| t.to_rfc3339())
            .unwrap_or_else(|| "Never".to_string());
        Self {
            status: state.status,
            icon: if state.is_online() {
                "/images/online.svg"
            } else {
                "/images/offline.svg"
            },
            pulse: state.status == ConnectionStatus::Checking,
            grayscale: state.status == ConnectionStatus::Offline,
            title: format!(
                "{} - Last seen: {}",
                state.status.as_str().to_uppercase(),
                last_seen
            ),
            last_seen,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles_until_cap() {
        let base = Duration::from_millis(5000);
        let intervals: Vec<u64> = (0..8)
            .map(|n| backoff_interval(base, n, 5).as_millis() as u64)
            .collect();
        assert_eq!(
            intervals,
            vec![5000, 10000, 20000, 40000, 80000, 160000, 160000, 160000]
        );
    }

    #[test]
    fn test_backoff_never_overflows() {
        let d = backoff_interval(Duration::from_secs(u64::MAX / 2), 40, 40);
        assert_eq!(d, Duration::MAX);
    }

    #[test]
    fn test_retry_count_saturates() {
        let mut state = ConnectionState::new();
        for _ in 0..10 {
            state.record_tick(5);
        }
        assert_eq!(state.retry_count, 5);
    }

    #[test]
    fn test_initial_settlement_does_not_require_reload() {
        let mut state = ConnectionState::new();
        let t = state.observe(true, Utc::now()).unwrap();
        assert_eq!(t.from, ConnectionStatus::Checking);
        assert!(!t.requires_reload());

        assert!(state.observe(true, Utc::now()).is_none());

        let t = state.observe(false, Utc::now()).unwrap();
        assert!(t.requires_reload());
        assert_eq!(state.status, ConnectionStatus::Offline);
    }

    #[test]
    fn test_last_seen_only_moves_on_reachable() {
        let mut state = ConnectionState::new();
        let seen = Utc::now();
        state.observe(true, seen);
        state.observe(false, seen + chrono::Duration::seconds(10));
        assert_eq!(state.last_seen, Some(seen));
    }

    #[test]
    fn test_indicator_for_checking_state() {
        let indicator = StatusIndicator::from(&ConnectionState::new());
        assert!(indicator.pulse);
        assert!(!indicator.grayscale);
        assert_eq!(indicator.icon, "/images/offline.svg");
        assert_eq!(indicator.title, "CHECKING - Last seen: Never");
    }

    #[test]
    fn test_indicator_for_offline_state() {
        let mut state = ConnectionState::new();
        state.observe(false, Utc::now());
        let indicator = StatusIndicator::from(&state);
        assert!(indicator.grayscale);
        assert!(!indicator.pulse);
    }
}
