//! Connectivity monitor - probing, backoff polling and reload policy
//!
//! Only this type mutates [`ConnectionState`]. Polling runs as a spawned
//! task that sleeps `base * 2^min(retry_count, cap)` between probes and is
//! cancelled through a shutdown channel; starting always cancels first, so
//! at most one poller exists.

use chrono::Utc;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::probe::LivenessProbe;
use super::state::{backoff_interval, ConnectionState, ConnectionStatus};
use crate::config::ConnectivityConfig;
use crate::host::Reloader;

struct Poller {
    // Dropping the sender ends the loop at its next suspension point
    _shutdown_tx: mpsc::Sender<()>,
    handle: JoinHandle<()>,
}

pub struct ConnectivityMonitor {
    state: Arc<RwLock<ConnectionState>>,
    probe: Arc<dyn LivenessProbe>,
    reloader: Arc<dyn Reloader>,
    base_interval: Duration,
    max_exponent: u32,
    poller: Mutex<Option<Poller>>,
}

impl ConnectivityMonitor {
    pub fn new(
        probe: Arc<dyn LivenessProbe>,
        reloader: Arc<dyn Reloader>,
        config: &ConnectivityConfig,
    ) -> Self {
        Self {
            state: Arc::new(RwLock::new(ConnectionState::new())),
            probe,
            reloader,
            base_interval: config.poll_interval(),
            max_exponent: config.max_backoff_exponent,
            poller: Mutex::new(None),
        }
    }

    pub async fn state(&self) -> ConnectionState {
        self.state.read().await.clone()
    }

    pub async fn status(&self) -> ConnectionStatus {
        self.state.read().await.status
    }

    pub async fn is_online(&self) -> bool {
        self.state.read().await.is_online()
    }

    /// Single liveness probe; never fails.
    pub async fn probe(&self) -> bool {
        self.probe.probe().await
    }

    /// Startup probe: settles `Checking` into `Online` or `Offline`
    /// without reloading.
    pub async fn check_initial(&self) -> ConnectionStatus {
        let reachable = self.probe.probe().await;
        let mut state = self.state.write().await;
        state.observe(reachable, Utc::now());
        info!(status = %state.status, "Initial connectivity");
        state.status
    }

    /// One polling tick: probe, record, reload on a settled transition.
    /// Returns whether a reload was triggered. The retry count only
    /// advances while a poller is running.
    pub async fn poll_once(&self) -> bool {
        let counted = self.is_polling();
        tick(
            &self.state,
            self.probe.as_ref(),
            self.reloader.as_ref(),
            self.max_exponent,
            counted,
        )
        .await
    }

    /// Begin backoff polling from `base`. Any running poller is cancelled first.
    pub fn start_polling(&self, base: Duration) {
        self.stop_polling();

        let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);
        let state = self.state.clone();
        let probe = self.probe.clone();
        let reloader = self.reloader.clone();
        let cap = self.max_exponent;

        let handle = tokio::spawn(async move {
            loop {
                let interval = {
                    let s = state.read().await;
                    backoff_interval(base, s.retry_count, cap)
                };
                debug!(interval_ms = interval.as_millis() as u64, "Next connectivity probe");

                tokio::select! {
                    _ = tokio::time::sleep(interval) => {}
                    _ = shutdown_rx.recv() => break,
                }

                tick(&state, probe.as_ref(), reloader.as_ref(), cap, true).await;
            }
            debug!("Connectivity polling stopped");
        });

        *self.lock_poller() = Some(Poller {
            _shutdown_tx: shutdown_tx,
            handle,
        });
        info!(base_ms = base.as_millis() as u64, "Started polling");
    }

    /// Polling with the configured base interval.
    pub fn start_default_polling(&self) {
        self.start_polling(self.base_interval);
    }

    /// Cancel the active poller. No-op when none is running.
    pub fn stop_polling(&self) {
        if let Some(poller) = self.lock_poller().take() {
            poller.handle.abort();
            debug!("Cancelled connectivity poller");
        }
    }

    pub fn is_polling(&self) -> bool {
        self.lock_poller()
            .as_ref()
            .is_some_and(|p| !p.handle.is_finished())
    }

    /// Browser `online` signal: trusted without probing, the fresh load re-probes.
    pub async fn handle_online(&self) {
        self.stop_polling();
        {
            let mut state = self.state.write().await;
            state.status = ConnectionStatus::Online;
            state.last_seen = Some(Utc::now());
        }
        info!("Browser reported online, reloading");
        self.reloader.reload();
    }

    /// Browser `offline` signal: go offline and confirm recovery by polling.
    pub async fn handle_offline(&self) {
        {
            let mut state = self.state.write().await;
            state.set_status(ConnectionStatus::Offline);
        }
        warn!("Browser reported offline, polling for recovery");
        self.start_default_polling();
    }

    fn lock_poller(&self) -> std::sync::MutexGuard<'_, Option<Poller>> {
        self.poller.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Drop for ConnectivityMonitor {
    fn drop(&mut self) {
        self.stop_polling();
    }
}

async fn tick(
    state: &RwLock<ConnectionState>,
    probe: &dyn LivenessProbe,
    reloader: &dyn Reloader,
    cap: u32,
    counted: bool,
) -> bool {
    let reachable = probe.probe().await;

    let transition = {
        let mut s = state.write().await;
        let transition = s.observe(reachable, Utc::now());
        if counted {
            s.record_tick(cap);
        }
        transition
    };

    match transition {
        Some(t) if t.requires_reload() => {
            info!(from = %t.from, to = %t.to, "Connectivity changed, reloading");
            reloader.reload();
            true
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connectivity::ScriptedProbe;
    use crate::host::CountingReloader;

    fn monitor(script: Vec<bool>) -> (ConnectivityMonitor, Arc<ScriptedProbe>, CountingReloader) {
        let probe = Arc::new(ScriptedProbe::new(script));
        let reloader = CountingReloader::new();
        let monitor = ConnectivityMonitor::new(
            probe.clone(),
            Arc::new(reloader.clone()),
            &ConnectivityConfig::default(),
        );
        (monitor, probe, reloader)
    }

    #[tokio::test]
    async fn test_probe_sequence_states_and_reloads() {
        let (monitor, _probe, reloader) = monitor(vec![true, true, false, false, true]);

        assert_eq!(monitor.check_initial().await, ConnectionStatus::Online);
        let mut observed = vec![monitor.status().await];
        let mut reloads = vec![false];
        for _ in 0..4 {
            reloads.push(monitor.poll_once().await);
            observed.push(monitor.status().await);
        }

        use ConnectionStatus::*;
        assert_eq!(observed, vec![Online, Online, Offline, Offline, Online]);
        assert_eq!(reloads, vec![false, false, true, false, true]);
        assert_eq!(reloader.count(), 2);
        // No poller was running
        assert_eq!(monitor.state().await.retry_count, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_count_advances_only_while_polling() {
        let (monitor, _probe, _reloader) = monitor(vec![false]);
        monitor.check_initial().await;

        monitor.poll_once().await;
        monitor.poll_once().await;
        assert_eq!(monitor.state().await.retry_count, 0);

        // Long base so the poller itself stays asleep
        monitor.start_polling(Duration::from_secs(600));
        monitor.poll_once().await;
        assert_eq!(monitor.state().await.retry_count, 1);

        monitor.stop_polling();
        monitor.poll_once().await;
        assert_eq!(monitor.state().await.retry_count, 1);
    }

    #[tokio::test]
    async fn test_initial_offline_does_not_reload() {
        let (monitor, _probe, reloader) = monitor(vec![false]);
        assert_eq!(monitor.check_initial().await, ConnectionStatus::Offline);
        assert_eq!(reloader.count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_polling_backoff_intervals() {
        let (monitor, probe, _reloader) = monitor(vec![true]);
        monitor.check_initial().await;

        let started = tokio::time::Instant::now();
        monitor.start_polling(Duration::from_millis(5000));
        tokio::time::sleep(Duration::from_secs(1000)).await;
        monitor.stop_polling();

        // First call is the initial probe
        let calls = probe.calls();
        let ticks: Vec<u64> = calls[1..]
            .iter()
            .map(|t| t.duration_since(started).as_millis() as u64)
            .collect();
        assert_eq!(
            &ticks[..7],
            &[5_000, 15_000, 35_000, 75_000, 155_000, 315_000, 475_000]
        );

        // Capped at 2^5 and never decreasing
        let gaps: Vec<u64> = ticks.windows(2).map(|w| w[1] - w[0]).collect();
        assert!(gaps.windows(2).all(|w| w[1] >= w[0]));
        assert_eq!(*gaps.last().unwrap(), 160_000);
    }

    #[tokio::test(start_paused = true)]
    async fn test_restart_cancels_previous_poller() {
        let (monitor, probe, _reloader) = monitor(vec![false]);
        monitor.start_polling(Duration::from_millis(1000));
        monitor.start_polling(Duration::from_millis(1000));
        assert!(monitor.is_polling());

        tokio::time::sleep(Duration::from_millis(1500)).await;
        // A duplicate poller would have probed twice by now
        assert_eq!(probe.call_count(), 1);

        monitor.stop_polling();
        monitor.stop_polling();
        assert!(!monitor.is_polling());

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(probe.call_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_offline_signal_polls_until_recovery() {
        let (monitor, _probe, reloader) = monitor(vec![true, false, true]);
        monitor.check_initial().await;

        monitor.handle_offline().await;
        assert_eq!(monitor.status().await, ConnectionStatus::Offline);
        assert!(monitor.is_polling());
        assert_eq!(reloader.count(), 0);

        // 5s: still down; 5s + 10s: back up, one reload
        tokio::time::sleep(Duration::from_millis(5_500)).await;
        assert_eq!(monitor.status().await, ConnectionStatus::Offline);
        assert_eq!(reloader.count(), 0);

        tokio::time::sleep(Duration::from_millis(10_000)).await;
        assert_eq!(monitor.status().await, ConnectionStatus::Online);
        assert_eq!(reloader.count(), 1);
    }

    #[tokio::test]
    async fn test_online_signal_reloads_without_probe() {
        let (monitor, probe, reloader) = monitor(vec![false]);
        monitor.check_initial().await;
        monitor.start_default_polling();

        monitor.handle_online().await;

        assert_eq!(monitor.status().await, ConnectionStatus::Online);
        assert!(!monitor.is_polling());
        assert_eq!(reloader.count(), 1);
        assert_eq!(probe.call_count(), 1);
    }
}
