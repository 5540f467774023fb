//! Selection bridge
//!
//! Binds selector widgets to the shared document. The local working set
//! is a synchronous cache of the `selection` sub-store: it is rebuilt from
//! the document on every change notification, local or remote, so a
//! binding's own writes and writes from other bindings take the same path.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::model::{FlightRecord, InputType, Location, SelectionRecord};
use super::reset::ResetSignal;
use crate::config::SelectionConfig;
use crate::document::{CollabDocument, Store, Subscription};
use crate::error::{StorageError, ValidationError};
use crate::events::ServerEvent;

const LOCATIONS_KEY: &str = "locations";
const FLIGHT_KEY: &str = "flight";

#[derive(Debug, Default)]
struct WorkingSet {
    selections: BTreeMap<InputType, SelectionRecord>,
    candidates: Vec<Location>,
    initialized: bool,
}

pub struct SelectionBridge {
    doc: CollabDocument,
    user_id: String,
    working: Arc<Mutex<WorkingSet>>,
    reset: Arc<Mutex<ResetSignal>>,
    reset_tx: Arc<watch::Sender<bool>>,
    // Clears the signal at expiry; replaced on every reset
    reset_timer: Mutex<Option<JoinHandle<()>>>,
    subscriptions: Mutex<Vec<Subscription>>,
}

impl SelectionBridge {
    pub fn new(doc: CollabDocument, user_id: impl Into<String>, config: &SelectionConfig) -> Self {
        let (reset_tx, _) = watch::channel(false);
        Self {
            doc,
            user_id: user_id.into(),
            working: Arc::new(Mutex::new(WorkingSet::default())),
            reset: Arc::new(Mutex::new(ResetSignal::new(config.reset_debounce()))),
            reset_tx: Arc::new(reset_tx),
            reset_timer: Mutex::new(None),
            subscriptions: Mutex::new(Vec::new()),
        }
    }

    /// Subscribe to the `airports` and `selection` sub-stores and load
    /// whatever the document already holds.
    pub fn mount(&self) {
        let mut subs = self.lock_subscriptions();
        if !subs.is_empty() {
            debug!("Selection bridge already mounted");
            return;
        }

        let working = self.working.clone();
        subs.push(self.doc.observe(Store::Airports, move |doc, change| {
            debug!(keys = ?change.keys, origin = ?change.origin, "Airports changed");
            load_candidates(doc, &working);
        }));

        let working = self.working.clone();
        subs.push(self.doc.observe(Store::Selection, move |doc, change| {
            debug!(keys = ?change.keys, origin = ?change.origin, "Selection changed");
            load_selections(doc, &working);
        }));
        drop(subs);

        // A restored document notifies nobody, so read it once here
        load_candidates(&self.doc, &self.working);
        load_selections(&self.doc, &self.working);
        info!(user_id = %self.user_id, "Selection bridge mounted");
    }

    pub fn is_mounted(&self) -> bool {
        !self.lock_subscriptions().is_empty()
    }

    /// Catalog pushed by the server. The first client to see an empty
    /// store writes it; everyone reads the stored value back.
    pub fn on_airports(&self, airports: Vec<Location>) {
        let airports_map = self.doc.map(Store::Airports);
        match airports_map.has(LOCATIONS_KEY) {
            Ok(false) => {
                info!(count = airports.len(), "Storing airport catalog");
                if let Err(e) = airports_map.set(LOCATIONS_KEY, &airports) {
                    warn!(error = %e, "Failed to store airport catalog");
                    // Still usable for this session
                    let mut working = self.lock_working();
                    working.candidates = airports;
                    working.initialized = true;
                }
            }
            Ok(true) => load_candidates(&self.doc, &self.working),
            Err(e) => warn!(error = %e, "Failed to read airport catalog"),
        }
    }

    /// Decoded server push. Only the catalog touches the document.
    pub fn on_server_event(&self, event: ServerEvent) {
        match event {
            ServerEvent::Airports { airports } => self.on_airports(airports),
            ServerEvent::PushDownload { progress } => {
                debug!(progress, "Catalog download progress");
            }
        }
    }

    /// Replace the selection for `input_type` in the document, then in the
    /// local set. A failed document write leaves the local set untouched.
    pub fn handle_select(&self, location: Location, input_type: InputType) -> SelectionRecord {
        let record = SelectionRecord::new(location, input_type, self.user_id.clone());

        if let Err(e) = self.doc.map(Store::Selection).set(input_type.as_str(), &record) {
            warn!(input_type = %input_type, error = %e, "Failed to share selection");
            return record;
        }
        self.lock_working()
            .selections
            .insert(input_type, record.clone());
        debug!(input_type = %input_type, city = %record.city, "Selected");
        record
    }

    /// Derive the flight from both selections and store it. With fewer
    /// than two selections nothing is written.
    pub fn handle_submit(&self) -> Result<FlightRecord, ValidationError> {
        let flight = {
            let working = self.lock_working();
            match (
                working.selections.get(&InputType::Departure),
                working.selections.get(&InputType::Arrival),
            ) {
                (Some(departure), Some(arrival)) => FlightRecord {
                    departure: departure.coordinates(),
                    arrival: arrival.coordinates(),
                },
                _ => {
                    let err = ValidationError::IncompleteSelection {
                        selected: working.selections.len(),
                    };
                    warn!(error = %err, "Submit rejected");
                    return Err(err);
                }
            }
        };

        if let Err(e) = self.doc.map(Store::Flight).set(FLIGHT_KEY, &flight) {
            warn!(error = %e, "Failed to share flight");
        }
        info!(departure = ?flight.departure, arrival = ?flight.arrival, "Flight submitted");
        Ok(flight)
    }

    /// Clear every selection and raise the reset signal for the debounce
    /// window. The stored flight is left as is.
    ///
    /// Inside a tokio runtime the signal drops back by itself at expiry.
    /// Without one it lapses on the next [`reset_active`](Self::reset_active).
    pub fn handle_reset(&self) {
        self.clear_shared_selection();
        self.lock_working().selections.clear();

        let expiry = {
            let mut reset = self.lock_reset();
            reset.trigger(Instant::now());
            reset.expiry()
        };
        self.reset_tx.send_replace(true);
        self.schedule_reset_clear(expiry);
        debug!("Selections reset");
    }

    /// Unmount: drop subscriptions and wipe the local set and the shared
    /// selection store, for every binding on this document.
    pub fn destroyed(&self) {
        self.lock_subscriptions().clear();
        self.lock_working().selections.clear();
        self.clear_shared_selection();
        self.cancel_reset_timer();
        self.lock_reset().cancel();
        self.reset_tx.send_replace(false);
        info!("Selection bridge destroyed");
    }

    /// Whether the reset signal is raised. Clears it once expired.
    pub fn reset_active(&self) -> bool {
        let now = Instant::now();
        let mut reset = self.lock_reset();
        if reset.tick(now) {
            self.reset_tx.send_replace(false);
        }
        reset.is_active(now)
    }

    /// Scheduler tick: wait out the current reset window, then clear it.
    pub async fn run_reset_tick(&self) {
        let expiry = self.lock_reset().expiry();
        if let Some(expiry) = expiry {
            tokio::time::sleep_until(expiry).await;
            self.reset_active();
        }
    }

    /// Reset signal for widgets.
    pub fn subscribe_reset(&self) -> watch::Receiver<bool> {
        self.reset_tx.subscribe()
    }

    pub fn selections(&self) -> Vec<SelectionRecord> {
        self.lock_working().selections.values().cloned().collect()
    }

    pub fn selection(&self, input_type: InputType) -> Option<SelectionRecord> {
        self.lock_working().selections.get(&input_type).cloned()
    }

    pub fn candidates(&self) -> Vec<Location> {
        self.lock_working().candidates.clone()
    }

    pub fn is_initialized(&self) -> bool {
        self.lock_working().initialized
    }

    /// Most recently submitted flight, from any binding.
    pub fn flight(&self) -> Result<Option<FlightRecord>, StorageError> {
        self.doc.map(Store::Flight).get(FLIGHT_KEY)
    }

    fn schedule_reset_clear(&self, expiry: Option<Instant>) {
        let mut timer = self.lock_reset_timer();
        if let Some(previous) = timer.take() {
            previous.abort();
        }
        let Some(expiry) = expiry else {
            return;
        };
        let Ok(runtime) = Handle::try_current() else {
            debug!("No runtime for reset timer, signal lapses on read");
            return;
        };

        let reset = self.reset.clone();
        let reset_tx = self.reset_tx.clone();
        *timer = Some(runtime.spawn(async move {
            tokio::time::sleep_until(expiry).await;
            let cleared = reset
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .tick(Instant::now());
            if cleared {
                reset_tx.send_replace(false);
                debug!("Reset signal cleared");
            }
        }));
    }

    fn cancel_reset_timer(&self) {
        if let Some(timer) = self.lock_reset_timer().take() {
            timer.abort();
        }
    }

    fn clear_shared_selection(&self) {
        if let Err(e) = self.doc.map(Store::Selection).clear() {
            warn!(error = %e, "Failed to clear shared selection");
        }
    }

    fn lock_working(&self) -> MutexGuard<'_, WorkingSet> {
        self.working.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_reset(&self) -> MutexGuard<'_, ResetSignal> {
        self.reset.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_reset_timer(&self) -> MutexGuard<'_, Option<JoinHandle<()>>> {
        self.reset_timer.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_subscriptions(&self) -> MutexGuard<'_, Vec<Subscription>> {
        self.subscriptions.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Drop for SelectionBridge {
    fn drop(&mut self) {
        // Unsubscribe only; clearing shared state is left to `destroyed`
        self.lock_subscriptions().clear();
        self.cancel_reset_timer();
    }
}

fn load_candidates(doc: &CollabDocument, working: &Mutex<WorkingSet>) {
    match doc.map(Store::Airports).values::<Vec<Location>>() {
        Ok(values) => {
            let Some(first) = values.into_iter().next() else {
                return;
            };
            let mut working = working.lock().unwrap_or_else(|e| e.into_inner());
            working.candidates = first;
            working.initialized = true;
        }
        Err(e) => warn!(error = %e, "Unreadable airport catalog"),
    }
}

fn load_selections(doc: &CollabDocument, working: &Mutex<WorkingSet>) {
    match doc.map(Store::Selection).values::<SelectionRecord>() {
        Ok(records) => {
            let mut working = working.lock().unwrap_or_else(|e| e.into_inner());
            working.selections = records.into_iter().map(|r| (r.input_type, r)).collect();
        }
        Err(e) => warn!(error = %e, "Unreadable selection store"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::DocumentStore;
    use std::time::Duration;

    fn lisbon() -> Location {
        Location::new("Lisbon", "Portugal", 38.77, -9.13)
    }

    fn oslo() -> Location {
        Location::new("Oslo", "Norway", 60.19, 11.1)
    }

    fn bridge(doc: &CollabDocument, user: &str) -> SelectionBridge {
        let bridge = SelectionBridge::new(doc.clone(), user, &SelectionConfig::default());
        bridge.mount();
        bridge
    }

    #[test]
    fn test_submit_requires_both_selections() {
        let doc = CollabDocument::new();
        let b = bridge(&doc, "u-1");

        b.handle_select(lisbon(), InputType::Departure);
        assert_eq!(
            b.handle_submit(),
            Err(ValidationError::IncompleteSelection { selected: 1 })
        );
        assert!(doc.map(Store::Flight).is_empty().unwrap());
    }

    #[test]
    fn test_submit_orders_by_input_type() {
        let doc = CollabDocument::new();
        let b = bridge(&doc, "u-1");

        // Arrival picked first
        b.handle_select(oslo(), InputType::Arrival);
        b.handle_select(lisbon(), InputType::Departure);

        let flight = b.handle_submit().unwrap();
        assert_eq!(flight.departure, [38.77, -9.13]);
        assert_eq!(flight.arrival, [60.19, 11.1]);
        assert_eq!(b.flight().unwrap(), Some(flight));
    }

    #[test]
    fn test_reselect_replaces_previous() {
        let doc = CollabDocument::new();
        let b = bridge(&doc, "u-1");

        b.handle_select(lisbon(), InputType::Departure);
        b.handle_select(oslo(), InputType::Departure);

        assert_eq!(b.selections().len(), 1);
        assert_eq!(b.selection(InputType::Departure).unwrap().city, "Oslo");
        assert_eq!(doc.map(Store::Selection).len().unwrap(), 1);
    }

    #[test]
    fn test_airports_written_once_and_read_back() {
        let doc = CollabDocument::new();
        let first = bridge(&doc, "u-1");
        let second = bridge(&doc, "u-2");
        assert!(!first.is_initialized());

        first.on_airports(vec![lisbon(), oslo()]);
        assert!(first.is_initialized());
        assert!(second.is_initialized());
        assert_eq!(second.candidates().len(), 2);

        // A later push does not overwrite the stored catalog
        second.on_airports(vec![oslo()]);
        assert_eq!(first.candidates(), vec![lisbon(), oslo()]);
        assert_eq!(second.candidates(), vec![lisbon(), oslo()]);
    }

    #[test]
    fn test_decoded_catalog_event() {
        let doc = CollabDocument::new();
        let b = bridge(&doc, "u-1");
        let payload = serde_json::json!({"airports": [
            {"city": "Lisbon", "country": "Portugal", "lat": "38.77", "lng": -9.13}
        ]});

        b.on_server_event(ServerEvent::decode(ServerEvent::PUSH_DOWNLOAD, &serde_json::json!({"progress": 40.0})).unwrap());
        assert!(!b.is_initialized());

        b.on_server_event(ServerEvent::decode(ServerEvent::AIRPORTS, &payload).unwrap());
        assert_eq!(b.candidates(), vec![lisbon()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_signal_clears_after_debounce() {
        let doc = CollabDocument::new();
        let b = bridge(&doc, "u-1");
        let mut rx = b.subscribe_reset();

        b.handle_select(lisbon(), InputType::Departure);
        b.handle_reset();

        assert!(b.selections().is_empty());
        assert!(doc.map(Store::Selection).is_empty().unwrap());
        assert!(b.reset_active());
        assert!(*rx.borrow_and_update());

        b.run_reset_tick().await;
        assert!(!b.reset_active());
        assert!(!*rx.borrow_and_update());

        // A new selection goes through right after the window
        b.handle_select(oslo(), InputType::Arrival);
        assert_eq!(b.selections().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_active_lapses_without_tick() {
        let doc = CollabDocument::new();
        let b = bridge(&doc, "u-1");
        b.handle_reset();
        tokio::time::advance(Duration::from_millis(100)).await;
        assert!(!b.reset_active());
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_signal_drops_without_bridge_calls() {
        let doc = CollabDocument::new();
        let b = bridge(&doc, "u-1");
        let rx = b.subscribe_reset();

        b.handle_reset();
        assert!(*rx.borrow());

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(!*rx.borrow());
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_reset_extends_window() {
        let doc = CollabDocument::new();
        let b = bridge(&doc, "u-1");
        let rx = b.subscribe_reset();

        b.handle_reset();
        tokio::time::sleep(Duration::from_millis(60)).await;
        b.handle_reset();

        // Past the first window, inside the second
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(*rx.borrow());

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(!*rx.borrow());
    }

    #[tokio::test(start_paused = true)]
    async fn test_destroyed_cancels_pending_clear() {
        let doc = CollabDocument::new();
        let b = bridge(&doc, "u-1");
        let mut rx = b.subscribe_reset();

        b.handle_reset();
        b.destroyed();
        assert!(!*rx.borrow_and_update());

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(!rx.has_changed().unwrap());
    }

    #[test]
    fn test_failed_write_leaves_local_set_alone() {
        // A document without its sub-stores rejects every write
        let store = DocumentStore::in_memory().unwrap();
        store.save("bare", &automerge::AutoCommit::new().save()).unwrap();
        let doc = CollabDocument::open(store, "bare").unwrap();
        let b = bridge(&doc, "u-1");

        b.handle_select(lisbon(), InputType::Departure);
        assert!(b.selections().is_empty());
        assert!(doc.map(Store::Selection).get::<SelectionRecord>("departure").is_err());
    }

    #[test]
    fn test_reset_keeps_stale_flight() {
        let doc = CollabDocument::new();
        let b = bridge(&doc, "u-1");
        b.handle_select(lisbon(), InputType::Departure);
        b.handle_select(oslo(), InputType::Arrival);
        let flight = b.handle_submit().unwrap();

        b.handle_reset();
        assert_eq!(b.flight().unwrap(), Some(flight));
    }

    #[test]
    fn test_destroyed_wipes_shared_selection() {
        let doc = CollabDocument::new();
        let a = bridge(&doc, "u-1");
        let b = bridge(&doc, "u-2");

        a.handle_select(lisbon(), InputType::Departure);
        assert_eq!(b.selections().len(), 1);

        a.destroyed();
        assert!(!a.is_mounted());
        assert!(doc.map(Store::Selection).is_empty().unwrap());
        assert!(b.selections().is_empty());
    }
}
