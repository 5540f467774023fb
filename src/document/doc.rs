//! CollabDocument and its map sub-stores
//!
//! Every replica starts from the same genesis change (fixed actor, zero
//! timestamp) that creates the sub-store maps, so sub-stores created on
//! different replicas are the same Automerge objects and merge key by key.
//! After genesis each replica writes under its own random actor.

use automerge::transaction::{CommitOptions, Transactable};
use automerge::{ActorId, AutoCommit, ChangeHash, ObjId, ObjType, ReadDoc, Value, ROOT};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use tracing::{debug, info, warn};

use super::store::DocumentStore;
use crate::error::StorageError;

const GENESIS_ACTOR: [u8; 16] = *b"offline-shell-v1";
const DEFAULT_DOC_ID: &str = "shell";

/// Named map sub-stores of the shared document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Store {
    /// Candidate airport list, under the `locations` key
    Airports,
    /// Current selections, keyed by input type
    Selection,
    /// Submitted flight, under the `flight` key
    Flight,
}

impl Store {
    pub const ALL: [Store; 3] = [Store::Airports, Store::Selection, Store::Flight];

    pub fn as_str(&self) -> &'static str {
        match self {
            Store::Airports => "airports",
            Store::Selection => "selection",
            Store::Flight => "flight",
        }
    }
}

impl fmt::Display for Store {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where a change came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeOrigin {
    Local,
    Remote,
}

/// Notification delivered to store observers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MapChange {
    pub store: Store,
    /// Keys added, updated or removed
    pub keys: Vec<String>,
    pub origin: ChangeOrigin,
}

type Callback = Arc<dyn Fn(&CollabDocument, &MapChange) + Send + Sync>;

struct Observer {
    id: u64,
    store: Store,
    callback: Callback,
}

struct Shared {
    doc_id: String,
    doc: Mutex<AutoCommit>,
    persistence: Option<Mutex<DocumentStore>>,
    observers: Mutex<Vec<Observer>>,
    next_observer: AtomicU64,
}

impl Shared {
    fn lock_doc(&self) -> MutexGuard<'_, AutoCommit> {
        self.doc.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_observers(&self) -> MutexGuard<'_, Vec<Observer>> {
        self.observers.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn persist(&self, doc: &mut AutoCommit) {
        let Some(store) = &self.persistence else {
            return;
        };
        let bytes = doc.save();
        let store = store.lock().unwrap_or_else(|e| e.into_inner());
        if let Err(e) = store.save(&self.doc_id, &bytes) {
            let err = StorageError::from(e);
            warn!(doc_id = %self.doc_id, error = %err, "Document not persisted");
        }
    }
}

/// Shared CRDT document. Cloning yields another handle to the same replica.
#[derive(Clone)]
pub struct CollabDocument {
    shared: Arc<Shared>,
}

impl fmt::Debug for CollabDocument {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CollabDocument")
            .field("doc_id", &self.shared.doc_id)
            .field("persistent", &self.shared.persistence.is_some())
            .finish()
    }
}

impl Default for CollabDocument {
    fn default() -> Self {
        Self::new()
    }
}

impl CollabDocument {
    /// Fresh in-memory replica.
    pub fn new() -> Self {
        Self::from_parts(DEFAULT_DOC_ID.to_string(), genesis(), None)
    }

    /// Replica restored from `store`, or created there if `doc_id` is new.
    pub fn open(store: DocumentStore, doc_id: &str) -> Result<Self, StorageError> {
        let doc = match store.load(doc_id)? {
            Some(bytes) => {
                let doc = AutoCommit::load(&bytes)?;
                info!(doc_id, bytes = bytes.len(), "Restored collaborative document");
                doc
            }
            None => {
                let mut doc = genesis();
                store.save(doc_id, &doc.save())?;
                info!(doc_id, "Created collaborative document");
                doc
            }
        };
        Ok(Self::from_parts(doc_id.to_string(), doc, Some(store)))
    }

    fn from_parts(doc_id: String, doc: AutoCommit, store: Option<DocumentStore>) -> Self {
        Self {
            shared: Arc::new(Shared {
                doc_id,
                doc: Mutex::new(doc),
                persistence: store.map(Mutex::new),
                observers: Mutex::new(Vec::new()),
                next_observer: AtomicU64::new(0),
            }),
        }
    }

    pub fn doc_id(&self) -> &str {
        &self.shared.doc_id
    }

    /// Handle to one sub-store.
    pub fn map(&self, store: Store) -> MapRef {
        MapRef {
            doc: self.clone(),
            store,
        }
    }

    /// Full document encoding.
    pub fn save(&self) -> Vec<u8> {
        self.shared.lock_doc().save()
    }

    /// Write the current state to the durable store, if any.
    pub fn flush(&self) {
        let mut doc = self.shared.lock_doc();
        self.shared.persist(&mut doc);
    }

    pub fn is_persistent(&self) -> bool {
        self.shared.persistence.is_some()
    }

    /// Current heads as hex strings.
    pub fn heads(&self) -> Vec<String> {
        self.shared
            .lock_doc()
            .get_heads()
            .iter()
            .map(|h| h.to_string())
            .collect()
    }

    /// Changes a peer at `heads` is missing.
    pub fn changes_since(&self, heads: &[String]) -> Result<Vec<u8>, StorageError> {
        let parsed = heads
            .iter()
            .map(|h| parse_hash(h))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(self.shared.lock_doc().save_after(&parsed))
    }

    /// Merge an encoded document or change set from another replica and
    /// notify observers of every sub-store whose contents changed.
    pub fn apply_remote(&self, bytes: &[u8]) -> Result<(), StorageError> {
        let changes = {
            let mut doc = self.shared.lock_doc();
            let before = snapshot(&doc)?;
            let applied = doc.load_incremental(bytes)?;
            let after = snapshot(&doc)?;
            let changes = diff(&before, &after);
            if !changes.is_empty() {
                self.shared.persist(&mut doc);
            }
            debug!(doc_id = %self.shared.doc_id, ops = applied, stores = changes.len(), "Applied remote update");
            changes
        };

        for change in changes {
            self.notify(&change);
        }
        Ok(())
    }

    /// Pull everything `other` has.
    pub fn merge_from(&self, other: &CollabDocument) -> Result<(), StorageError> {
        if Arc::ptr_eq(&self.shared, &other.shared) {
            return Ok(());
        }
        let bytes = other.save();
        self.apply_remote(&bytes)
    }

    /// Exchange state in both directions.
    pub fn sync_with(&self, other: &CollabDocument) -> Result<(), StorageError> {
        self.merge_from(other)?;
        other.merge_from(self)
    }

    /// Subscribe to changes of one sub-store. The subscription ends when
    /// the returned guard is dropped.
    pub fn observe<F>(&self, store: Store, callback: F) -> Subscription
    where
        F: Fn(&CollabDocument, &MapChange) + Send + Sync + 'static,
    {
        let id = self.shared.next_observer.fetch_add(1, Ordering::Relaxed);
        self.shared.lock_observers().push(Observer {
            id,
            store,
            callback: Arc::new(callback),
        });
        Subscription {
            id,
            doc: Arc::downgrade(&self.shared),
        }
    }

    pub fn observer_count(&self) -> usize {
        self.shared.lock_observers().len()
    }

    fn notify(&self, change: &MapChange) {
        // Callbacks run without any lock held so they may read or write the document
        let callbacks: Vec<Callback> = self
            .shared
            .lock_observers()
            .iter()
            .filter(|o| o.store == change.store)
            .map(|o| o.callback.clone())
            .collect();

        for callback in callbacks {
            callback(self, change);
        }
    }

    fn mutate<R>(
        &self,
        store: Store,
        f: impl FnOnce(&mut AutoCommit, &ObjId) -> Result<(R, Vec<String>), StorageError>,
    ) -> Result<R, StorageError> {
        let (result, keys) = {
            let mut doc = self.shared.lock_doc();
            let id = map_id(&doc, store)?;
            let (result, keys) = f(&mut doc, &id)?;
            if !keys.is_empty() {
                self.shared.persist(&mut doc);
            }
            (result, keys)
        };

        if !keys.is_empty() {
            self.notify(&MapChange {
                store,
                keys,
                origin: ChangeOrigin::Local,
            });
        }
        Ok(result)
    }

    fn read<R>(
        &self,
        store: Store,
        f: impl FnOnce(&AutoCommit, &ObjId) -> Result<R, StorageError>,
    ) -> Result<R, StorageError> {
        let doc = self.shared.lock_doc();
        let id = map_id(&doc, store)?;
        f(&doc, &id)
    }
}

/// Guard for an observer registration.
pub struct Subscription {
    id: u64,
    doc: Weak<Shared>,
}

impl Subscription {
    pub fn unsubscribe(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(shared) = self.doc.upgrade() {
            shared.lock_observers().retain(|o| o.id != self.id);
        }
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription").field("id", &self.id).finish()
    }
}

/// Typed view over one sub-store. Values are stored JSON-encoded.
#[derive(Clone, Debug)]
pub struct MapRef {
    doc: CollabDocument,
    store: Store,
}

impl MapRef {
    pub fn store(&self) -> Store {
        self.store
    }

    pub fn document(&self) -> &CollabDocument {
        &self.doc
    }

    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, StorageError> {
        let store = self.store;
        let raw = self.doc.read(store, |doc, id| read_string(doc, id, key))?;
        raw.map(|text| decode(store, key, &text)).transpose()
    }

    pub fn set<T: Serialize>(&self, key: &str, value: &T) -> Result<(), StorageError> {
        let encoded = serde_json::to_string(value)
            .map_err(|e| StorageError::Document(format!("encoding {}.{key}: {e}", self.store)))?;
        self.doc.mutate(self.store, |doc, id| {
            doc.put(id, key, encoded)?;
            Ok(((), vec![key.to_string()]))
        })
    }

    pub fn has(&self, key: &str) -> Result<bool, StorageError> {
        self.doc
            .read(self.store, |doc, id| Ok(doc.get(id, key)?.is_some()))
    }

    /// Remove `key`; returns whether it was present.
    pub fn delete(&self, key: &str) -> Result<bool, StorageError> {
        self.doc.mutate(self.store, |doc, id| {
            if doc.get(id, key)?.is_none() {
                return Ok((false, Vec::new()));
            }
            doc.delete(id, key)?;
            Ok((true, vec![key.to_string()]))
        })
    }

    pub fn clear(&self) -> Result<(), StorageError> {
        self.doc.mutate(self.store, |doc, id| {
            let keys: Vec<String> = doc.keys(id).collect();
            for key in &keys {
                doc.delete(id, key.as_str())?;
            }
            Ok(((), keys))
        })
    }

    /// Keys in lexicographic order.
    pub fn keys(&self) -> Result<Vec<String>, StorageError> {
        self.doc.read(self.store, |doc, id| Ok(doc.keys(id).collect()))
    }

    pub fn len(&self) -> Result<usize, StorageError> {
        Ok(self.keys()?.len())
    }

    pub fn is_empty(&self) -> Result<bool, StorageError> {
        Ok(self.len()? == 0)
    }

    /// Values in key order.
    pub fn values<T: DeserializeOwned>(&self) -> Result<Vec<T>, StorageError> {
        let store = self.store;
        let entries = self.doc.read(store, read_map)?;
        entries
            .iter()
            .map(|(key, text)| decode(store, key, text))
            .collect()
    }

    pub fn observe<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&CollabDocument, &MapChange) + Send + Sync + 'static,
    {
        self.doc.observe(self.store, callback)
    }
}

fn genesis() -> AutoCommit {
    let mut doc = AutoCommit::new().with_actor(ActorId::from(&GENESIS_ACTOR[..]));
    for store in Store::ALL {
        // Fresh document, put_object on ROOT cannot fail
        if let Err(e) = doc.put_object(ROOT, store.as_str(), ObjType::Map) {
            warn!(store = %store, error = %e, "Failed to create sub-store");
        }
    }
    let _ = doc.commit_with(CommitOptions::default().with_time(0));
    doc.set_actor(ActorId::random());
    doc
}

fn map_id(doc: &AutoCommit, store: Store) -> Result<ObjId, StorageError> {
    match doc.get(ROOT, store.as_str())? {
        Some((Value::Object(ObjType::Map), id)) => Ok(id),
        _ => Err(StorageError::Document(format!("missing sub-store {store}"))),
    }
}

fn read_string(doc: &AutoCommit, id: &ObjId, key: &str) -> Result<Option<String>, StorageError> {
    Ok(doc
        .get(id, key)?
        .and_then(|(value, _)| value.to_str().map(str::to_string)))
}

fn read_map(doc: &AutoCommit, id: &ObjId) -> Result<BTreeMap<String, String>, StorageError> {
    let mut entries = BTreeMap::new();
    for key in doc.keys(id) {
        if let Some(text) = read_string(doc, id, &key)? {
            entries.insert(key, text);
        }
    }
    Ok(entries)
}

fn snapshot(doc: &AutoCommit) -> Result<HashMap<Store, BTreeMap<String, String>>, StorageError> {
    let mut stores = HashMap::new();
    for store in Store::ALL {
        let id = map_id(doc, store)?;
        stores.insert(store, read_map(doc, &id)?);
    }
    Ok(stores)
}

fn diff(
    before: &HashMap<Store, BTreeMap<String, String>>,
    after: &HashMap<Store, BTreeMap<String, String>>,
) -> Vec<MapChange> {
    let empty = BTreeMap::new();
    let mut changes = Vec::new();

    for store in Store::ALL {
        let old = before.get(&store).unwrap_or(&empty);
        let new = after.get(&store).unwrap_or(&empty);

        let mut keys: Vec<String> = new
            .iter()
            .filter(|(k, v)| old.get(*k) != Some(*v))
            .map(|(k, _)| k.clone())
            .collect();
        keys.extend(old.keys().filter(|k| !new.contains_key(*k)).cloned());
        keys.sort();

        if !keys.is_empty() {
            changes.push(MapChange {
                store,
                keys,
                origin: ChangeOrigin::Remote,
            });
        }
    }
    changes
}

fn decode<T: DeserializeOwned>(store: Store, key: &str, text: &str) -> Result<T, StorageError> {
    serde_json::from_str(text)
        .map_err(|e| StorageError::Document(format!("decoding {store}.{key}: {e}")))
}

fn parse_hash(hex_str: &str) -> Result<ChangeHash, StorageError> {
    let bytes = hex::decode(hex_str)
        .map_err(|e| StorageError::Document(format!("invalid head {hex_str:?}: {e}")))?;
    let arr: [u8; 32] = bytes
        .try_into()
        .map_err(|_| StorageError::Document(format!("head {hex_str:?} is not 32 bytes")))?;
    Ok(ChangeHash(arr))
}
