//! In-process document store.
//!
//! Implements both halves of the store boundary so the dashboard can run
//! (and be tested) without a remote backend. Live queries deliver their
//! initial snapshot synchronously from inside `subscribe`, then a fresh
//! snapshot after every write to the queried collection.

use std::cmp::Ordering as CmpOrdering;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::{Mutex, ReentrantMutex};
use serde_json::Value;
use tracing::{debug, trace};

use tipster_live::{
    Direction, Document, QueryKey, QuerySource, SnapshotSink, Subscription, UpstreamError,
};

use crate::store::merge_patch;
use crate::{DocumentStore, StoreError};

struct Listener {
    key: QueryKey,
    sink: SnapshotSink<Value>,
}

#[derive(Default)]
struct MemoryInner {
    /// Documents per collection, in insertion order.
    collections: Mutex<HashMap<String, Vec<Document<Value>>>>,
    listeners: DashMap<u64, Arc<Listener>>,
    /// Serializes notification so listeners see writes in order.
    delivery: ReentrantMutex<()>,
    next_listener: AtomicU64,
    subscribe_calls: AtomicUsize,
}

/// Thread-safe in-memory document store.
///
/// Cloning yields another handle to the same data.
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<MemoryInner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a document with a known id.
    pub fn insert(&self, collection: &str, id: impl Into<String>, record: Value) {
        let id = id.into();
        {
            let mut collections = self.inner.collections.lock();
            let docs = collections.entry(collection.to_string()).or_default();
            match docs.iter_mut().find(|doc| doc.id == id) {
                Some(doc) => doc.data = record,
                None => docs.push(Document::new(id, record)),
            }
        }
        self.inner.notify(collection);
    }

    /// Current result of `key`, ordered like a live query would be.
    pub fn query(&self, key: &QueryKey) -> Vec<Document<Value>> {
        self.inner.query(key)
    }

    /// Push `error` to every live query on `collection`.
    pub fn fail(&self, collection: &str, error: UpstreamError) {
        let _delivery = self.inner.delivery.lock();
        for listener in self.inner.listeners_for(collection) {
            listener.sink.error(error.clone());
        }
    }

    /// Number of open live queries.
    pub fn listener_count(&self) -> usize {
        self.inner.listeners.len()
    }

    /// Number of live queries ever opened.
    pub fn subscribe_calls(&self) -> usize {
        self.inner.subscribe_calls.load(Ordering::SeqCst)
    }
}

impl std::fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryStore")
            .field("collections", &self.inner.collections.lock().len())
            .field("listeners", &self.inner.listeners.len())
            .finish()
    }
}

impl MemoryInner {
    fn query(&self, key: &QueryKey) -> Vec<Document<Value>> {
        let mut docs: Vec<_> = {
            let collections = self.collections.lock();
            match collections.get(key.collection_name()) {
                Some(docs) => docs.clone(),
                None => Vec::new(),
            }
        };

        if let Some(order) = key.order() {
            // Ordered queries only match documents that have the field.
            docs.retain(|doc| doc.data.get(&order.field).is_some());
            docs.sort_by(|a, b| {
                let ordering = compare_values(&a.data[&order.field], &b.data[&order.field]);
                match order.direction {
                    Direction::Ascending => ordering,
                    Direction::Descending => ordering.reverse(),
                }
            });
        }

        docs
    }

    fn listeners_for(&self, collection: &str) -> Vec<Arc<Listener>> {
        self.listeners
            .iter()
            .filter(|entry| entry.key.collection_name() == collection)
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }

    /// Re-deliver every live query on `collection`.
    ///
    /// Snapshots are computed at delivery time, so a write made from inside a
    /// listener never lets an older snapshot overtake a newer one.
    fn notify(&self, collection: &str) {
        let _delivery = self.delivery.lock();
        let listeners = self.listeners_for(collection);
        trace!(collection = %collection, listeners = listeners.len(), "notifying live queries");
        for listener in listeners {
            listener.sink.snapshot(self.query(&listener.key));
        }
    }

    fn cancel(&self, id: u64) {
        if self.listeners.remove(&id).is_some() {
            debug!(listener = id, "live query cancelled");
        }
    }
}

/// Sort order over JSON values: null < bool < number < string < array < object.
///
/// Among strings, RFC3339 timestamps come first in time order.
fn compare_values(a: &Value, b: &Value) -> CmpOrdering {
    fn rank(value: &Value) -> u8 {
        match value {
            Value::Null => 0,
            Value::Bool(_) => 1,
            Value::Number(_) => 2,
            Value::String(_) => 3,
            Value::Array(_) => 4,
            Value::Object(_) => 5,
        }
    }

    match (a, b) {
        (Value::Bool(a), Value::Bool(b)) => a.cmp(b),
        (Value::Number(a), Value::Number(b)) => {
            let a = a.as_f64().unwrap_or(f64::NAN);
            let b = b.as_f64().unwrap_or(f64::NAN);
            a.total_cmp(&b)
        }
        (Value::String(a), Value::String(b)) => {
            // Timestamps compare chronologically whatever their precision
            // and sort before every other string.
            match (
                chrono::DateTime::parse_from_rfc3339(a),
                chrono::DateTime::parse_from_rfc3339(b),
            ) {
                (Ok(a), Ok(b)) => a.cmp(&b),
                (Ok(_), Err(_)) => CmpOrdering::Less,
                (Err(_), Ok(_)) => CmpOrdering::Greater,
                (Err(_), Err(_)) => a.cmp(b),
            }
        }
        (Value::Array(a), Value::Array(b)) => a
            .iter()
            .zip(b.iter())
            .map(|(a, b)| compare_values(a, b))
            .find(|ordering| ordering.is_ne())
            .unwrap_or_else(|| a.len().cmp(&b.len())),
        _ => rank(a).cmp(&rank(b)),
    }
}

impl QuerySource<Value> for MemoryStore {
    fn subscribe(&self, key: &QueryKey, sink: SnapshotSink<Value>) -> Box<dyn Subscription> {
        let id = self.inner.next_listener.fetch_add(1, Ordering::SeqCst);
        self.inner.subscribe_calls.fetch_add(1, Ordering::SeqCst);

        let listener = Arc::new(Listener {
            key: key.clone(),
            sink,
        });
        self.inner.listeners.insert(id, Arc::clone(&listener));
        debug!(query = %key, listener = id, "live query opened");

        {
            let _delivery = self.inner.delivery.lock();
            listener.sink.snapshot(self.inner.query(key));
        }

        let weak: Weak<MemoryInner> = Arc::downgrade(&self.inner);
        Box::new(move || {
            if let Some(inner) = weak.upgrade() {
                inner.cancel(id);
            }
        })
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn create(&self, collection: &str, record: Value) -> Result<String, StoreError> {
        let id = uuid::Uuid::new_v4().simple().to_string();
        self.insert(collection, id.clone(), record);
        Ok(id)
    }

    async fn update(&self, collection: &str, id: &str, patch: Value) -> Result<(), StoreError> {
        {
            let mut collections = self.inner.collections.lock();
            let doc = collections
                .get_mut(collection)
                .and_then(|docs| docs.iter_mut().find(|doc| doc.id == id))
                .ok_or_else(|| StoreError::NotFound {
                    collection: collection.to_string(),
                    id: id.to_string(),
                })?;
            merge_patch(&mut doc.data, patch);
        }
        self.inner.notify(collection);
        Ok(())
    }

    async fn delete(&self, collection: &str, id: &str) -> Result<(), StoreError> {
        {
            let mut collections = self.inner.collections.lock();
            let docs = collections.get_mut(collection);
            let position = docs
                .as_ref()
                .and_then(|docs| docs.iter().position(|doc| doc.id == id));
            match (docs, position) {
                (Some(docs), Some(position)) => {
                    docs.remove(position);
                }
                _ => {
                    return Err(StoreError::NotFound {
                        collection: collection.to_string(),
                        id: id.to_string(),
                    });
                }
            }
        }
        self.inner.notify(collection);
        Ok(())
    }

    async fn get(&self, collection: &str, id: &str) -> Result<Document<Value>, StoreError> {
        self.inner
            .collections
            .lock()
            .get(collection)
            .and_then(|docs| docs.iter().find(|doc| doc.id == id).cloned())
            .ok_or_else(|| StoreError::NotFound {
                collection: collection.to_string(),
                id: id.to_string(),
            })
    }
}
