//! Shared live-query cache.
//!
//! Keeps at most one upstream subscription per [`QueryKey`] no matter how
//! many local observers ask for it, and fans every upstream snapshot out to
//! all of them. The subscriber set doubles as the reference count: the entry
//! (and its upstream subscription) lives exactly as long as the set is
//! non-empty.

use std::cell::Cell;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use dashmap::DashMap;
use parking_lot::{Mutex, ReentrantMutex};
use tracing::{debug, trace, warn};

use crate::{Delivery, QueryKey, QuerySource, Snapshot, SnapshotSink, Subscription, UpstreamError};

type Callback<T> = Box<dyn Fn(Snapshot<T>) + Send + Sync>;

/// One registered observer.
struct Subscriber<T> {
    callback: Callback<T>,
    /// Highest entry version handed to `callback`. Re-entrant so a callback
    /// that triggers a synchronous delivery on its own thread does not deadlock.
    seen: ReentrantMutex<Cell<Option<u64>>>,
    active: AtomicBool,
}

impl<T> Subscriber<T> {
    fn new(callback: Callback<T>) -> Self {
        Self {
            callback,
            seen: ReentrantMutex::new(Cell::new(None)),
            active: AtomicBool::new(true),
        }
    }

    fn deliver(&self, version: u64, snapshot: Snapshot<T>) {
        let seen = self.seen.lock();
        if !self.active.load(Ordering::SeqCst) {
            return;
        }
        if seen.get().is_some_and(|last| last >= version) {
            return;
        }
        seen.set(Some(version));
        (self.callback)(snapshot);
    }

    fn deactivate(&self) {
        self.active.store(false, Ordering::SeqCst);
    }
}

/// An open upstream subscription.
///
/// `Subscription` is only `Send`; the mutex lets entries sit in a shared map.
struct UpstreamHandle(Mutex<Box<dyn Subscription>>);

impl UpstreamHandle {
    fn new(subscription: Box<dyn Subscription>) -> Self {
        Self(Mutex::new(subscription))
    }

    fn cancel(self) {
        self.0.into_inner().cancel();
    }
}

/// Per-query state.
struct CacheEntry<T> {
    /// Which upstream subscription feeds this entry.
    epoch: u64,
    data: Snapshot<T>,
    /// Deliveries applied so far; 0 until the first snapshot or error.
    version: u64,
    subscribers: HashMap<u64, Arc<Subscriber<T>>>,
    upstream: Option<UpstreamHandle>,
    last_error: Option<UpstreamError>,
}

impl<T> CacheEntry<T> {
    fn new(epoch: u64) -> Self {
        Self {
            epoch,
            data: Snapshot::empty(),
            version: 0,
            subscribers: HashMap::new(),
            upstream: None,
            last_error: None,
        }
    }
}

/// Point-in-time view of one cache entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryInfo {
    /// Number of attached observers.
    pub subscribers: usize,
    /// Whether an upstream subscription is open.
    pub live: bool,
    /// Documents in the current snapshot.
    pub len: usize,
    /// Upstream deliveries applied since the entry was created.
    pub version: u64,
    /// Most recent upstream fault since the last good snapshot.
    pub last_error: Option<UpstreamError>,
}

struct CacheInner<T> {
    name: String,
    source: Box<dyn QuerySource<T>>,
    entries: DashMap<QueryKey, CacheEntry<T>>,
    /// Serializes opening and closing the upstream for one key. Re-entrant
    /// so a callback run during a synchronous initial delivery may detach.
    lifecycles: DashMap<QueryKey, Arc<ReentrantMutex<()>>>,
    next_epoch: AtomicU64,
    next_subscriber: AtomicU64,
}

/// Multiplexes live queries from one [`QuerySource`] to many local observers.
///
/// Cloning yields another handle to the same cache.
pub struct SharedQueryCache<T> {
    inner: Arc<CacheInner<T>>,
}

impl<T> Clone for SharedQueryCache<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Send + Sync + 'static> SharedQueryCache<T> {
    /// Create an empty cache over `source`. `name` labels log output.
    pub fn new(name: impl Into<String>, source: impl QuerySource<T> + 'static) -> Self {
        Self {
            inner: Arc::new(CacheInner {
                name: name.into(),
                source: Box::new(source),
                entries: DashMap::new(),
                lifecycles: DashMap::new(),
                next_epoch: AtomicU64::new(1),
                next_subscriber: AtomicU64::new(1),
            }),
        }
    }

    /// The cache's name.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Observe the live query `key`.
    ///
    /// Opens the upstream subscription if this is the first observer, then
    /// calls `callback` with the current snapshot (possibly empty) before
    /// returning, and again on every later upstream delivery.
    ///
    /// The returned [`Detach`] removes the observer when called or dropped.
    pub fn subscribe<F>(&self, key: QueryKey, callback: F) -> Detach
    where
        F: Fn(Snapshot<T>) + Send + Sync + 'static,
    {
        use dashmap::mapref::entry::Entry;

        let inner = &self.inner;
        let id = inner.next_subscriber.fetch_add(1, Ordering::SeqCst);
        let subscriber = Arc::new(Subscriber::new(Box::new(callback)));

        let attached = match inner.entries.get_mut(&key) {
            Some(mut entry) => {
                entry.subscribers.insert(id, Arc::clone(&subscriber));
                true
            }
            None => false,
        };

        if !attached {
            // The entry exists before the upstream opens, so concurrent
            // subscribers for the same key never open a second one. The
            // lifecycle lock keeps a fresh open from overlapping a close
            // that has not finished cancelling.
            inner.with_lifecycle(&key, || {
                let opening = match inner.entries.entry(key.clone()) {
                    Entry::Occupied(mut entry) => {
                        entry.get_mut().subscribers.insert(id, Arc::clone(&subscriber));
                        None
                    }
                    Entry::Vacant(entry) => {
                        let epoch = inner.next_epoch.fetch_add(1, Ordering::SeqCst);
                        let mut created = CacheEntry::new(epoch);
                        created.subscribers.insert(id, Arc::clone(&subscriber));
                        entry.insert(created);
                        Some(epoch)
                    }
                };

                if let Some(epoch) = opening {
                    inner.open_upstream(&key, epoch);
                }
            });
        }

        let current = inner
            .entries
            .get(&key)
            .filter(|entry| entry.subscribers.contains_key(&id))
            .map(|entry| (entry.version, entry.data.clone()));
        if let Some((version, data)) = current {
            subscriber.deliver(version, data);
        }

        trace!(cache = %inner.name, query = %key, subscriber = id, "subscriber attached");

        let weak = Arc::downgrade(inner);
        Detach::new(move || {
            if let Some(inner) = weak.upgrade() {
                inner.detach(&key, id);
            }
        })
    }

    /// Current snapshot for `key`, if an entry exists.
    pub fn current(&self, key: &QueryKey) -> Option<Snapshot<T>> {
        self.inner.entries.get(key).map(|entry| entry.data.clone())
    }

    /// Inspect the entry for `key`.
    pub fn entry_info(&self, key: &QueryKey) -> Option<EntryInfo> {
        self.inner.entries.get(key).map(|entry| EntryInfo {
            subscribers: entry.subscribers.len(),
            live: entry.upstream.is_some(),
            len: entry.data.len(),
            version: entry.version,
            last_error: entry.last_error.clone(),
        })
    }

    /// Keys with an entry, sorted.
    pub fn active_queries(&self) -> Vec<QueryKey> {
        let mut keys: Vec<_> = self
            .inner
            .entries
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        keys.sort();
        keys
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        self.inner.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.entries.is_empty()
    }

    /// Drop every entry: cancel open upstreams and silence all observers.
    ///
    /// Outstanding [`Detach`] handles become no-ops.
    pub fn reset(&self) {
        let keys: Vec<_> = self
            .inner
            .entries
            .iter()
            .map(|entry| entry.key().clone())
            .collect();

        for key in keys {
            self.inner.with_lifecycle(&key, || {
                if let Some((key, entry)) = self.inner.entries.remove(&key) {
                    self.inner.close(&key, entry);
                }
            });
        }
        debug!(cache = %self.inner.name, "cache reset");
    }
}

impl<T: Send + Sync + 'static> CacheInner<T> {
    /// Run `f` holding the lifecycle lock for `key`.
    fn with_lifecycle<R>(&self, key: &QueryKey, f: impl FnOnce() -> R) -> R {
        let lock = self
            .lifecycles
            .entry(key.clone())
            .or_insert_with(|| Arc::new(ReentrantMutex::new(())))
            .clone();
        let result = {
            let _guard = lock.lock();
            f()
        };
        drop(lock);
        // Only the map still holds it: nobody is waiting on this key.
        self.lifecycles
            .remove_if(key, |_, lock| Arc::strong_count(lock) == 1);
        result
    }

    fn open_upstream(self: &Arc<Self>, key: &QueryKey, epoch: u64) {
        let sink = {
            let weak: Weak<Self> = Arc::downgrade(self);
            let key = key.clone();
            SnapshotSink::new(move |delivery| {
                if let Some(inner) = weak.upgrade() {
                    inner.apply(&key, epoch, delivery);
                }
            })
        };

        debug!(cache = %self.name, query = %key, epoch, "opening upstream subscription");
        let subscription = self.source.subscribe(key, sink);

        // The entry may have been torn down (or recreated) while the
        // upstream was opening; that subscription then has no owner.
        let orphaned = match self.entries.get_mut(key) {
            Some(mut entry) if entry.epoch == epoch && entry.upstream.is_none() => {
                entry.upstream = Some(UpstreamHandle::new(subscription));
                None
            }
            _ => Some(subscription),
        };

        if let Some(subscription) = orphaned {
            debug!(cache = %self.name, query = %key, epoch, "entry closed while opening, cancelling upstream");
            subscription.cancel();
        }
    }

    fn apply(&self, key: &QueryKey, epoch: u64, delivery: Delivery<T>) {
        let (version, snapshot, subscribers) = {
            let Some(mut entry) = self.entries.get_mut(key) else {
                trace!(cache = %self.name, query = %key, epoch, "dropping delivery for closed query");
                return;
            };
            if entry.epoch != epoch {
                trace!(cache = %self.name, query = %key, epoch, current = entry.epoch, "dropping stale delivery");
                return;
            }

            match delivery {
                Delivery::Snapshot(documents) => {
                    entry.data = Snapshot::from(documents);
                    entry.last_error = None;
                }
                Delivery::Error(error) => {
                    warn!(cache = %self.name, query = %key, error = %error, "upstream query failed, serving empty snapshot");
                    entry.data = Snapshot::empty();
                    entry.last_error = Some(error);
                }
            }
            entry.version += 1;

            let subscribers: Vec<_> = entry.subscribers.values().cloned().collect();
            (entry.version, entry.data.clone(), subscribers)
        };

        trace!(
            cache = %self.name,
            query = %key,
            version,
            documents = snapshot.len(),
            subscribers = subscribers.len(),
            "fanning out snapshot"
        );

        for subscriber in subscribers {
            subscriber.deliver(version, snapshot.clone());
        }
    }

    fn detach(&self, key: &QueryKey, id: u64) {
        let emptied = match self.entries.get_mut(key) {
            Some(mut entry) => match entry.subscribers.remove(&id) {
                Some(subscriber) => {
                    subscriber.deactivate();
                    entry.subscribers.is_empty()
                }
                None => false,
            },
            None => false,
        };

        trace!(cache = %self.name, query = %key, subscriber = id, "subscriber detached");

        if !emptied {
            return;
        }

        self.with_lifecycle(key, || {
            if let Some((key, entry)) = self
                .entries
                .remove_if(key, |_, entry| entry.subscribers.is_empty())
            {
                self.close(&key, entry);
            }
        });
    }

    fn close(&self, key: &QueryKey, entry: CacheEntry<T>) {
        for subscriber in entry.subscribers.values() {
            subscriber.deactivate();
        }
        if let Some(upstream) = entry.upstream {
            debug!(cache = %self.name, query = %key, epoch = entry.epoch, "closing upstream subscription");
            upstream.cancel();
        }
    }
}

impl<T> Drop for CacheInner<T> {
    fn drop(&mut self) {
        for (_, entry) in std::mem::take(&mut self.entries) {
            if let Some(upstream) = entry.upstream {
                upstream.cancel();
            }
        }
    }
}

impl<T> fmt::Debug for SharedQueryCache<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedQueryCache")
            .field("name", &self.inner.name)
            .field("entries", &self.inner.entries.len())
            .finish()
    }
}

/// Detaches one observer from a [`SharedQueryCache`].
///
/// Calling [`Detach::detach`] more than once, or dropping the handle after
/// detaching, has no further effect.
#[must_use = "dropping a Detach immediately detaches the observer"]
pub struct Detach {
    action: Mutex<Option<Box<dyn FnOnce() + Send>>>,
}

impl Detach {
    fn new(action: impl FnOnce() + Send + 'static) -> Self {
        Self {
            action: Mutex::new(Some(Box::new(action))),
        }
    }

    /// Remove the observer, closing the upstream if it was the last one.
    pub fn detach(&self) {
        let action = self.action.lock().take();
        if let Some(action) = action {
            action();
        }
    }

    /// Whether this handle has already detached.
    pub fn is_detached(&self) -> bool {
        self.action.lock().is_none()
    }
}

impl Drop for Detach {
    fn drop(&mut self) {
        self.detach();
    }
}

impl fmt::Debug for Detach {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Detach")
            .field("detached", &self.is_detached())
            .finish()
    }
}
