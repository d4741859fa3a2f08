//! The upstream seam: what the cache needs from a live document store.
//!
//! A store opens a live query with [`QuerySource::subscribe`], pushes full
//! snapshots (never deltas) or errors into the [`SnapshotSink`] it was
//! handed, and stops when the returned [`Subscription`] is cancelled.

use std::fmt;
use std::ops::Deref;
use std::sync::Arc;

use crate::{QueryKey, UpstreamError};

/// A record together with the stable identity assigned by the store.
#[derive(Debug, Clone, PartialEq)]
pub struct Document<T> {
    pub id: String,
    pub data: T,
}

impl<T> Document<T> {
    pub fn new(id: impl Into<String>, data: T) -> Self {
        Self {
            id: id.into(),
            data,
        }
    }
}

/// An immutable, shared snapshot of a query result in upstream order.
///
/// Cloning is a reference-count bump, so every subscriber of one delivery
/// holds the same allocation.
pub struct Snapshot<T>(Arc<[Document<T>]>);

impl<T> Snapshot<T> {
    /// The empty snapshot (no data yet, torn down, or degraded after an error).
    pub fn empty() -> Self {
        Self(Arc::from(Vec::new()))
    }

    /// Whether two snapshots are the same delivery.
    pub fn ptr_eq(a: &Self, b: &Self) -> bool {
        Arc::ptr_eq(&a.0, &b.0)
    }

    /// The documents in upstream order.
    pub fn documents(&self) -> &[Document<T>] {
        &self.0
    }

    /// Document ids in upstream order.
    pub fn ids(&self) -> Vec<&str> {
        self.0.iter().map(|doc| doc.id.as_str()).collect()
    }
}

impl<T> Clone for Snapshot<T> {
    fn clone(&self) -> Self {
        Self(Arc::clone(&self.0))
    }
}

impl<T> Default for Snapshot<T> {
    fn default() -> Self {
        Self::empty()
    }
}

impl<T> Deref for Snapshot<T> {
    type Target = [Document<T>];

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl<T> From<Vec<Document<T>>> for Snapshot<T> {
    fn from(documents: Vec<Document<T>>) -> Self {
        Self(Arc::from(documents))
    }
}

impl<T: fmt::Debug> fmt::Debug for Snapshot<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.0.iter()).finish()
    }
}

/// One push from an upstream live query.
#[derive(Debug, Clone)]
pub enum Delivery<T> {
    /// A full result set, already ordered.
    Snapshot(Vec<Document<T>>),
    /// The query reported a fault.
    Error(UpstreamError),
}

/// Receiving end handed to a [`QuerySource`] for one live query.
///
/// Cheap to clone and safe to call from any thread.
pub struct SnapshotSink<T> {
    deliver: Arc<dyn Fn(Delivery<T>) + Send + Sync>,
}

impl<T> SnapshotSink<T> {
    /// Build a sink from a delivery handler.
    pub fn new(deliver: impl Fn(Delivery<T>) + Send + Sync + 'static) -> Self {
        Self {
            deliver: Arc::new(deliver),
        }
    }

    /// Push a delivery.
    pub fn deliver(&self, delivery: Delivery<T>) {
        (self.deliver)(delivery)
    }

    /// Push a full snapshot.
    pub fn snapshot(&self, documents: Vec<Document<T>>) {
        self.deliver(Delivery::Snapshot(documents))
    }

    /// Report an upstream fault.
    pub fn error(&self, error: UpstreamError) {
        self.deliver(Delivery::Error(error))
    }
}

impl<T: 'static> SnapshotSink<T> {
    /// Adapt this sink to accept documents of another type.
    ///
    /// `convert` runs per document; returning `None` drops the document from
    /// the snapshot. Errors pass through untouched.
    pub fn map_documents<U, F>(self, convert: F) -> SnapshotSink<U>
    where
        U: 'static,
        F: Fn(Document<U>) -> Option<Document<T>> + Send + Sync + 'static,
    {
        SnapshotSink::new(move |delivery: Delivery<U>| match delivery {
            Delivery::Snapshot(documents) => {
                self.snapshot(documents.into_iter().filter_map(&convert).collect())
            }
            Delivery::Error(error) => self.error(error),
        })
    }
}

impl<T> Clone for SnapshotSink<T> {
    fn clone(&self) -> Self {
        Self {
            deliver: Arc::clone(&self.deliver),
        }
    }
}

impl<T> fmt::Debug for SnapshotSink<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SnapshotSink").finish_non_exhaustive()
    }
}

/// Handle to an open upstream live query.
///
/// `cancel` consumes the handle, so a subscription can be cancelled at most once.
pub trait Subscription: Send {
    /// Stop deliveries and release upstream resources.
    fn cancel(self: Box<Self>);
}

impl<F> Subscription for F
where
    F: FnOnce() + Send + 'static,
{
    fn cancel(self: Box<Self>) {
        (*self)()
    }
}

/// A store that can open live queries.
pub trait QuerySource<T>: Send + Sync {
    /// Open a live query for `key`, pushing results into `sink` until the
    /// returned subscription is cancelled.
    ///
    /// Implementations may deliver synchronously from inside this call.
    fn subscribe(&self, key: &QueryKey, sink: SnapshotSink<T>) -> Box<dyn Subscription>;
}

impl<T, S> QuerySource<T> for Arc<S>
where
    S: QuerySource<T> + ?Sized,
{
    fn subscribe(&self, key: &QueryKey, sink: SnapshotSink<T>) -> Box<dyn Subscription> {
        (**self).subscribe(key, sink)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn test_snapshot_clone_shares_allocation() {
        let snapshot = Snapshot::from(vec![Document::new("a", 1), Document::new("b", 2)]);
        let clone = snapshot.clone();
        assert!(Snapshot::ptr_eq(&snapshot, &clone));
        assert_eq!(clone.ids(), vec!["a", "b"]);
        assert_eq!(clone[1].data, 2);
    }

    #[test]
    fn test_empty_snapshots_are_distinct_deliveries() {
        let a: Snapshot<u32> = Snapshot::empty();
        let b: Snapshot<u32> = Snapshot::empty();
        assert!(a.is_empty());
        assert!(!Snapshot::ptr_eq(&a, &b));
    }

    #[test]
    fn test_map_documents_filters_and_converts() {
        let seen: Arc<Mutex<Vec<Delivery<u32>>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = {
            let seen = Arc::clone(&seen);
            SnapshotSink::new(move |delivery| seen.lock().unwrap().push(delivery))
        };

        let raw: SnapshotSink<&'static str> = sink.map_documents(|doc: Document<&'static str>| {
            doc.data
                .parse::<u32>()
                .ok()
                .map(|n| Document::new(doc.id, n))
        });

        raw.snapshot(vec![
            Document::new("a", "1"),
            Document::new("b", "not a number"),
            Document::new("c", "3"),
        ]);
        raw.error(UpstreamError::Connection("dropped".to_string()));

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 2);
        match &seen[0] {
            Delivery::Snapshot(docs) => {
                assert_eq!(docs, &vec![Document::new("a", 1), Document::new("c", 3)])
            }
            other => panic!("expected snapshot, got {:?}", other),
        }
        assert!(matches!(&seen[1], Delivery::Error(UpstreamError::Connection(_))));
    }

    #[test]
    fn test_closure_subscription_runs_once_on_cancel() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        let cancels = Arc::new(AtomicUsize::new(0));
        let subscription: Box<dyn Subscription> = {
            let cancels = Arc::clone(&cancels);
            Box::new(move || {
                cancels.fetch_add(1, Ordering::SeqCst);
            })
        };
        subscription.cancel();
        assert_eq!(cancels.load(Ordering::SeqCst), 1);
    }
}
