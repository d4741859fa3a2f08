//! Typed live queries over a raw JSON source.

use std::any::type_name;
use std::marker::PhantomData;

use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::warn;

use tipster_live::{Document, QueryKey, QuerySource, SnapshotSink, Subscription};

/// Decodes every document of a raw source into `T`.
///
/// Documents that do not decode are left out of the snapshot and logged.
pub struct Decoded<S, T> {
    source: S,
    _record: PhantomData<fn() -> T>,
}

impl<S, T> Decoded<S, T> {
    pub fn new(source: S) -> Self {
        Self {
            source,
            _record: PhantomData,
        }
    }

    /// The wrapped source.
    pub fn inner(&self) -> &S {
        &self.source
    }
}

impl<S, T> QuerySource<T> for Decoded<S, T>
where
    S: QuerySource<Value>,
    T: DeserializeOwned + Send + Sync + 'static,
{
    fn subscribe(&self, key: &QueryKey, sink: SnapshotSink<T>) -> Box<dyn Subscription> {
        let query = key.clone();
        let raw = sink.map_documents(move |doc: Document<Value>| {
            match serde_json::from_value::<T>(doc.data) {
                Ok(data) => Some(Document::new(doc.id, data)),
                Err(e) => {
                    warn!(
                        query = %query,
                        id = %doc.id,
                        record = type_name::<T>(),
                        error = %e,
                        "skipping document that failed to decode"
                    );
                    None
                }
            }
        });
        self.source.subscribe(key, raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Game, MemoryStore};
    use parking_lot::Mutex;
    use serde_json::json;
    use std::sync::Arc;
    use tipster_live::Delivery;

    #[test]
    fn test_undecodable_documents_are_skipped() {
        let store = MemoryStore::new();
        store.insert(
            "games",
            "good",
            json!({"fixture": "A vs B", "time": "18:00", "prediction": "Home win"}),
        );
        store.insert("games", "bad", json!({"fixture": 12}));

        let seen: Arc<Mutex<Vec<Delivery<Game>>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = {
            let seen = Arc::clone(&seen);
            SnapshotSink::new(move |delivery| seen.lock().push(delivery))
        };

        let games: Decoded<_, Game> = Decoded::new(store.clone());
        let subscription = games.subscribe(&QueryKey::collection("games"), sink);

        {
            let seen = seen.lock();
            match &seen[0] {
                Delivery::Snapshot(docs) => {
                    assert_eq!(docs.len(), 1);
                    assert_eq!(docs[0].id, "good");
                    assert_eq!(docs[0].data.prediction, "Home win");
                }
                other => panic!("expected snapshot, got {:?}", other),
            }
        }

        subscription.cancel();
        assert_eq!(games.inner().listener_count(), 0);
    }
}
