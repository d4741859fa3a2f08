//! Write side of the document store.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use tipster_live::Document;

use crate::StoreError;

/// Create/update/delete access to the remote document store.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Create a document, returning the id the store assigned.
    async fn create(&self, collection: &str, record: Value) -> Result<String, StoreError>;

    /// Merge `patch` into an existing document.
    async fn update(&self, collection: &str, id: &str, patch: Value) -> Result<(), StoreError>;

    /// Delete a document.
    async fn delete(&self, collection: &str, id: &str) -> Result<(), StoreError>;

    /// Fetch one document.
    async fn get(&self, collection: &str, id: &str) -> Result<Document<Value>, StoreError>;
}

/// Document as it appears in store responses and listener frames.
#[derive(Debug, Deserialize)]
pub(crate) struct WireDocument {
    pub id: String,
    #[serde(default)]
    pub data: Value,
}

impl From<WireDocument> for Document<Value> {
    fn from(wire: WireDocument) -> Self {
        Document::new(wire.id, wire.data)
    }
}

/// Shallow merge of a JSON patch into a stored record.
pub(crate) fn merge_patch(target: &mut Value, patch: Value) {
    match (target, patch) {
        (Value::Object(target), Value::Object(patch)) => {
            for (key, value) in patch {
                target.insert(key, value);
            }
        }
        (target, patch) => *target = patch,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_merge_patch_overwrites_fields() {
        let mut record = json!({"fixture": "A vs B", "active": true});
        merge_patch(&mut record, json!({"active": false}));
        assert_eq!(record, json!({"fixture": "A vs B", "active": false}));
    }

    #[test]
    fn test_merge_patch_replaces_non_objects() {
        let mut record = json!(42);
        merge_patch(&mut record, json!({"active": false}));
        assert_eq!(record, json!({"active": false}));
    }
}
