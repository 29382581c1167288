//! The durable key-value seam used by the offline sync layer.
//!
//! Three logical partitions, mirroring the persisted-state contract:
//! `state` keyed by entry key, `pending` keyed by operation id (the
//! store is expected to keep an integer index on `ts`), and `meta` for
//! the restored clock and last-sync marker. Structured values are
//! whole JSON documents tagged with a schema version by the caller.
//!
//! The browser-local store of the original environment is an external
//! collaborator; [`MemoryStore`] is the in-process implementation the
//! tests (and non-durable embedders) use.

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;

/// Version tag written into every persisted record.
pub const SCHEMA_VERSION: u32 = 1;

#[async_trait]
pub trait KvStore: Send + Sync {
    async fn put_state(&self, key: &str, value: Value) -> Result<(), StoreError>;
    async fn get_state(&self, key: &str) -> Result<Option<Value>, StoreError>;
    async fn delete_state(&self, key: &str) -> Result<(), StoreError>;
    async fn all_state(&self) -> Result<Vec<(String, Value)>, StoreError>;

    async fn put_pending(&self, id: &str, value: Value) -> Result<(), StoreError>;
    async fn delete_pending(&self, id: &str) -> Result<(), StoreError>;
    async fn all_pending(&self) -> Result<Vec<Value>, StoreError>;
    async fn count_pending(&self) -> Result<usize, StoreError>;

    async fn put_meta(&self, id: &str, value: Value) -> Result<(), StoreError>;
    async fn get_meta(&self, id: &str) -> Result<Option<Value>, StoreError>;
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    #[error("store backend error: {0}")]
    Backend(String),
}

/// In-memory store: full fidelity for tests and throwaway sessions,
/// no durability across process restarts.
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<HashMap<String, Value>>,
    pending: Mutex<HashMap<String, Value>>,
    meta: Mutex<HashMap<String, Value>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KvStore for MemoryStore {
    async fn put_state(&self, key: &str, value: Value) -> Result<(), StoreError> {
        self.state.lock().insert(key.to_string(), value);
        Ok(())
    }

    async fn get_state(&self, key: &str) -> Result<Option<Value>, StoreError> {
        Ok(self.state.lock().get(key).cloned())
    }

    async fn delete_state(&self, key: &str) -> Result<(), StoreError> {
        self.state.lock().remove(key);
        Ok(())
    }

    async fn all_state(&self) -> Result<Vec<(String, Value)>, StoreError> {
        Ok(self
            .state
            .lock()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    async fn put_pending(&self, id: &str, value: Value) -> Result<(), StoreError> {
        self.pending.lock().insert(id.to_string(), value);
        Ok(())
    }

    async fn delete_pending(&self, id: &str) -> Result<(), StoreError> {
        self.pending.lock().remove(id);
        Ok(())
    }

    async fn all_pending(&self) -> Result<Vec<Value>, StoreError> {
        let mut ops: Vec<Value> = self.pending.lock().values().cloned().collect();
        // Emulates the ts index of a real backend.
        ops.sort_by_key(|op| op.get("ts").and_then(Value::as_i64).unwrap_or(0));
        Ok(ops)
    }

    async fn count_pending(&self) -> Result<usize, StoreError> {
        Ok(self.pending.lock().len())
    }

    async fn put_meta(&self, id: &str, value: Value) -> Result<(), StoreError> {
        self.meta.lock().insert(id.to_string(), value);
        Ok(())
    }

    async fn get_meta(&self, id: &str) -> Result<Option<Value>, StoreError> {
        Ok(self.meta.lock().get(id).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn partitions_are_independent() {
        let store = MemoryStore::new();
        store.put_state("k", json!({"v": 1})).await.unwrap();
        store.put_pending("op1", json!({"ts": 5})).await.unwrap();
        store.put_meta("room", json!({"lastSync": 0})).await.unwrap();

        assert!(store.get_state("op1").await.unwrap().is_none());
        assert_eq!(store.count_pending().await.unwrap(), 1);
        assert!(store.get_meta("room").await.unwrap().is_some());

        store.delete_state("k").await.unwrap();
        assert!(store.get_state("k").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn pending_ordered_by_ts() {
        let store = MemoryStore::new();
        store.put_pending("b", json!({"ts": 30})).await.unwrap();
        store.put_pending("a", json!({"ts": 10})).await.unwrap();
        store.put_pending("c", json!({"ts": 20})).await.unwrap();

        let ops = store.all_pending().await.unwrap();
        let ts: Vec<i64> = ops.iter().map(|o| o["ts"].as_i64().unwrap()).collect();
        assert_eq!(ts, vec![10, 20, 30]);
    }
}
