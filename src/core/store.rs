use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Latest payload delivered for one endpoint.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Snapshot {
    pub payload: Value,
    pub updated_at: DateTime<Utc>,
    /// Set when the endpoint stopped polling after repeated failures.
    pub stale: bool,
}

#[derive(Clone, Default)]
pub struct SnapshotStore {
    snapshots: Arc<RwLock<HashMap<String, Snapshot>>>,
}

impl SnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores `payload` for `uri`. Returns `false` when it equals what was
    /// already held.
    pub async fn update_snapshot(&self, uri: &str, payload: Value) -> bool {
        let mut snapshots = self.snapshots.write().await;
        if let Some(existing) = snapshots.get_mut(uri) {
            let was_stale = existing.stale;
            existing.stale = false;
            if existing.payload == payload {
                return was_stale;
            }
            existing.payload = payload;
            existing.updated_at = Utc::now();
            return true;
        }

        snapshots.insert(
            uri.to_string(),
            Snapshot {
                payload,
                updated_at: Utc::now(),
                stale: false,
            },
        );
        true
    }

    pub async fn get_snapshot(&self, uri: &str) -> Option<Snapshot> {
        self.snapshots.read().await.get(uri).cloned()
    }

    pub async fn mark_stale(&self, uri: &str) {
        if let Some(snapshot) = self.snapshots.write().await.get_mut(uri) {
            snapshot.stale = true;
        }
    }

    pub async fn clear(&self) {
        self.snapshots.write().await.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_store_update_and_get() {
        let store = SnapshotStore::new();
        assert!(store.update_snapshot("adapters", json!([{"name": "a"}])).await);

        let snapshot = store.get_snapshot("adapters").await.unwrap();
        assert_eq!(snapshot.payload, json!([{"name": "a"}]));
        assert!(!snapshot.stale);
        assert!(store.get_snapshot("missing").await.is_none());
    }

    #[tokio::test]
    async fn test_identical_payload_is_not_a_change() {
        let store = SnapshotStore::new();
        store.update_snapshot("adapters", json!({"a": 1})).await;
        let first = store.get_snapshot("adapters").await.unwrap();

        assert!(!store.update_snapshot("adapters", json!({"a": 1})).await);
        assert_eq!(
            store.get_snapshot("adapters").await.unwrap().updated_at,
            first.updated_at
        );
        assert!(store.update_snapshot("adapters", json!({"a": 2})).await);
    }

    #[tokio::test]
    async fn test_stale_cleared_by_next_update() {
        let store = SnapshotStore::new();
        store.update_snapshot("adapters", json!({"a": 1})).await;
        store.mark_stale("adapters").await;
        assert!(store.get_snapshot("adapters").await.unwrap().stale);

        // Same payload, but recovering from stale counts as a change.
        assert!(store.update_snapshot("adapters", json!({"a": 1})).await);
        assert!(!store.get_snapshot("adapters").await.unwrap().stale);

        store.mark_stale("missing").await;
        assert!(store.get_snapshot("missing").await.is_none());
    }

    #[tokio::test]
    async fn test_clear_drops_every_snapshot() {
        let store = SnapshotStore::new();
        store.update_snapshot("adapters", json!(1)).await;
        store.update_snapshot("server/warnings", json!(2)).await;

        store.clear().await;
        assert!(store.get_snapshot("adapters").await.is_none());
        assert!(store.get_snapshot("server/warnings").await.is_none());
    }
}
