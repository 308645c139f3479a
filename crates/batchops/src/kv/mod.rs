//! Key/value store abstraction backing the queue and schedule registry
//!
//! The queue and the schedule registry never touch storage directly; they
//! are written against [`KvStore`] so the backing store can be swapped
//! (in-memory for tests and single-node deployments, an external store in
//! production). All coordination relies on `compare_and_swap` as the single
//! atomic primitive.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::errors::{QueueError, QueueResult};

/// Narrow interface over the external key/value store
#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> QueueResult<Option<String>>;

    async fn put(&self, key: &str, value: String) -> QueueResult<()>;

    async fn delete(&self, key: &str) -> QueueResult<()>;

    /// Atomically replace `key` if its current value matches `expected`
    ///
    /// `expected = None` asserts the key is absent; `new = None` deletes.
    /// Returns `true` when the swap was applied.
    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&str>,
        new: Option<String>,
    ) -> QueueResult<bool>;

    /// All entries whose key starts with `prefix`, in lexicographic key order
    async fn scan_prefix(&self, prefix: &str) -> QueueResult<Vec<(String, String)>>;
}

/// In-memory store over a sorted map
///
/// Lexicographic key order makes prefix scans cheap, which the queue leans
/// on for time-ordered delayed entries.
#[derive(Debug, Clone, Default)]
pub struct MemoryKvStore {
    entries: Arc<RwLock<BTreeMap<String, String>>>,
}

impl MemoryKvStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KvStore for MemoryKvStore {
    async fn get(&self, key: &str) -> QueueResult<Option<String>> {
        Ok(self.entries.read().await.get(key).cloned())
    }

    async fn put(&self, key: &str, value: String) -> QueueResult<()> {
        self.entries.write().await.insert(key.to_string(), value);
        Ok(())
    }

    async fn delete(&self, key: &str) -> QueueResult<()> {
        self.entries.write().await.remove(key);
        Ok(())
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&str>,
        new: Option<String>,
    ) -> QueueResult<bool> {
        let mut entries = self.entries.write().await;
        let current = entries.get(key).map(|v| v.as_str());
        if current != expected {
            return Ok(false);
        }
        match new {
            Some(value) => {
                entries.insert(key.to_string(), value);
            }
            None => {
                entries.remove(key);
            }
        }
        Ok(true)
    }

    async fn scan_prefix(&self, prefix: &str) -> QueueResult<Vec<(String, String)>> {
        let entries = self.entries.read().await;
        let range = entries.range::<str, _>((Bound::Included(prefix), Bound::Unbounded));
        Ok(range
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }
}

/// Helper for callers that need a store failure to be transient
pub fn store_unavailable(message: impl Into<String>) -> QueueError {
    QueueError::StoreUnavailable {
        message: message.into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn compare_and_swap_respects_expectations() {
        let store = MemoryKvStore::new();

        // Insert-if-absent succeeds once
        assert!(store
            .compare_and_swap("k", None, Some("v1".into()))
            .await
            .unwrap());
        assert!(!store
            .compare_and_swap("k", None, Some("v2".into()))
            .await
            .unwrap());

        // Swap with correct expectation
        assert!(store
            .compare_and_swap("k", Some("v1"), Some("v2".into()))
            .await
            .unwrap());
        assert_eq!(store.get("k").await.unwrap(), Some("v2".to_string()));

        // Delete-if-matches
        assert!(store.compare_and_swap("k", Some("v2"), None).await.unwrap());
        assert_eq!(store.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn scan_prefix_returns_sorted_matches_only() {
        let store = MemoryKvStore::new();
        store.put("queue:delayed:002:b", "2".into()).await.unwrap();
        store.put("queue:delayed:001:a", "1".into()).await.unwrap();
        store.put("queue:fifo:003:c", "3".into()).await.unwrap();

        let scanned = store.scan_prefix("queue:delayed:").await.unwrap();
        let keys: Vec<_> = scanned.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(keys, vec!["queue:delayed:001:a", "queue:delayed:002:b"]);
    }
}
