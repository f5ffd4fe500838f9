//! Cluster-visible key-value store.
//!
//! Servers publish their endpoint addresses here and read each other's.
//! The store also provides the collective barrier the address directory
//! uses as its fence: every rank of the job must enter a barrier scope
//! before any rank leaves it.
//!
//! [`MemoryKeyValueStore`] keeps everything in process memory. A single
//! instance shared by several simulated ranks behaves like the job-wide
//! store; a server running alone uses it with a job size of one.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::Barrier;

use crate::KeyValError;

/// Provider trait for the cluster key-value store.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Store `value` under `key`, replacing any previous value.
    async fn put(&self, key: &str, value: &str) -> Result<(), KeyValError>;

    /// Read the value under `key`.
    async fn get(&self, key: &str) -> Result<Option<String>, KeyValError>;

    /// Remove `key`. Removing an absent key succeeds.
    async fn remove(&self, key: &str) -> Result<(), KeyValError>;

    /// Block until every rank of the job has entered the barrier `scope`.
    async fn barrier(&self, scope: &str) -> Result<(), KeyValError>;
}

/// In-process key-value store shared by the ranks of one job.
#[derive(Clone)]
pub struct MemoryKeyValueStore {
    inner: Arc<MemoryStoreInner>,
}

struct MemoryStoreInner {
    job_size: usize,
    entries: Mutex<HashMap<String, String>>,
    barriers: Mutex<HashMap<String, Arc<Barrier>>>,
}

impl MemoryKeyValueStore {
    /// Create a store for a job of `job_size` ranks.
    pub fn new(job_size: usize) -> Self {
        Self {
            inner: Arc::new(MemoryStoreInner {
                job_size: job_size.max(1),
                entries: Mutex::new(HashMap::new()),
                barriers: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Number of ranks each barrier waits for.
    pub fn job_size(&self) -> usize {
        self.inner.job_size
    }

    /// Number of keys currently stored.
    pub fn len(&self) -> usize {
        self.inner
            .entries
            .lock()
            .map(|entries| entries.len())
            .unwrap_or(0)
    }

    /// Whether the store holds no keys.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn poisoned() -> KeyValError {
        KeyValError::Unavailable("store lock poisoned".to_string())
    }

    fn barrier_for(&self, scope: &str) -> Result<Arc<Barrier>, KeyValError> {
        let mut barriers = self.inner.barriers.lock().map_err(|_| Self::poisoned())?;
        let barrier = barriers
            .entry(scope.to_string())
            .or_insert_with(|| Arc::new(Barrier::new(self.inner.job_size)));
        Ok(Arc::clone(barrier))
    }
}

#[async_trait]
impl KeyValueStore for MemoryKeyValueStore {
    async fn put(&self, key: &str, value: &str) -> Result<(), KeyValError> {
        let mut entries = self.inner.entries.lock().map_err(|_| Self::poisoned())?;
        entries.insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, KeyValError> {
        let entries = self.inner.entries.lock().map_err(|_| Self::poisoned())?;
        Ok(entries.get(key).cloned())
    }

    async fn remove(&self, key: &str) -> Result<(), KeyValError> {
        let mut entries = self.inner.entries.lock().map_err(|_| Self::poisoned())?;
        entries.remove(key);
        Ok(())
    }

    async fn barrier(&self, scope: &str) -> Result<(), KeyValError> {
        // Barrier generations reset automatically, so a scope can be fenced
        // again later (e.g. after a rank republishes).
        let barrier = self.barrier_for(scope)?;
        barrier.wait().await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_put_get_remove() {
        let store = MemoryKeyValueStore::new(1);
        assert_eq!(store.get("k").await.expect("get"), None);

        store.put("k", "v1").await.expect("put");
        store.put("k", "v2").await.expect("put");
        assert_eq!(store.get("k").await.expect("get"), Some("v2".to_string()));
        assert_eq!(store.len(), 1);

        store.remove("k").await.expect("remove");
        store.remove("k").await.expect("remove twice");
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_single_rank_barrier_returns_immediately() {
        let store = MemoryKeyValueStore::new(1);
        store.barrier("scope").await.expect("barrier");
        store.barrier("scope").await.expect("second generation");
    }

    #[tokio::test(start_paused = true)]
    async fn test_barrier_waits_for_every_rank() {
        let store = MemoryKeyValueStore::new(2);

        let early = tokio::spawn({
            let store = store.clone();
            async move { store.barrier("fence").await }
        });

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(!early.is_finished(), "barrier released with one rank missing");

        store.barrier("fence").await.expect("second rank");
        early.await.expect("join").expect("first rank");
    }

    #[tokio::test]
    async fn test_barrier_scopes_are_independent() {
        let store = MemoryKeyValueStore::new(2);
        let a = tokio::spawn({
            let store = store.clone();
            async move { store.barrier("a").await }
        });
        let b = tokio::spawn({
            let store = store.clone();
            async move { store.barrier("b").await }
        });
        store.barrier("a").await.expect("a");
        store.barrier("b").await.expect("b");
        a.await.expect("join a").expect("a");
        b.await.expect("join b").expect("b");
    }
}
