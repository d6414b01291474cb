//! In-memory release store
//!
//! Useful for unit tests and dry runs without a Kubernetes cluster.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use rudder_core::Release;
use tokio::sync::RwLock;

use super::{ReleaseFilter, ReleaseStore, release_labels};
use crate::error::{KubeError, Result};

/// In-memory release store
#[derive(Clone)]
pub struct MemoryStore {
    releases: Arc<RwLock<BTreeMap<String, Release>>>,
    owner: String,
    counts: Arc<Counters>,
    fail_updates: Arc<AtomicBool>,
}

#[derive(Default)]
struct Counters {
    gets: AtomicUsize,
    lists: AtomicUsize,
    creates: AtomicUsize,
    updates: AtomicUsize,
    deletes: AtomicUsize,
}

/// Counts of operations performed, for test assertions
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct OperationCounts {
    pub gets: usize,
    pub lists: usize,
    pub creates: usize,
    pub updates: usize,
    pub deletes: usize,
}

impl MemoryStore {
    /// Create an empty store owned by `rudder`
    pub fn new() -> Self {
        Self::with_owner("rudder")
    }

    pub fn with_owner(owner: impl Into<String>) -> Self {
        Self {
            releases: Arc::new(RwLock::new(BTreeMap::new())),
            owner: owner.into(),
            counts: Arc::new(Counters::default()),
            fail_updates: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Make every `update` fail until switched off
    pub fn set_fail_updates(&self, fail: bool) {
        self.fail_updates.store(fail, Ordering::SeqCst);
    }

    pub fn operation_counts(&self) -> OperationCounts {
        OperationCounts {
            gets: self.counts.gets.load(Ordering::SeqCst),
            lists: self.counts.lists.load(Ordering::SeqCst),
            creates: self.counts.creates.load(Ordering::SeqCst),
            updates: self.counts.updates.load(Ordering::SeqCst),
            deletes: self.counts.deletes.load(Ordering::SeqCst),
        }
    }

    /// Every stored revision, ordered by key
    pub async fn all_releases(&self) -> Vec<Release> {
        self.releases.read().await.values().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.releases.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.releases.read().await.is_empty()
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

fn not_found(key: &str) -> KubeError {
    let name = key.rsplit_once(".v").map(|(n, _)| n).unwrap_or(key);
    KubeError::ReleaseNotFound {
        name: name.to_string(),
    }
}

#[async_trait]
impl ReleaseStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Release> {
        self.counts.gets.fetch_add(1, Ordering::SeqCst);
        self.releases
            .read()
            .await
            .get(key)
            .cloned()
            .ok_or_else(|| not_found(key))
    }

    async fn list(&self, filter: ReleaseFilter<'_>) -> Result<Vec<Release>> {
        self.counts.lists.fetch_add(1, Ordering::SeqCst);
        Ok(self
            .releases
            .read()
            .await
            .values()
            .filter(|r| filter(*r))
            .cloned()
            .collect())
    }

    async fn query(&self, labels: &BTreeMap<String, String>) -> Result<Vec<Release>> {
        self.counts.lists.fetch_add(1, Ordering::SeqCst);
        Ok(self
            .releases
            .read()
            .await
            .values()
            .filter(|r| {
                let have = release_labels(r, &self.owner);
                labels.iter().all(|(k, v)| have.get(k) == Some(v))
            })
            .cloned()
            .collect())
    }

    async fn create(&self, key: &str, release: &Release) -> Result<()> {
        self.counts.creates.fetch_add(1, Ordering::SeqCst);
        let mut releases = self.releases.write().await;
        if releases.contains_key(key) {
            return Err(KubeError::ReleaseAlreadyExists {
                key: key.to_string(),
            });
        }
        releases.insert(key.to_string(), release.clone());
        Ok(())
    }

    async fn update(&self, key: &str, release: &Release) -> Result<()> {
        self.counts.updates.fetch_add(1, Ordering::SeqCst);
        if self.fail_updates.load(Ordering::SeqCst) {
            return Err(KubeError::Storage(format!("update of {} rejected", key)));
        }
        let mut releases = self.releases.write().await;
        match releases.get_mut(key) {
            Some(slot) => {
                *slot = release.clone();
                Ok(())
            }
            None => Err(not_found(key)),
        }
    }

    async fn delete(&self, key: &str) -> Result<Release> {
        self.counts.deletes.fetch_add(1, Ordering::SeqCst);
        self.releases
            .write()
            .await
            .remove(key)
            .ok_or_else(|| not_found(key))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use rudder_core::{Chart, Status, Values};

    fn release(name: &str, version: u32, status: Status) -> Release {
        Release::new(
            name,
            "default",
            version,
            Chart::new("hello", "0.1.0").unwrap(),
            Values::new(),
            status,
            Utc::now(),
        )
    }

    #[tokio::test]
    async fn test_create_rejects_duplicate_key() {
        let store = MemoryStore::new();
        let r = release("r1", 1, Status::PendingInstall);

        store.create(&r.key(), &r).await.unwrap();
        let err = store.create(&r.key(), &r).await.unwrap_err();
        assert!(matches!(err, KubeError::ReleaseAlreadyExists { key } if key == "r1.v1"));
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn test_update_missing_is_not_found() {
        let store = MemoryStore::new();
        let r = release("r1", 1, Status::Deployed);
        let err = store.update(&r.key(), &r).await.unwrap_err();
        assert!(matches!(err, KubeError::ReleaseNotFound { name } if name == "r1"));
    }

    #[tokio::test]
    async fn test_query_by_labels() {
        let store = MemoryStore::new();
        for r in [
            release("r1", 1, Status::Superseded),
            release("r1", 2, Status::Deployed),
            release("r2", 1, Status::Deployed),
        ] {
            store.create(&r.key(), &r).await.unwrap();
        }

        let deployed = store
            .query(&BTreeMap::from([("status".to_string(), "deployed".to_string())]))
            .await
            .unwrap();
        assert_eq!(deployed.len(), 2);

        let foreign = store
            .query(&BTreeMap::from([("owner".to_string(), "helm".to_string())]))
            .await
            .unwrap();
        assert!(foreign.is_empty());
    }

    #[tokio::test]
    async fn test_list_with_predicate_and_counts() {
        let store = MemoryStore::new();
        let r = release("r1", 1, Status::Failed);
        store.create(&r.key(), &r).await.unwrap();

        let failed = store
            .list(&|r: &Release| r.status() == Status::Failed)
            .await
            .unwrap();
        assert_eq!(failed.len(), 1);

        let deleted = store.delete("r1.v1").await.unwrap();
        assert_eq!(deleted.version, 1);
        assert!(store.is_empty().await);

        let counts = store.operation_counts();
        assert_eq!(counts.creates, 1);
        assert_eq!(counts.lists, 1);
        assert_eq!(counts.deletes, 1);
    }

    #[tokio::test]
    async fn test_fail_updates() {
        let store = MemoryStore::new();
        let r = release("r1", 1, Status::Deployed);
        store.create(&r.key(), &r).await.unwrap();

        store.set_fail_updates(true);
        assert!(store.update(&r.key(), &r).await.is_err());
        store.set_fail_updates(false);
        assert!(store.update(&r.key(), &r).await.is_ok());
    }
}
