//! Concurrent in-memory container registry.

use crate::container::Container;
use crate::error::{Error, Result};
use futures::future::join_all;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, RwLock};

/// Maps container IDs to containers behind a single read-write lock.
///
/// The lock only protects the map. Each [`Container`] guards its own
/// fields, so [`ContainerStore::apply_all`] can run a reducer on every
/// entry at once.
#[derive(Debug, Default)]
pub struct ContainerStore {
    containers: RwLock<HashMap<String, Arc<Container>>>,
}

impl ContainerStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a container under its ID, replacing any previous entry.
    pub fn add(&self, container: Arc<Container>) -> Result<()> {
        let mut containers = self
            .containers
            .write()
            .map_err(|e| Error::Internal(format!("lock poisoned: {}", e)))?;
        containers.insert(container.id().to_string(), container);
        Ok(())
    }

    /// Looks up a container by ID.
    pub fn get(&self, id: &str) -> Option<Arc<Container>> {
        self.containers.read().ok()?.get(id).cloned()
    }

    /// Removes a container, returning it if it was present.
    pub fn delete(&self, id: &str) -> Option<Arc<Container>> {
        self.containers.write().ok()?.remove(id)
    }

    pub fn size(&self) -> usize {
        self.containers.read().map(|c| c.len()).unwrap_or(0)
    }

    /// All containers, oldest first.
    pub fn list(&self) -> Vec<Arc<Container>> {
        let mut keyed: Vec<_> = self
            .snapshot()
            .into_iter()
            .map(|c| (c.created_at().unwrap_or_default(), c))
            .collect();
        keyed.sort_by(|a, b| a.0.cmp(&b.0));
        keyed.into_iter().map(|(_, c)| c).collect()
    }

    /// First container, in creation order, that matches `filter`.
    pub fn first(&self, filter: impl Fn(&Container) -> bool) -> Option<Arc<Container>> {
        self.list().into_iter().find(|c| filter(c))
    }

    /// Runs `reducer` on a snapshot of all entries concurrently.
    ///
    /// There is no ordering across entries. The reducer must not add or
    /// delete store entries; it sees the snapshot taken on entry.
    pub async fn apply_all<F, Fut>(&self, reducer: F)
    where
        F: Fn(Arc<Container>) -> Fut,
        Fut: Future<Output = ()>,
    {
        join_all(self.snapshot().into_iter().map(reducer)).await;
    }

    fn snapshot(&self) -> Vec<Arc<Container>> {
        self.containers
            .read()
            .map(|c| c.values().cloned().collect())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::ContainerConfig;
    use chrono::{Duration as ChronoDuration, Utc};

    fn container(id: &str, age_secs: i64) -> Arc<Container> {
        Arc::new(
            Container::new(ContainerConfig {
                id: id.to_string(),
                created: Some(Utc::now() - ChronoDuration::seconds(age_secs)),
                ..Default::default()
            })
            .unwrap(),
        )
    }

    #[test]
    fn test_list_is_oldest_first() {
        let store = ContainerStore::new();
        store.add(container("young", 1)).unwrap();
        store.add(container("old", 100)).unwrap();
        store.add(container("middle", 50)).unwrap();
        let ids: Vec<_> = store.list().iter().map(|c| c.id().to_string()).collect();
        assert_eq!(ids, vec!["old", "middle", "young"]);
    }

    #[test]
    fn test_first_matching() {
        let store = ContainerStore::new();
        store.add(container("a1", 10)).unwrap();
        store.add(container("b1", 20)).unwrap();
        let found = store.first(|c| c.id().starts_with('a')).unwrap();
        assert_eq!(found.id(), "a1");
        assert!(store.first(|c| c.id() == "zzz").is_none());
    }
}
