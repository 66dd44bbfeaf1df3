//! Tests for the concurrent container store.

use chrono::{Duration as ChronoDuration, Utc};
use magikoci::{Container, ContainerConfig, ContainerStatus, ContainerStore};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

fn container(id: &str, age_secs: i64) -> Arc<Container> {
    Arc::new(
        Container::new(ContainerConfig {
            id: id.to_string(),
            name: id.to_string(),
            created: Some(Utc::now() - ChronoDuration::seconds(age_secs)),
            ..Default::default()
        })
        .unwrap(),
    )
}

// =============================================================================
// Basic Operations
// =============================================================================

#[test]
fn test_add_get_delete() {
    let store = ContainerStore::new();
    store.add(container("a", 0)).unwrap();
    assert_eq!(store.size(), 1);
    assert_eq!(store.get("a").unwrap().id(), "a");
    assert!(store.get("b").is_none());

    assert!(store.delete("a").is_some());
    assert!(store.delete("a").is_none());
    assert_eq!(store.size(), 0);
}

#[test]
fn test_add_replaces_same_id() {
    let store = ContainerStore::new();
    store.add(container("a", 10)).unwrap();
    let newer = container("a", 0);
    store.add(Arc::clone(&newer)).unwrap();
    assert_eq!(store.size(), 1);
    assert!(Arc::ptr_eq(&store.get("a").unwrap(), &newer));
}

#[test]
fn test_list_oldest_first() {
    let store = ContainerStore::new();
    store.add(container("middle", 20)).unwrap();
    store.add(container("newest", 1)).unwrap();
    store.add(container("oldest", 300)).unwrap();

    let ids: Vec<String> = store.list().iter().map(|c| c.id().to_string()).collect();
    assert_eq!(ids, ["oldest", "middle", "newest"]);
}

#[test]
fn test_first_matching() {
    let store = ContainerStore::new();
    store.add(container("web-2", 5)).unwrap();
    store.add(container("web-1", 50)).unwrap();
    store.add(container("db", 500)).unwrap();

    let found = store.first(|c| c.id().starts_with("web")).unwrap();
    assert_eq!(found.id(), "web-1");
    assert!(store.first(|c| c.id() == "cache").is_none());
}

// =============================================================================
// ApplyAll
// =============================================================================

#[tokio::test]
async fn test_apply_all_visits_every_entry() {
    let store = ContainerStore::new();
    for i in 0..10 {
        store.add(container(&format!("c{}", i), i)).unwrap();
    }

    let visited = AtomicUsize::new(0);
    store
        .apply_all(|c| {
            let visited = &visited;
            async move {
                c.update_state(|s| {
                    s.transition(ContainerStatus::Running);
                })
                .unwrap();
                visited.fetch_add(1, Ordering::SeqCst);
            }
        })
        .await;

    assert_eq!(visited.load(Ordering::SeqCst), 10);
    assert!(
        store
            .list()
            .iter()
            .all(|c| c.status().unwrap() == ContainerStatus::Running)
    );
}

// =============================================================================
// Concurrency
// =============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_access_is_consistent() {
    let store = Arc::new(ContainerStore::new());
    let mut tasks = Vec::new();
    for worker in 0..8 {
        let store = Arc::clone(&store);
        tasks.push(tokio::spawn(async move {
            for i in 0..50 {
                let id = format!("w{}-{}", worker, i);
                store.add(container(&id, 0)).unwrap();
                assert!(store.get(&id).is_some());
                let _ = store.list();
                if i % 2 == 0 {
                    assert!(store.delete(&id).is_some());
                }
                tokio::task::yield_now().await;
            }
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }
    assert_eq!(store.size(), 8 * 25);
    assert_eq!(store.list().len(), 8 * 25);
}
