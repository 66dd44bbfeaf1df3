//! Tests for the spoofed back-end.

use magikoci::{
    Container, ContainerStatus, Error, LinuxResources, RuntimeImpl, Signal, SpoofedRuntime,
    StreamOptions,
};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

fn spoofed(tmp: &TempDir, id: &str) -> Arc<Container> {
    Arc::new(Container::new_spoofed(id, id, HashMap::new(), id, tmp.path()).unwrap())
}

async fn wait_until_dead(c: &Container) {
    for _ in 0..50 {
        if !c.is_alive() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("placeholder of {} still alive", c.id());
}

// =============================================================================
// Lifecycle
// =============================================================================

#[tokio::test]
async fn test_full_lifecycle() {
    let tmp = TempDir::new().unwrap();
    let rt = SpoofedRuntime::new("spoofed");
    let c = spoofed(&tmp, "infra");

    rt.create_container(&c, "").await.unwrap();
    assert!(c.is_created());
    assert!(c.is_alive());
    assert_eq!(rt.placeholder_count(), 1);

    rt.start_container(&c).await.unwrap();
    assert_eq!(c.status().unwrap(), ContainerStatus::Running);

    rt.pause_container(&c).await.unwrap();
    assert_eq!(c.status().unwrap(), ContainerStatus::Paused);
    rt.unpause_container(&c).await.unwrap();
    assert_eq!(c.status().unwrap(), ContainerStatus::Running);

    rt.stop_container(&c, Duration::from_secs(10)).await.unwrap();
    let state = c.state().unwrap();
    assert_eq!(state.status, ContainerStatus::Stopped);
    assert_eq!(state.exit_code, Some(0));
    assert!(state.finished.is_some());
    assert!(!c.is_alive());
    assert_eq!(rt.placeholder_count(), 0);

    let err = rt.stop_container(&c, Duration::from_secs(10)).await.unwrap_err();
    assert!(err.is_already_stopped());

    rt.delete_container(&c).await.unwrap();
}

#[tokio::test]
async fn test_stop_paused_is_refused() {
    let tmp = TempDir::new().unwrap();
    let rt = SpoofedRuntime::new("spoofed");
    let c = spoofed(&tmp, "paused");
    rt.create_container(&c, "").await.unwrap();
    rt.start_container(&c).await.unwrap();
    rt.pause_container(&c).await.unwrap();

    let err = rt.stop_container(&c, Duration::ZERO).await.unwrap_err();
    assert!(matches!(err, Error::InvalidState { .. }));
    assert!(c.is_alive());
    rt.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_status_detects_dead_placeholder() {
    let tmp = TempDir::new().unwrap();
    let rt = SpoofedRuntime::new("spoofed");
    let c = spoofed(&tmp, "victim");
    rt.create_container(&c, "").await.unwrap();
    rt.start_container(&c).await.unwrap();

    rt.update_container_status(&c).await.unwrap();
    assert_eq!(c.status().unwrap(), ContainerStatus::Running);

    rt.signal_container(&c, Signal::KILL).await.unwrap();
    wait_until_dead(&c).await;

    rt.update_container_status(&c).await.unwrap();
    let state = c.state().unwrap();
    assert_eq!(state.status, ContainerStatus::Stopped);
    assert_eq!(state.exit_code, Some(0));
    rt.delete_container(&c).await.unwrap();
}

// =============================================================================
// Fabricated Operations
// =============================================================================

#[tokio::test]
async fn test_signal_zero_reaches_placeholder() {
    let tmp = TempDir::new().unwrap();
    let rt = SpoofedRuntime::new("spoofed");
    let c = spoofed(&tmp, "alive");

    let err = rt.signal_container(&c, Signal::LIVENESS).await.unwrap_err();
    assert!(matches!(err, Error::NotInitialized(_)));

    rt.create_container(&c, "").await.unwrap();
    rt.signal_container(&c, Signal::LIVENESS).await.unwrap();
    rt.shutdown().await.unwrap();
    assert_eq!(rt.placeholder_count(), 0);
}

#[tokio::test]
async fn test_exec_and_update_are_noops() {
    let tmp = TempDir::new().unwrap();
    let rt = SpoofedRuntime::new("spoofed");
    let c = spoofed(&tmp, "noop");
    rt.create_container(&c, "").await.unwrap();

    let resp = rt
        .exec_sync_container(&c, &["true".to_string()], None)
        .await
        .unwrap();
    assert!(resp.is_success());
    assert!(resp.stdout.is_empty());

    rt.exec_container(&c, &["sh".to_string()], StreamOptions::default())
        .await
        .unwrap();
    rt.update_container(&c, &LinuxResources::default())
        .await
        .unwrap();
    rt.reopen_container_log(&c).await.unwrap();

    let stats = rt.container_stats(&c, "").await.unwrap();
    assert_eq!(stats.container_id, "noop");
    rt.shutdown().await.unwrap();
}
