//! Tests for the container entity.
//!
//! Validates the state machine, write-once init PID tracking, PID-wrap
//! detection, on-disk persistence and stop coordination.

use magikoci::constants::{
    KUBERNETES_CONTAINER_NAME_LABEL, KUBERNETES_POD_NAME_LABEL, KUBERNETES_POD_NAMESPACE_LABEL,
};
use magikoci::process;
use magikoci::{Container, ContainerConfig, ContainerState, ContainerStatus, Error, Signal};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

fn container(id: &str, dir: &std::path::Path) -> Container {
    Container::new(ContainerConfig {
        id: id.to_string(),
        name: format!("{}-name", id),
        sandbox: "sandbox".to_string(),
        bundle_path: dir.join("bundle"),
        dir: dir.join("state"),
        ..Default::default()
    })
    .unwrap()
}

fn own_pid() -> i32 {
    std::process::id() as i32
}

// =============================================================================
// State Machine Tests
// =============================================================================

#[test]
fn test_new_container_is_created() {
    let tmp = TempDir::new().unwrap();
    let c = container("c1", tmp.path());
    let state = c.state().unwrap();
    assert_eq!(state.status, ContainerStatus::Created);
    assert_eq!(state.init_pid, 0);
    assert!(state.exit_code.is_none());
    assert!(!c.is_created());
}

#[test]
fn test_stopped_is_terminal() {
    let mut state = ContainerState::default();
    assert!(state.transition(ContainerStatus::Running));
    assert!(state.transition(ContainerStatus::Paused));
    assert!(state.transition(ContainerStatus::Running));
    assert!(state.transition(ContainerStatus::Stopped));

    assert!(state.transition(ContainerStatus::Stopped));
    assert!(!state.transition(ContainerStatus::Running));
    assert!(!state.transition(ContainerStatus::Created));
    assert_eq!(state.status, ContainerStatus::Stopped);
}

#[test]
fn test_oci_status_mapping() {
    assert_eq!(
        ContainerStatus::from_oci("creating"),
        Some(ContainerStatus::Created)
    );
    assert_eq!(
        ContainerStatus::from_oci("stopped"),
        Some(ContainerStatus::Stopped)
    );
    assert_eq!(ContainerStatus::from_oci("bogus"), None);
}

#[test]
fn test_should_be_stopped() {
    let tmp = TempDir::new().unwrap();
    let c = container("c1", tmp.path());
    assert!(c.should_be_stopped().is_ok());

    c.update_state(|s| {
        s.transition(ContainerStatus::Paused);
    })
    .unwrap();
    assert!(matches!(
        c.should_be_stopped(),
        Err(Error::InvalidState { .. })
    ));

    c.set_stopped_now().unwrap();
    let err = c.should_be_stopped().unwrap_err();
    assert!(err.is_already_stopped());
}

#[test]
fn test_set_stopped_now_keeps_finished() {
    let tmp = TempDir::new().unwrap();
    let c = container("c1", tmp.path());
    let finished = chrono::Utc::now() - chrono::Duration::seconds(30);
    c.update_state(|s| s.finished = Some(finished)).unwrap();
    c.set_stopped_now().unwrap();
    let state = c.state().unwrap();
    assert_eq!(state.status, ContainerStatus::Stopped);
    assert_eq!(state.finished, Some(finished));
}

#[test]
fn test_set_start_failed() {
    let tmp = TempDir::new().unwrap();
    let c = container("c1", tmp.path());
    let err = Error::StartFailed {
        id: "c1".into(),
        reason: "exec format error".into(),
    };
    c.set_start_failed(Some(&err)).unwrap();
    let state = c.state().unwrap();
    assert_eq!(state.started, Some(state.created));
    assert_eq!(state.finished, Some(state.created));
    assert!(state.error.contains("exec format error"));
}

// =============================================================================
// Identity Tests
// =============================================================================

#[test]
fn test_infra_container() {
    let tmp = TempDir::new().unwrap();
    assert!(!container("c1", tmp.path()).is_infra());
    assert!(container("sandbox", tmp.path()).is_infra());
}

#[test]
fn test_description_from_labels() {
    let mut labels = HashMap::new();
    labels.insert(KUBERNETES_POD_NAMESPACE_LABEL.to_string(), "default".to_string());
    labels.insert(KUBERNETES_POD_NAME_LABEL.to_string(), "web-0".to_string());
    labels.insert(KUBERNETES_CONTAINER_NAME_LABEL.to_string(), "nginx".to_string());
    let c = Container::new(ContainerConfig {
        id: "c1".into(),
        labels,
        ..Default::default()
    })
    .unwrap();
    assert_eq!(c.description(), "default/web-0/nginx");
}

#[test]
fn test_stop_signal_parsing() {
    let with_signal = |sig: &str| {
        Container::new(ContainerConfig {
            id: "c1".into(),
            stop_signal: sig.into(),
            ..Default::default()
        })
        .unwrap()
        .stop_signal()
    };
    assert_eq!(with_signal(""), Signal::TERM);
    assert_eq!(with_signal("SIGKILL"), Signal::KILL);
    assert_eq!(with_signal("2"), Signal::INT);
    assert_eq!(with_signal("NOPE"), Signal::TERM);
    assert_eq!(with_signal("0"), Signal::TERM);
}

#[test]
fn test_invalid_ids_rejected() {
    for id in ["", "..", "a/b", "has space"] {
        let res = Container::new(ContainerConfig {
            id: id.into(),
            ..Default::default()
        });
        assert!(res.is_err(), "id {:?} should be rejected", id);
    }
}

#[test]
fn test_spoofed_container() {
    let tmp = TempDir::new().unwrap();
    let c = Container::new_spoofed("c1", "c1", HashMap::new(), "sb", tmp.path()).unwrap();
    assert!(c.is_spoofed());
    assert_eq!(c.bundle_path(), tmp.path());
    assert_eq!(c.exit_file_path(), tmp.path().join("exit"));
    assert_eq!(c.oom_file_path(), tmp.path().join("oom"));
}

#[test]
fn test_mount_point_and_spec() {
    let tmp = TempDir::new().unwrap();
    let c = container("c1", tmp.path());
    assert!(c.mount_point().is_none());
    assert!(c.spec().is_none());

    c.set_mount_point(tmp.path().join("rootfs")).unwrap();
    c.set_spec(serde_json::json!({ "process": { "cwd": "/app" } }))
        .unwrap();
    assert_eq!(c.mount_point(), Some(tmp.path().join("rootfs")));
    assert_eq!(c.spec().unwrap()["process"]["cwd"], "/app");
}

// =============================================================================
// Init PID Tests
// =============================================================================

#[test]
fn test_set_init_pid_is_write_once() {
    let tmp = TempDir::new().unwrap();
    let c = container("c1", tmp.path());
    c.set_init_pid(own_pid()).unwrap();
    let first = c.state().unwrap();

    let err = c.set_init_pid(own_pid()).unwrap_err();
    assert!(matches!(err, Error::InitPidAlreadySet { .. }));
    let second = c.state().unwrap();
    assert_eq!(first.init_pid, second.init_pid);
    assert_eq!(first.init_start_time, second.init_start_time);
}

#[test]
fn test_set_init_pid_of_missing_process() {
    let mut state = ContainerState::default();
    assert!(state.set_init_pid(i32::MAX).is_err());
    assert_eq!(state.init_pid, 0);
    assert!(state.init_start_time.is_empty());
}

#[test]
fn test_pid_of_live_container() {
    let tmp = TempDir::new().unwrap();
    let c = container("c1", tmp.path());
    c.set_init_pid(own_pid()).unwrap();
    assert_eq!(c.pid().unwrap(), own_pid());
    assert!(c.is_alive());
    assert!(c.living().is_ok());
}

#[test]
fn test_pid_not_initialized() {
    let tmp = TempDir::new().unwrap();
    let c = container("c1", tmp.path());
    assert!(matches!(c.pid(), Err(Error::NotInitialized(_))));
    assert!(!c.is_alive());
}

#[test]
fn test_pid_zero_means_not_found() {
    let tmp = TempDir::new().unwrap();
    let c = container("c1", tmp.path());
    c.set_init_pid(own_pid()).unwrap();
    c.update_state(|s| s.pid = 0).unwrap();
    let err = c.pid().unwrap_err();
    assert!(matches!(err, Error::ProcessNotFound));
    assert!(err.is_process_gone());
}

#[test]
fn test_pid_wrap_detected() {
    let tmp = TempDir::new().unwrap();
    let c = container("c1", tmp.path());
    c.update_state(|s| {
        s.set_init_pid_with_start_time(own_pid(), "1".to_string())
            .unwrap();
        s.pid = own_pid();
    })
    .unwrap();

    let err = c.pid().unwrap_err();
    match &err {
        Error::PidWrap {
            pid,
            expected,
            found,
        } => {
            assert_eq!(*pid, own_pid());
            assert_eq!(expected, "1");
            assert_eq!(*found, process::start_time(own_pid()).unwrap());
        }
        other => panic!("expected PID wrap, got {:?}", other),
    }
    assert!(!c.is_alive());
}

#[tokio::test]
async fn test_exited_process_is_not_found() {
    let tmp = TempDir::new().unwrap();
    let c = container("c1", tmp.path());
    let mut child = tokio::process::Command::new("true").spawn().unwrap();
    let pid = child.id().unwrap() as i32;
    c.set_init_pid(pid).unwrap();
    child.wait().await.unwrap();
    assert!(c.pid().unwrap_err().is_process_gone());
}

// =============================================================================
// Persistence Tests
// =============================================================================

#[test]
fn test_state_roundtrip_through_disk() {
    let tmp = TempDir::new().unwrap();
    let c = container("c1", tmp.path());
    c.set_init_pid(own_pid()).unwrap();
    c.update_state(|s| {
        s.transition(ContainerStatus::Running);
        s.exit_code = Some(3);
        s.oom_killed = true;
    })
    .unwrap();
    c.to_disk().unwrap();
    assert!(c.state_path().exists());

    let restored = container("c1", tmp.path());
    restored.from_disk().unwrap();
    assert_eq!(restored.state().unwrap(), c.state().unwrap());
}

#[test]
fn test_state_json_field_names() {
    let tmp = TempDir::new().unwrap();
    let c = container("c1", tmp.path());
    c.to_disk().unwrap();
    let raw: serde_json::Value =
        serde_json::from_slice(&std::fs::read(c.state_path()).unwrap()).unwrap();
    assert_eq!(raw["status"], "created");
    assert!(raw.get("initPid").is_some());
    assert!(raw.get("initStartTime").is_some());
    assert!(raw.get("oomKilled").is_some());
}

#[test]
fn test_legacy_state_is_upgraded() {
    let tmp = TempDir::new().unwrap();
    let path = tmp.path().join("state.json");
    let legacy = serde_json::json!({
        "status": "running",
        "pid": own_pid(),
        "created": "2024-01-01T00:00:00Z",
    });
    std::fs::write(&path, serde_json::to_vec(&legacy).unwrap()).unwrap();

    let state = ContainerState::from_disk(&path).unwrap();
    assert_eq!(state.init_pid, own_pid());
    assert_eq!(
        state.init_start_time,
        process::start_time(own_pid()).unwrap()
    );
}

// =============================================================================
// Stop Coordination Tests
// =============================================================================

#[tokio::test]
async fn test_only_one_stop_in_flight() {
    let tmp = TempDir::new().unwrap();
    let c = container("c1", tmp.path());
    let guard = c.set_as_stopping().unwrap();
    assert!(guard.is_some());
    assert!(c.is_stopping());
    assert!(c.set_as_stopping().unwrap().is_none());

    drop(guard);
    assert!(!c.is_stopping());
    assert!(c.set_as_stopping().unwrap().is_some());
}

#[tokio::test]
async fn test_waiters_released_when_stop_finishes() {
    let tmp = TempDir::new().unwrap();
    let c = Arc::new(container("c1", tmp.path()));
    let mut guard = c.set_as_stopping().unwrap().unwrap();

    let mut waiters = Vec::new();
    for secs in [5, 3] {
        let c = Arc::clone(&c);
        waiters.push(tokio::spawn(async move {
            c.wait_on_stop_timeout(Duration::from_secs(secs), &CancellationToken::new())
                .await;
        }));
    }
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(guard.requested_timeout(), Some(Duration::from_secs(3)));
    assert_eq!(guard.requested_timeout(), None);

    guard.finish();
    for waiter in waiters {
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
    }
}

#[tokio::test]
async fn test_wait_on_stop_without_stop_returns() {
    let tmp = TempDir::new().unwrap();
    let c = container("c1", tmp.path());
    tokio::time::timeout(
        Duration::from_millis(100),
        c.wait_on_stop_timeout(Duration::from_secs(10), &CancellationToken::new()),
    )
    .await
    .unwrap();
}

#[tokio::test]
async fn test_wait_on_stop_cancelled() {
    let tmp = TempDir::new().unwrap();
    let c = container("c1", tmp.path());
    let _guard = c.set_as_stopping().unwrap().unwrap();
    let cancel = CancellationToken::new();
    cancel.cancel();
    tokio::time::timeout(
        Duration::from_millis(100),
        c.wait_on_stop_timeout(Duration::from_secs(10), &cancel),
    )
    .await
    .unwrap();
}

// =============================================================================
// Exec PID Tests
// =============================================================================

#[tokio::test]
async fn test_kill_exec_pids() {
    let tmp = TempDir::new().unwrap();
    let c = container("c1", tmp.path());
    let mut child = tokio::process::Command::new("sleep")
        .arg("30")
        .kill_on_drop(true)
        .spawn()
        .unwrap();
    let pid = child.id().unwrap() as i32;
    c.add_exec_pid(pid, true).unwrap();
    assert_eq!(c.exec_pid_count(), 1);

    let reaper = tokio::spawn(async move { child.wait().await });
    c.kill_exec_pids().await;
    let status = tokio::time::timeout(Duration::from_secs(5), reaper)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert!(!status.success());

    c.delete_exec_pid(pid);
    assert_eq!(c.exec_pid_count(), 0);
}
