//! The back-end contract shared by every runtime implementation.
//!
//! A [`RuntimeImpl`] supervises containers on one execution substrate:
//! a monitor process per container, a task-API shim, a pod-level monitor,
//! or nothing at all (spoofed). The [`crate::facade::Runtime`] picks one per
//! container and forwards every call to it.
//!
//! # Lifecycle
//!
//! ```text
//! create_container → start_container → [exec / attach / signal / stats]
//!                  → stop_container → delete_container
//! ```
//!
//! Implementations take the container's `op_lock` for mutating operations
//! and keep the container's [`crate::container::ContainerState`] current.

use crate::container::Container;
use crate::error::Result;
use crate::signal::Signal;
use crate::stats::ContainerStats;
use crate::streams::{DuplexStream, StreamOptions};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

// =============================================================================
// Resources
// =============================================================================

/// Memory limits, in the OCI runtime spec's `linux.resources.memory` shape.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemoryResources {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reservation: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub swap: Option<i64>,
}

/// CPU limits, in the OCI runtime spec's `linux.resources.cpu` shape.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CpuResources {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub shares: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quota: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub period: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cpus: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mems: Option<String>,
}

/// PID limit.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PidsResources {
    pub limit: i64,
}

/// Resource update, serialized as the OCI `linux.resources` object.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LinuxResources {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory: Option<MemoryResources>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cpu: Option<CpuResources>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pids: Option<PidsResources>,
}

// =============================================================================
// Exec Results
// =============================================================================

/// Outcome of a synchronous exec.
///
/// A command that hits its timeout is still a response, with exit code
/// [`crate::constants::EXEC_TIMEOUT_EXIT_CODE`] and a "timed out" stderr.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecSyncResponse {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub exit_code: i32,
}

impl ExecSyncResponse {
    /// The response reported for an exec that hit its timeout.
    pub fn timed_out() -> Self {
        Self {
            stdout: Vec::new(),
            stderr: crate::constants::EXEC_TIMED_OUT_MESSAGE.as_bytes().to_vec(),
            exit_code: crate::constants::EXEC_TIMEOUT_EXIT_CODE,
        }
    }

    pub fn is_success(&self) -> bool {
        self.exit_code == 0
    }

    pub fn is_timed_out(&self) -> bool {
        self.exit_code == crate::constants::EXEC_TIMEOUT_EXIT_CODE
    }
}

// =============================================================================
// RuntimeImpl Trait
// =============================================================================

/// Supervision back-end for containers.
///
/// # Implementations
///
/// - `OciRuntime`: monitor process per container, OCI runtime CLI
/// - `VmRuntime`: task-API shim per sandbox
/// - `PodRuntime`: pod-level monitor per sandbox, OCI runtime CLI
/// - `SpoofedRuntime`: placeholder processes, no runtime
#[async_trait]
pub trait RuntimeImpl: Send + Sync {
    /// Back-end name for logs.
    fn name(&self) -> &str;

    /// Creates the container and records its init PID.
    ///
    /// A failed create is rolled back by the back-end before it returns.
    async fn create_container(&self, c: &Arc<Container>, cgroup_parent: &str) -> Result<()>;

    /// Starts a created container.
    async fn start_container(&self, c: &Arc<Container>) -> Result<()>;

    /// Runs an interactive command in the container.
    async fn exec_container(
        &self,
        c: &Arc<Container>,
        cmd: &[String],
        streams: StreamOptions,
    ) -> Result<()>;

    /// Runs a command and buffers its output.
    ///
    /// `timeout` of `None` waits indefinitely.
    async fn exec_sync_container(
        &self,
        c: &Arc<Container>,
        cmd: &[String],
        timeout: Option<Duration>,
    ) -> Result<ExecSyncResponse>;

    /// Updates container resources.
    async fn update_container(&self, c: &Arc<Container>, resources: &LinuxResources)
    -> Result<()>;

    /// Stops the container: stop signal, then SIGKILL after `timeout`.
    ///
    /// Returns [`crate::Error::AlreadyStopped`] for a stopped container.
    async fn stop_container(&self, c: &Arc<Container>, timeout: Duration) -> Result<()>;

    /// Deletes the container from the runtime.
    async fn delete_container(&self, c: &Arc<Container>) -> Result<()>;

    /// Refreshes the container's state from the runtime.
    async fn update_container_status(&self, c: &Arc<Container>) -> Result<()>;

    async fn pause_container(&self, c: &Arc<Container>) -> Result<()>;

    async fn unpause_container(&self, c: &Arc<Container>) -> Result<()>;

    /// Resource usage, read from `cgroup` where the back-end uses cgroups.
    async fn container_stats(&self, c: &Arc<Container>, cgroup: &str) -> Result<ContainerStats>;

    /// Delivers a signal to the container's init process.
    async fn signal_container(&self, c: &Arc<Container>, sig: Signal) -> Result<()>;

    /// Attaches streams to the running container.
    async fn attach_container(&self, c: &Arc<Container>, streams: StreamOptions) -> Result<()>;

    /// Forwards `stream` to `port` inside the network namespace at `netns_path`.
    async fn port_forward_container(
        &self,
        c: &Arc<Container>,
        netns_path: &Path,
        port: u16,
        stream: Box<dyn DuplexStream>,
        cancel: CancellationToken,
    ) -> Result<()>;

    /// Asks the container's log writer to reopen its log file.
    async fn reopen_container_log(&self, c: &Arc<Container>) -> Result<()>;

    /// Releases back-end resources (shim connections, pod monitors).
    async fn shutdown(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resources_serialize_as_oci() {
        let res = LinuxResources {
            memory: Some(MemoryResources {
                limit: Some(1 << 20),
                ..Default::default()
            }),
            cpu: Some(CpuResources {
                cpus: Some("0-1".to_string()),
                ..Default::default()
            }),
            pids: None,
        };
        let json = serde_json::to_string(&res).unwrap();
        assert_eq!(json, r#"{"memory":{"limit":1048576},"cpu":{"cpus":"0-1"}}"#);
    }

    #[test]
    fn test_timed_out_response() {
        let resp = ExecSyncResponse::timed_out();
        assert!(resp.is_timed_out());
        assert_eq!(resp.stderr, b"command timed out");
    }
}
