//! The task service seam.

use super::{ExitStatus, ProcessIo, ShimResult, TaskState};
use crate::runtime::LinuxResources;
use crate::stats::ContainerStats;
use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;

/// Creates a task from a bundle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CreateTask {
    pub id: String,
    pub bundle: PathBuf,
    pub io: ProcessIo,
    /// Runtime-specific config file, passed to the shim as create options.
    pub config_path: Option<PathBuf>,
}

/// Per-task operations of a shim.
///
/// `exec_id` of `None` addresses the task's init process. `wait` is the
/// only call without a deadline: it returns when the process exits.
#[async_trait]
pub trait TaskService: Send + Sync {
    /// Handshake; returns the shim's PID.
    async fn connect(&self, id: &str) -> ShimResult<u32>;

    /// Creates a task; returns its init PID.
    async fn create(&self, req: CreateTask) -> ShimResult<i32>;

    /// Starts a task or exec process; returns its PID.
    async fn start(&self, id: &str, exec_id: Option<&str>) -> ShimResult<i32>;

    async fn state(&self, id: &str) -> ShimResult<TaskState>;

    async fn kill(&self, id: &str, exec_id: Option<&str>, signal: i32, all: bool)
    -> ShimResult<()>;

    async fn wait(&self, id: &str, exec_id: Option<&str>) -> ShimResult<ExitStatus>;

    async fn delete(&self, id: &str, exec_id: Option<&str>) -> ShimResult<()>;

    /// Adds an exec process described by an OCI process spec. Start it
    /// with [`TaskService::start`].
    async fn exec(
        &self,
        id: &str,
        exec_id: &str,
        io: ProcessIo,
        spec: &serde_json::Value,
    ) -> ShimResult<()>;

    async fn pause(&self, id: &str) -> ShimResult<()>;

    async fn resume(&self, id: &str) -> ShimResult<()>;

    async fn update(&self, id: &str, resources: &LinuxResources) -> ShimResult<()>;

    async fn stats(&self, id: &str) -> ShimResult<ContainerStats>;

    async fn resize_pty(
        &self,
        id: &str,
        exec_id: Option<&str>,
        width: u32,
        height: u32,
    ) -> ShimResult<()>;

    /// Closes the process's stdin.
    async fn close_io(&self, id: &str, exec_id: Option<&str>) -> ShimResult<()>;

    /// Asks the shim to exit once it serves no more tasks.
    async fn shutdown(&self, id: &str) -> ShimResult<()>;
}

/// Connects to a shim at the address it printed on startup.
#[async_trait]
pub trait TaskDialer: Send + Sync {
    async fn dial(&self, address: &str) -> ShimResult<Arc<dyn TaskService>>;
}
