//! Spoofed back-end.
//!
//! No OCI runtime is involved. Each container owns an inert `sleep`
//! placeholder process so PID-based liveness checks see a real process,
//! and every state transition is fabricated locally.

use crate::container::{Container, ContainerStatus};
use crate::error::{Error, Result};
use crate::process;
use crate::runtime::{ExecSyncResponse, LinuxResources, RuntimeImpl};
use crate::signal::Signal;
use crate::stats::ContainerStats;
use crate::streams::{DuplexStream, StreamOptions};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::path::Path;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Placeholder command.
const PLACEHOLDER: &str = "sleep";
const PLACEHOLDER_ARG: &str = "infinity";

/// Back-end that fabricates container lifecycles around placeholder processes.
#[derive(Debug, Default)]
pub struct SpoofedRuntime {
    handler: String,
    placeholders: Mutex<HashMap<String, Child>>,
}

impl SpoofedRuntime {
    pub fn new(handler: &str) -> Self {
        Self {
            handler: handler.to_string(),
            placeholders: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, Child>>> {
        self.placeholders
            .lock()
            .map_err(|e| Error::Internal(format!("lock poisoned: {}", e)))
    }

    /// Kills and reaps the placeholder of `id`, if any.
    async fn reap(&self, id: &str) -> Result<()> {
        let child = self.lock()?.remove(id);
        if let Some(mut child) = child {
            if let Err(e) = child.kill().await {
                warn!(container = %id, error = %e, "failed to kill placeholder");
            }
            debug!(container = %id, "placeholder reaped");
        }
        Ok(())
    }

    /// Number of live placeholder processes.
    pub fn placeholder_count(&self) -> usize {
        self.lock().map(|p| p.len()).unwrap_or(0)
    }
}

#[async_trait]
impl RuntimeImpl for SpoofedRuntime {
    fn name(&self) -> &str {
        &self.handler
    }

    async fn create_container(&self, c: &Arc<Container>, _cgroup_parent: &str) -> Result<()> {
        let child = Command::new(PLACEHOLDER)
            .arg(PLACEHOLDER_ARG)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::CreateFailed {
                id: c.id().to_string(),
                reason: format!("failed to spawn placeholder: {}", e),
            })?;
        let pid = child.id().map_or(0, |p| p as i32);
        self.lock()?.insert(c.id().to_string(), child);

        if let Err(e) = c.set_init_pid(pid) {
            self.reap(c.id()).await?;
            return Err(e);
        }
        c.set_created();
        info!(container = %c.id(), pid, "created spoofed container");
        Ok(())
    }

    async fn start_container(&self, c: &Arc<Container>) -> Result<()> {
        let _op = c.op_lock().await;
        c.update_state(|s| {
            s.transition(ContainerStatus::Running);
            s.started = Some(Utc::now());
        })
    }

    async fn exec_container(
        &self,
        c: &Arc<Container>,
        cmd: &[String],
        _streams: StreamOptions,
    ) -> Result<()> {
        debug!(container = %c.id(), ?cmd, "spoofed exec");
        Ok(())
    }

    async fn exec_sync_container(
        &self,
        c: &Arc<Container>,
        cmd: &[String],
        _timeout: Option<Duration>,
    ) -> Result<ExecSyncResponse> {
        debug!(container = %c.id(), ?cmd, "spoofed exec sync");
        Ok(ExecSyncResponse::default())
    }

    async fn update_container(
        &self,
        _c: &Arc<Container>,
        _resources: &LinuxResources,
    ) -> Result<()> {
        Ok(())
    }

    async fn stop_container(&self, c: &Arc<Container>, _timeout: Duration) -> Result<()> {
        let _op = c.op_lock().await;
        c.should_be_stopped()?;
        self.reap(c.id()).await?;
        c.update_state(|s| {
            s.exit_code.get_or_insert(0);
        })?;
        c.set_stopped_now()?;
        info!(container = %c.id(), "stopped spoofed container");
        Ok(())
    }

    async fn delete_container(&self, c: &Arc<Container>) -> Result<()> {
        let _op = c.op_lock().await;
        self.reap(c.id()).await
    }

    /// A dead placeholder means the container stopped.
    async fn update_container_status(&self, c: &Arc<Container>) -> Result<()> {
        let _op = c.op_lock().await;
        if c.status()? == ContainerStatus::Stopped || c.is_alive() {
            return Ok(());
        }
        c.update_state(|s| {
            s.exit_code.get_or_insert(0);
        })?;
        c.set_stopped_now()
    }

    async fn pause_container(&self, c: &Arc<Container>) -> Result<()> {
        let _op = c.op_lock().await;
        c.update_state(|s| {
            s.transition(ContainerStatus::Paused);
        })
    }

    async fn unpause_container(&self, c: &Arc<Container>) -> Result<()> {
        let _op = c.op_lock().await;
        c.update_state(|s| {
            s.transition(ContainerStatus::Running);
        })
    }

    async fn container_stats(&self, c: &Arc<Container>, _cgroup: &str) -> Result<ContainerStats> {
        Ok(ContainerStats::empty(c.id()))
    }

    /// Delivered to the placeholder, so signal 0 is a real liveness check.
    async fn signal_container(&self, c: &Arc<Container>, sig: Signal) -> Result<()> {
        let pid = c.pid()?;
        process::kill(pid, sig.as_i32())
    }

    async fn attach_container(&self, c: &Arc<Container>, _streams: StreamOptions) -> Result<()> {
        debug!(container = %c.id(), "spoofed attach");
        Ok(())
    }

    async fn port_forward_container(
        &self,
        _c: &Arc<Container>,
        _netns_path: &Path,
        _port: u16,
        _stream: Box<dyn DuplexStream>,
        _cancel: CancellationToken,
    ) -> Result<()> {
        Err(Error::NotSupported(
            "port forwarding to a spoofed container".to_string(),
        ))
    }

    async fn reopen_container_log(&self, _c: &Arc<Container>) -> Result<()> {
        Ok(())
    }

    async fn shutdown(&self) -> Result<()> {
        let children: Vec<(String, Child)> = self.lock()?.drain().collect();
        for (id, mut child) in children {
            if let Err(e) = child.kill().await {
                warn!(container = %id, error = %e, "failed to kill placeholder");
            }
        }
        Ok(())
    }
}
