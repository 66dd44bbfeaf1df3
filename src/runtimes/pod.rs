//! Pod-level monitor back-end.
//!
//! One monitor process serves every container of a sandbox. It is started
//! with the infra container and takes over what the per-container monitor
//! does: it creates containers, writes exit and OOM files, owns the log
//! and serves attach sockets. Everything the OCI runtime CLI answers
//! directly (state, kill, pause, delete) goes through the embedded
//! [`OciRuntime`].

use super::oci::{OciRuntime, attach_socket, monitor_log_level};
use super::{TaskServer, launch_task_server, persist_address, read_persisted_address};
use crate::cgroup::CgroupManager;
use crate::config::{Config, RuntimeHandler};
use crate::constants::{ATTACH_FILE, OOM_FILE};
use crate::container::Container;
use crate::error::{Error, Result};
use crate::metrics::Metrics;
use crate::monitor::{CreateTaskRequest, MonitorClient};
use crate::runtime::{ExecSyncResponse, LinuxResources, RuntimeImpl};
use crate::shim::ProcessIo;
use crate::signal::Signal;
use crate::stats::ContainerStats;
use crate::streams::{DuplexStream, StreamOptions};
use async_trait::async_trait;
use std::path::Path;
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Runtime whose containers share one pod monitor.
#[derive(Debug)]
pub struct PodRuntime {
    oci: OciRuntime,
    server: TaskServer<MonitorClient>,
    sandbox: OnceLock<String>,
}

impl PodRuntime {
    pub fn new(
        handler_name: &str,
        handler: &RuntimeHandler,
        config: Arc<Config>,
        cgroup_manager: Arc<dyn CgroupManager>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            oci: OciRuntime::new(handler_name, handler, config, cgroup_manager, metrics),
            server: TaskServer::default(),
            sandbox: OnceLock::new(),
        }
    }

    /// True while a monitor connection is held in memory.
    pub fn is_connected(&self) -> bool {
        self.server.is_connected()
    }

    /// The sandbox's monitor client, redialing from `<bundle>/address`
    /// after a restart.
    fn client(&self, c: &Container) -> Result<MonitorClient> {
        let client = match self.server.cached()? {
            Some(client) => client,
            None => {
                let client = MonitorClient::new(&read_persisted_address(c)?);
                info!(
                    container = %c.id(),
                    address = %client.path().display(),
                    "reconnected to pod monitor"
                );
                self.server.set(client.clone())?;
                client
            }
        };
        let _ = self.sandbox.set(c.sandbox().to_string());
        Ok(client)
    }

    fn monitor_command(&self, c: &Container) -> Command {
        let mut cmd = Command::new(self.oci.monitor_path());
        cmd.arg("--runtime")
            .arg(self.oci.path())
            .arg("--runtime-root")
            .arg(self.oci.root())
            .arg("--runtime-dir")
            .arg(c.dir())
            .arg("--log-level")
            .arg(monitor_log_level())
            .arg("--cgroup-manager")
            .arg(if self.oci.uses_systemd() {
                "systemd"
            } else {
                "cgroupfs"
            })
            .current_dir(c.dir());
        cmd
    }

    /// Starts the pod monitor and places it in the sandbox's monitor cgroup.
    async fn start_monitor(&self, c: &Container, cgroup_parent: &str) -> Result<MonitorClient> {
        debug!(
            sandbox = %c.sandbox(),
            monitor = %self.oci.monitor_path().display(),
            "starting pod monitor"
        );
        let address = launch_task_server(self.monitor_command(c), c.sandbox()).await?;
        let client = MonitorClient::new(&address);
        let pid = client.connect().await?;
        info!(sandbox = %c.sandbox(), pid, "connected to pod monitor");
        self.oci.move_monitor_to_cgroup(c, cgroup_parent, pid);
        let _ = self.sandbox.set(c.sandbox().to_string());
        self.server.set(client.clone())?;
        Ok(client)
    }

    fn create_request(&self, c: &Container) -> CreateTaskRequest {
        let config = self.oci.config();
        CreateTaskRequest {
            id: c.id().to_string(),
            bundle: c.bundle_path().to_path_buf(),
            io: ProcessIo {
                terminal: c.terminal(),
                ..Default::default()
            },
            exit_paths: vec![config.container_exits_dir.join(c.id()), c.exit_file_path()],
            oom_exit_paths: vec![c.bundle_path().join(OOM_FILE)],
            log_path: Some(c.log_path().to_path_buf()),
        }
    }

    async fn shutdown_monitor(&self, client: &MonitorClient, sandbox: &str) {
        if let Err(e) = client.shutdown(sandbox).await {
            warn!(sandbox = %sandbox, error = %e, "pod monitor shutdown failed");
        }
    }
}

#[async_trait]
impl RuntimeImpl for PodRuntime {
    fn name(&self) -> &str {
        self.oci.name()
    }

    async fn create_container(&self, c: &Arc<Container>, cgroup_parent: &str) -> Result<()> {
        let client = if c.is_infra() {
            self.start_monitor(c, cgroup_parent).await?
        } else {
            self.client(c)?
        };
        persist_address(c, &client.path().display().to_string())?;

        let pid = match client.create(self.create_request(c)).await {
            Ok(pid) => pid,
            Err(e) => {
                error!(container = %c.id(), error = %e, "pod monitor failed to create container");
                if let Err(del) = self.oci.delete_container(c).await {
                    debug!(container = %c.id(), error = %del, "rollback delete failed");
                }
                if c.is_infra() {
                    self.shutdown_monitor(&client, c.sandbox()).await;
                    self.server.take();
                }
                return Err(Error::CreateFailed {
                    id: c.id().to_string(),
                    reason: e.to_string(),
                });
            }
        };

        {
            let _op = c.op_lock().await;
            c.set_init_pid(pid)?;
            c.set_created();
        }
        info!(container = %c.id(), pid, "created container through pod monitor");
        Ok(())
    }

    async fn start_container(&self, c: &Arc<Container>) -> Result<()> {
        self.oci.start_container(c).await
    }

    async fn exec_container(
        &self,
        c: &Arc<Container>,
        cmd: &[String],
        streams: StreamOptions,
    ) -> Result<()> {
        self.oci.exec_container(c, cmd, streams).await
    }

    async fn exec_sync_container(
        &self,
        c: &Arc<Container>,
        cmd: &[String],
        timeout: Option<Duration>,
    ) -> Result<ExecSyncResponse> {
        let client = self.client(c)?;
        Ok(client.exec_sync(c.id(), cmd, timeout, c.terminal()).await?)
    }

    async fn update_container(
        &self,
        c: &Arc<Container>,
        resources: &LinuxResources,
    ) -> Result<()> {
        self.oci.update_container(c, resources).await
    }

    async fn stop_container(&self, c: &Arc<Container>, timeout: Duration) -> Result<()> {
        self.oci.stop_container(c, timeout).await
    }

    /// Deleting the infra container also shuts the pod monitor down.
    async fn delete_container(&self, c: &Arc<Container>) -> Result<()> {
        self.oci.delete_container(c).await?;
        if c.is_infra()
            && let Some(client) = self.server.take()
        {
            self.shutdown_monitor(&client, c.sandbox()).await;
        }
        Ok(())
    }

    async fn update_container_status(&self, c: &Arc<Container>) -> Result<()> {
        self.oci.update_container_status(c).await
    }

    async fn pause_container(&self, c: &Arc<Container>) -> Result<()> {
        self.oci.pause_container(c).await
    }

    async fn unpause_container(&self, c: &Arc<Container>) -> Result<()> {
        self.oci.unpause_container(c).await
    }

    async fn container_stats(&self, c: &Arc<Container>, cgroup: &str) -> Result<ContainerStats> {
        self.oci.container_stats(c, cgroup).await
    }

    async fn signal_container(&self, c: &Arc<Container>, sig: Signal) -> Result<()> {
        self.oci.signal_container(c, sig).await
    }

    /// Attach sockets live next to the monitor's own socket.
    async fn attach_container(
        &self,
        c: &Arc<Container>,
        mut streams: StreamOptions,
    ) -> Result<()> {
        let client = self.client(c)?;
        if let Some(mut resize) = streams.resize.take() {
            let client = client.clone();
            let id = c.id().to_string();
            tokio::spawn(async move {
                while let Some(size) = resize.recv().await {
                    if let Err(e) = client.resize_pty(&id, size.width, size.height).await {
                        debug!(container = %id, error = %e, "failed to resize terminal");
                    }
                }
            });
        }
        let server_dir = client.path().parent().unwrap_or(Path::new("/"));
        let attach_path = server_dir.join(c.id()).join(ATTACH_FILE);
        attach_socket(c, &attach_path, streams).await
    }

    async fn port_forward_container(
        &self,
        c: &Arc<Container>,
        netns_path: &Path,
        port: u16,
        stream: Box<dyn DuplexStream>,
        cancel: CancellationToken,
    ) -> Result<()> {
        self.oci
            .port_forward_container(c, netns_path, port, stream, cancel)
            .await
    }

    async fn reopen_container_log(&self, c: &Arc<Container>) -> Result<()> {
        Ok(self.client(c)?.reopen_log(c.id()).await?)
    }

    async fn shutdown(&self) -> Result<()> {
        if let Some(client) = self.server.take()
            && let Some(sandbox) = self.sandbox.get()
        {
            self.shutdown_monitor(&client, sandbox).await;
        }
        Ok(())
    }
}
