//! Task-API shim back-end for VM-isolated sandboxes.
//!
//! One shim serves a whole sandbox. Creating the infra container launches
//! it the way containerd does; sibling containers reach the same
//! `VmRuntime` through the facade and share its connection.
//!
//! ```text
//! create(infra) ──► containerd-shim-<name>-v2 -namespace default -address ""
//!                      -publish-binary <daemon> -id <sandbox> [-debug] start
//!                      │ stdout: unix:///run/containerd/s/<hash>
//!                      ▼
//!               <bundle>/address ──► ttrpc Task ──► create / start / kill / wait ...
//! ```
//!
//! Container IO tunnels through FIFOs in the bundle. A watcher task per
//! container blocks in `wait`, then writes `<exitsDir>/<id>` and records
//! the exit like the monitor would.

use super::fifo::{ContainerIo, FifoSet, OpenFifos, OutputChunk, OutputStream, mkfifo};
use super::oci::exec_process_spec;
use super::{
    TaskServer, check_oom, launch_task_server, persist_address, read_persisted_address,
    recover_from_exit_files, write_exit_file,
};
use crate::config::{Config, RuntimeHandler, build_containerd_binary_name, shim_binary_path};
use crate::constants::{
    COPY_BUFFER_SIZE, DEFAULT_DETACH_KEYS, EXEC_IO_DRAIN, KILL_CONTAINER_TIMEOUT,
    MAX_EXEC_SYNC_OUTPUT, SHIM_LOG_FIFO, SHIM_NAMESPACE, STOP_POLL_INTERVAL,
};
use crate::container::{Container, ContainerStatus, StopGuard};
use crate::error::{Error, Result};
use crate::metrics::Metrics;
use crate::runtime::{ExecSyncResponse, LinuxResources, RuntimeImpl};
use crate::shim::client::normalize_address;
use crate::shim::{
    CreateTask, ExitStatus, TaskDialer, TaskService, TaskStatus, TtrpcDialer,
};
use crate::signal::Signal;
use crate::stats::ContainerStats;
use crate::streams::{
    BoxedWriter, CopyOutcome, DuplexStream, StreamOptions, TerminalSize, connect_in_netns,
    copy_detachable, forward_bidirectional,
};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::pipe;
use tokio::process::Command;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

type Task = Arc<dyn TaskService>;

/// A live shim connection and the address it was reached on.
#[derive(Clone)]
struct Shim {
    task: Task,
    address: String,
}

/// Records a task exit reported by the shim.
fn record_task_exit(c: &Container, status: ExitStatus, metrics: &Metrics) -> Result<()> {
    c.update_state(|s| {
        s.transition(ContainerStatus::Stopped);
        s.pid = 0;
        s.exit_code = Some(status.code);
        s.finished = Some(status.exited_at.unwrap_or_else(Utc::now));
    })?;
    if status.code != 0 {
        check_oom(c, metrics)?;
    }
    Ok(())
}

fn spawn_resize_forwarder(
    task: Task,
    id: String,
    exec_id: Option<String>,
    mut resize: mpsc::Receiver<TerminalSize>,
) {
    tokio::spawn(async move {
        while let Some(size) = resize.recv().await {
            if let Err(e) = task
                .resize_pty(
                    &id,
                    exec_id.as_deref(),
                    u32::from(size.width),
                    u32::from(size.height),
                )
                .await
            {
                debug!(container = %id, error = %e, "failed to resize terminal");
            }
        }
    });
}

/// Copies relayed output to an attach session until the relay closes.
async fn forward_output(
    mut rx: broadcast::Receiver<OutputChunk>,
    stdout: &mut Option<BoxedWriter>,
    stderr: &mut Option<BoxedWriter>,
    tty: bool,
) -> io::Result<()> {
    loop {
        let chunk = match rx.recv().await {
            Ok(chunk) => chunk,
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                debug!(skipped, "attach output lagged");
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => break,
        };
        let target = match chunk.stream {
            OutputStream::Stderr if !tty => stderr.as_mut(),
            _ => stdout.as_mut(),
        };
        if let Some(w) = target {
            w.write_all(&chunk.data).await?;
            w.flush().await?;
        }
    }
    Ok(())
}

/// Buffers at most `limit` bytes of `src` until `stop` fires.
///
/// Data already readable when `stop` fires is still taken; excess input is
/// drained and dropped so the writer never blocks on a full FIFO.
async fn collect_output<R>(mut src: R, limit: usize, stop: CancellationToken) -> Vec<u8>
where
    R: AsyncRead + Unpin,
{
    let mut out = Vec::new();
    let mut buf = vec![0u8; COPY_BUFFER_SIZE];
    loop {
        tokio::select! {
            biased;
            res = src.read(&mut buf) => match res {
                Ok(0) | Err(_) => return out,
                Ok(n) => {
                    let room = limit.saturating_sub(out.len());
                    out.extend_from_slice(&buf[..n.min(room)]);
                }
            },
            _ = stop.cancelled() => return out,
        }
    }
}

/// Relays the shim's own log FIFO into the daemon log.
async fn relay_shim_log(sandbox: String, fifo: pipe::Receiver) {
    let mut lines = BufReader::new(fifo).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => debug!(sandbox = %sandbox, "shim: {}", line),
            Ok(None) => break,
            Err(e) => {
                warn!(sandbox = %sandbox, error = %e, "shim log relay failed");
                break;
            }
        }
    }
}

/// Shim-backed runtime for one sandbox.
pub struct VmRuntime {
    handler: String,
    /// containerd runtime name, `<dir>/containerd.shim.<name>.v2`.
    runtime_name: PathBuf,
    shim_config: Option<PathBuf>,
    config: Arc<Config>,
    metrics: Arc<Metrics>,
    dialer: Arc<dyn TaskDialer>,
    server: TaskServer<Shim>,
    sandbox: OnceLock<String>,
    shim_log: Mutex<Option<JoinHandle<()>>>,
    ios: Mutex<HashMap<String, Arc<ContainerIo>>>,
    watchers: Mutex<HashMap<String, JoinHandle<()>>>,
}

impl std::fmt::Debug for VmRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VmRuntime")
            .field("handler", &self.handler)
            .field("runtime_name", &self.runtime_name)
            .field("sandbox", &self.sandbox.get())
            .field("connected", &self.server.is_connected())
            .finish()
    }
}

impl VmRuntime {
    pub fn new(
        handler_name: &str,
        handler: &RuntimeHandler,
        config: Arc<Config>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self::with_dialer(handler_name, handler, config, metrics, Arc::new(TtrpcDialer))
    }

    /// Like [`VmRuntime::new`], reaching shims through `dialer`.
    pub fn with_dialer(
        handler_name: &str,
        handler: &RuntimeHandler,
        config: Arc<Config>,
        metrics: Arc<Metrics>,
        dialer: Arc<dyn TaskDialer>,
    ) -> Self {
        Self {
            handler: handler_name.to_string(),
            runtime_name: build_containerd_binary_name(&handler.runtime_path),
            shim_config: handler.runtime_config_path.clone(),
            config,
            metrics,
            dialer,
            server: TaskServer::default(),
            sandbox: OnceLock::new(),
            shim_log: Mutex::new(None),
            ios: Mutex::new(HashMap::new()),
            watchers: Mutex::new(HashMap::new()),
        }
    }

    /// True while a shim connection is held in memory.
    pub fn is_connected(&self) -> bool {
        self.server.is_connected()
    }

    /// The containerd runtime name the shim binary resolves from.
    pub fn runtime_name(&self) -> &Path {
        &self.runtime_name
    }

    /// The shim's task service, redialing `<bundle>/address` after a restart.
    async fn shim(&self, c: &Container) -> Result<Shim> {
        if let Some(shim) = self.server.cached()? {
            return Ok(shim);
        }
        let address = read_persisted_address(c)?;
        let task = self.dialer.dial(&address).await?;
        info!(container = %c.id(), address = %address, "reconnected to shim");
        let shim = Shim { task, address };
        self.server.set(shim.clone())?;
        Ok(shim)
    }

    async fn task(&self, c: &Container) -> Result<Task> {
        Ok(self.shim(c).await?.task)
    }

    /// The launch command containerd would use for this runtime.
    fn shim_command(&self, c: &Container) -> Result<Command> {
        let shim = shim_binary_path(&self.runtime_name).ok_or_else(|| {
            Error::InvalidConfig(format!(
                "runtime name {} does not resolve to a shim binary",
                self.runtime_name.display()
            ))
        })?;
        let publisher = std::env::current_exe().unwrap_or_default();
        let mut cmd = Command::new(shim);
        cmd.arg("-namespace")
            .arg(SHIM_NAMESPACE)
            .arg("-address")
            .arg("")
            .arg("-publish-binary")
            .arg(publisher)
            .arg("-id")
            .arg(c.sandbox());
        if tracing::enabled!(tracing::Level::DEBUG) {
            cmd.arg("-debug");
        }
        cmd.arg("start").current_dir(c.bundle_path());
        Ok(cmd)
    }

    /// Creates `<bundle>/log` and relays what the shim writes there.
    fn start_shim_log(&self, c: &Container) -> Result<()> {
        let path = c.bundle_path().join(SHIM_LOG_FIFO);
        mkfifo(&path)?;
        let fifo = pipe::OpenOptions::new()
            .read_write(true)
            .open_receiver(&path)?;
        let relay = tokio::spawn(relay_shim_log(c.sandbox().to_string(), fifo));
        if let Ok(mut slot) = self.shim_log.lock()
            && let Some(previous) = slot.replace(relay)
        {
            previous.abort();
        }
        Ok(())
    }

    fn stop_shim_log(&self) {
        if let Ok(mut slot) = self.shim_log.lock()
            && let Some(relay) = slot.take()
        {
            relay.abort();
        }
    }

    async fn start_shim(&self, c: &Container) -> Result<Shim> {
        let cmd = self.shim_command(c)?;
        debug!(
            sandbox = %c.sandbox(),
            runtime = %self.runtime_name.display(),
            "starting shim"
        );
        self.start_shim_log(c)?;
        let address = match launch_task_server(cmd, c.sandbox()).await {
            Ok(address) => normalize_address(&address),
            Err(e) => {
                self.stop_shim_log();
                return Err(e);
            }
        };
        let task = match self.dialer.dial(&address).await {
            Ok(task) => task,
            Err(e) => {
                self.stop_shim_log();
                return Err(e.into());
            }
        };
        Ok(Shim { task, address })
    }

    fn io(&self, c: &Container) -> Option<Arc<ContainerIo>> {
        self.ios
            .lock()
            .ok()
            .and_then(|ios| ios.get(c.id()).cloned())
    }

    fn spawn_exit_watcher(&self, c: &Arc<Container>, task: Task, io: Arc<ContainerIo>) {
        let container = Arc::clone(c);
        let exits_dir = self.config.container_exits_dir.clone();
        let metrics = Arc::clone(&self.metrics);
        let handle = tokio::spawn(async move {
            let c = container;
            match task.wait(c.id(), None).await {
                Ok(status) => {
                    debug!(container = %c.id(), code = status.code, "task exited");
                    if let Err(e) = write_exit_file(&exits_dir, c.id(), status.code) {
                        warn!(container = %c.id(), error = %e, "failed to write exit file");
                    }
                    if let Err(e) = record_task_exit(&c, status, &metrics) {
                        warn!(container = %c.id(), error = %e, "failed to record task exit");
                    }
                }
                Err(e) => warn!(container = %c.id(), error = %e, "waiting for task exit failed"),
            }
            io.mark_exited();
        });
        if let Ok(mut watchers) = self.watchers.lock()
            && let Some(previous) = watchers.insert(c.id().to_string(), handle)
        {
            previous.abort();
        }
    }

    /// Waits for the task to exit, at most `timeout`. Overlapping stops may
    /// shorten the deadline through `guard`.
    async fn wait_task_exit(
        &self,
        task: &Task,
        c: &Container,
        timeout: Duration,
        mut guard: Option<&mut StopGuard>,
    ) -> Result<bool> {
        let wait = task.wait(c.id(), None);
        tokio::pin!(wait);
        let mut deadline = Instant::now() + timeout;
        loop {
            tokio::select! {
                res = &mut wait => {
                    return match res {
                        Ok(status) => {
                            record_task_exit(c, status, &self.metrics)?;
                            Ok(true)
                        }
                        Err(e) if e.is_not_found() => {
                            c.set_stopped_now()?;
                            Ok(true)
                        }
                        Err(e) => Err(Error::StopFailed {
                            id: c.id().to_string(),
                            reason: e.to_string(),
                        }),
                    };
                }
                _ = tokio::time::sleep_until(deadline) => return Ok(false),
                _ = tokio::time::sleep(STOP_POLL_INTERVAL), if guard.is_some() => {
                    if let Some(requested) = guard.as_deref_mut().and_then(StopGuard::requested_timeout) {
                        let candidate = Instant::now() + requested;
                        if candidate < deadline {
                            debug!(container = %c.id(), timeout = ?requested, "stop deadline shortened");
                            deadline = candidate;
                        }
                    }
                }
            }
        }
    }

    /// Sends `sig`; `Ok(false)` if the task is already gone.
    async fn kill_task(&self, task: &Task, c: &Container, sig: Signal) -> Result<bool> {
        match task.kill(c.id(), None, sig.as_i32(), false).await {
            Ok(()) => Ok(true),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(Error::StopFailed {
                id: c.id().to_string(),
                reason: e.to_string(),
            }),
        }
    }

    /// Registers an exec process with the shim and opens the daemon's FIFO
    /// ends. The process is started separately.
    async fn prepare_exec(
        &self,
        task: &Task,
        c: &Container,
        exec_id: &str,
        fifos: &FifoSet,
        spec: &serde_json::Value,
    ) -> Result<OpenFifos> {
        let open = fifos.open()?;
        task.exec(c.id(), exec_id, fifos.process_io(), spec).await?;
        Ok(open)
    }

    async fn remove_exec(&self, task: &Task, c: &Container, exec_id: &str) {
        if let Err(e) = task.delete(c.id(), Some(exec_id)).await {
            debug!(container = %c.id(), exec_id, error = %e, "failed to delete exec process");
        }
    }

    async fn run_exec(
        &self,
        task: &Task,
        c: &Container,
        exec_id: &str,
        fifos: &FifoSet,
        spec: serde_json::Value,
        mut streams: StreamOptions,
    ) -> Result<()> {
        let open = self.prepare_exec(task, c, exec_id, fifos, &spec).await?;

        let mut input = None;
        if let (Some(mut src), Some(mut dst)) = (streams.stdin.take(), open.stdin) {
            let task = Arc::clone(task);
            let id = c.id().to_string();
            let exec_id = exec_id.to_string();
            input = Some(tokio::spawn(async move {
                if let Err(e) = tokio::io::copy(&mut src, &mut dst).await {
                    debug!(container = %id, error = %e, "exec stdin copy failed");
                }
                if let Err(e) = task.close_io(&id, Some(&exec_id)).await {
                    debug!(container = %id, error = %e, "failed to close exec stdin");
                }
            }));
        }
        let mut outputs = Vec::new();
        if let Some(mut dst) = streams.stdout.take() {
            let mut src = open.stdout;
            outputs.push(tokio::spawn(async move {
                tokio::io::copy(&mut src, &mut dst).await
            }));
        }
        if let (Some(mut src), Some(mut dst)) = (open.stderr, streams.stderr.take()) {
            outputs.push(tokio::spawn(async move {
                tokio::io::copy(&mut src, &mut dst).await
            }));
        }
        if let Some(resize) = streams.resize.take() {
            spawn_resize_forwarder(
                Arc::clone(task),
                c.id().to_string(),
                Some(exec_id.to_string()),
                resize,
            );
        }

        let started = task.start(c.id(), Some(exec_id)).await;
        let status = match started {
            Ok(pid) => {
                debug!(container = %c.id(), exec_id, pid, "exec started");
                task.wait(c.id(), Some(exec_id)).await
            }
            Err(e) => Err(e),
        };

        // The daemon holds both FIFO ends, so output never reaches EOF.
        for mut output in outputs {
            if tokio::time::timeout(EXEC_IO_DRAIN, &mut output).await.is_err() {
                output.abort();
            }
        }
        if let Some(input) = input {
            input.abort();
        }
        self.remove_exec(task, c, exec_id).await;

        let status = status?;
        if status.code != 0 {
            return Err(Error::ExecFailed {
                container: c.id().to_string(),
                reason: format!("command exited with code {}", status.code),
            });
        }
        Ok(())
    }

    /// Runs an exec process to completion, buffering its output.
    ///
    /// At the deadline the process gets SIGKILL and the call reports
    /// [`ExecSyncResponse::timed_out`] without waiting for the shim to
    /// confirm the exit.
    async fn run_exec_sync(
        &self,
        task: &Task,
        c: &Container,
        exec_id: &str,
        fifos: &FifoSet,
        spec: serde_json::Value,
        timeout: Option<Duration>,
    ) -> Result<ExecSyncResponse> {
        let open = self.prepare_exec(task, c, exec_id, fifos, &spec).await?;
        let stop = CancellationToken::new();
        let stdout = tokio::spawn(collect_output(
            open.stdout,
            MAX_EXEC_SYNC_OUTPUT,
            stop.clone(),
        ));
        let stderr = open
            .stderr
            .map(|src| tokio::spawn(collect_output(src, MAX_EXEC_SYNC_OUTPUT, stop.clone())));

        if let Err(e) = task.start(c.id(), Some(exec_id)).await {
            stop.cancel();
            self.remove_exec(task, c, exec_id).await;
            return Err(e.into());
        }

        let wait = task.wait(c.id(), Some(exec_id));
        let status = match timeout {
            Some(limit) => match tokio::time::timeout(limit, wait).await {
                Ok(status) => status,
                Err(_) => {
                    stop.cancel();
                    warn!(container = %c.id(), exec_id, ?limit, "exec sync timed out, sending SIGKILL");
                    if let Err(e) = task
                        .kill(c.id(), Some(exec_id), Signal::KILL.as_i32(), false)
                        .await
                    {
                        debug!(container = %c.id(), exec_id, error = %e, "failed to kill timed out exec");
                    }
                    let task = Arc::clone(task);
                    let id = c.id().to_string();
                    let exec_id = exec_id.to_string();
                    tokio::spawn(async move {
                        let _ = tokio::time::timeout(
                            KILL_CONTAINER_TIMEOUT,
                            task.wait(&id, Some(&exec_id)),
                        )
                        .await;
                        if let Err(e) = task.delete(&id, Some(&exec_id)).await {
                            debug!(container = %id, exec_id, error = %e, "failed to delete exec process");
                        }
                    });
                    return Ok(ExecSyncResponse::timed_out());
                }
            },
            None => wait.await,
        };

        tokio::time::sleep(EXEC_IO_DRAIN).await;
        stop.cancel();
        let stdout = stdout.await.unwrap_or_default();
        let stderr = match stderr {
            Some(handle) => handle.await.unwrap_or_default(),
            None => Vec::new(),
        };
        self.remove_exec(task, c, exec_id).await;

        let status = status?;
        Ok(ExecSyncResponse {
            stdout,
            stderr,
            exit_code: status.code,
        })
    }

    fn exec_fifos(&self, c: &Container, exec_id: &str, stdin: bool, tty: bool) -> Result<FifoSet> {
        Ok(FifoSet::create(
            c.bundle_path(),
            &format!("exec-{}", exec_id),
            stdin,
            tty,
        )?)
    }
}

#[async_trait]
impl RuntimeImpl for VmRuntime {
    fn name(&self) -> &str {
        &self.handler
    }

    async fn create_container(&self, c: &Arc<Container>, _cgroup_parent: &str) -> Result<()> {
        let _op = c.op_lock().await;
        let shim = if c.is_infra() {
            let shim = self.start_shim(c).await?;
            let _ = self.sandbox.set(c.sandbox().to_string());
            self.server.set(shim.clone())?;
            shim
        } else {
            self.shim(c).await?
        };
        persist_address(c, &shim.address)?;
        let task = shim.task;

        let fifos = FifoSet::create(c.bundle_path(), "io", c.stdin(), c.terminal())?;
        let io = match ContainerIo::start(c.id(), fifos.clone(), c.log_path().to_path_buf()) {
            Ok(io) => Arc::new(io),
            Err(e) => {
                fifos.remove();
                return Err(e.into());
            }
        };

        let request = CreateTask {
            id: c.id().to_string(),
            bundle: c.bundle_path().to_path_buf(),
            io: io.fifos().process_io(),
            config_path: self.shim_config.clone(),
        };
        let pid = match task.create(request).await {
            Ok(pid) => pid,
            Err(e) => {
                error!(container = %c.id(), error = %e, "task creation failed");
                io.mark_exited();
                io.fifos().remove();
                if c.is_infra() {
                    if let Err(e) = task.shutdown(c.id()).await {
                        debug!(sandbox = %c.id(), error = %e, "failed to shut down shim");
                    }
                    self.server.take();
                    self.stop_shim_log();
                }
                return Err(Error::CreateFailed {
                    id: c.id().to_string(),
                    reason: e.to_string(),
                });
            }
        };
        if c.is_infra() {
            match task.connect(c.id()).await {
                Ok(shim_pid) => debug!(sandbox = %c.sandbox(), shim_pid, "shim connected"),
                Err(e) => debug!(sandbox = %c.sandbox(), error = %e, "shim connect failed"),
            }
        }

        if let Err(e) = c.set_init_pid(pid) {
            debug!(container = %c.id(), pid, error = %e, "task PID not visible on the host");
            c.update_state(|s| s.pid = pid)?;
        }
        if let Ok(mut ios) = self.ios.lock() {
            ios.insert(c.id().to_string(), Arc::clone(&io));
        }
        self.spawn_exit_watcher(c, task, io);
        c.set_created();
        info!(container = %c.id(), pid, "created VM container");
        Ok(())
    }

    async fn start_container(&self, c: &Arc<Container>) -> Result<()> {
        let _op = c.op_lock().await;
        let task = self.task(c).await?;
        task.start(c.id(), None)
            .await
            .map_err(|e| Error::StartFailed {
                id: c.id().to_string(),
                reason: e.to_string(),
            })?;
        c.update_state(|s| {
            s.transition(ContainerStatus::Running);
            s.started = Some(Utc::now());
        })?;
        info!(container = %c.id(), "started VM container");
        Ok(())
    }

    async fn exec_container(
        &self,
        c: &Arc<Container>,
        cmd: &[String],
        streams: StreamOptions,
    ) -> Result<()> {
        if cmd.is_empty() {
            return Err(Error::ExecFailed {
                container: c.id().to_string(),
                reason: "empty command".to_string(),
            });
        }
        let task = self.task(c).await?;
        let exec_id = Uuid::new_v4().simple().to_string();
        let spec = exec_process_spec(c, cmd, streams.tty)?;
        let fifos = self.exec_fifos(c, &exec_id, streams.stdin.is_some(), streams.tty)?;
        let result = self
            .run_exec(&task, c, &exec_id, &fifos, spec, streams)
            .await;
        fifos.remove();
        result
    }

    async fn exec_sync_container(
        &self,
        c: &Arc<Container>,
        cmd: &[String],
        timeout: Option<Duration>,
    ) -> Result<ExecSyncResponse> {
        if cmd.is_empty() {
            return Err(Error::ExecFailed {
                container: c.id().to_string(),
                reason: "empty command".to_string(),
            });
        }
        let task = self.task(c).await?;
        let exec_id = Uuid::new_v4().simple().to_string();
        let tty = c.terminal();
        let spec = exec_process_spec(c, cmd, tty)?;
        let fifos = self.exec_fifos(c, &exec_id, false, tty)?;
        let result = self
            .run_exec_sync(&task, c, &exec_id, &fifos, spec, timeout)
            .await;
        fifos.remove();
        result
    }

    async fn update_container(
        &self,
        c: &Arc<Container>,
        resources: &LinuxResources,
    ) -> Result<()> {
        let _op = c.op_lock().await;
        let task = self.task(c).await?;
        Ok(task.update(c.id(), resources).await?)
    }

    async fn stop_container(&self, c: &Arc<Container>, timeout: Duration) -> Result<()> {
        let Some(mut guard) = c.set_as_stopping()? else {
            debug!(container = %c.id(), ?timeout, "stop already in progress");
            c.wait_on_stop_timeout(timeout, &CancellationToken::new())
                .await;
            return Ok(());
        };
        let _op = c.op_lock().await;
        c.should_be_stopped()?;
        let task = self.task(c).await?;

        if !timeout.is_zero() {
            let sig = c.stop_signal();
            if !self.kill_task(&task, c, sig).await? {
                c.set_stopped_now()?;
                return Ok(());
            }
            if self
                .wait_task_exit(&task, c, timeout, Some(&mut guard))
                .await?
            {
                info!(container = %c.id(), signal = %sig, "stopped VM container");
                return Ok(());
            }
            warn!(
                container = %c.id(),
                ?timeout,
                signal = %sig,
                "stop signal timed out, sending SIGKILL"
            );
        }

        if !self.kill_task(&task, c, Signal::KILL).await? {
            c.set_stopped_now()?;
            return Ok(());
        }
        if self
            .wait_task_exit(&task, c, KILL_CONTAINER_TIMEOUT, None)
            .await?
        {
            info!(container = %c.id(), "killed VM container");
            return Ok(());
        }
        Err(Error::StopFailed {
            id: c.id().to_string(),
            reason: format!(
                "task did not exit within {:?} of SIGKILL",
                KILL_CONTAINER_TIMEOUT
            ),
        })
    }

    async fn delete_container(&self, c: &Arc<Container>) -> Result<()> {
        let _op = c.op_lock().await;
        let task = self.task(c).await?;
        match task.delete(c.id(), None).await {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {
                debug!(container = %c.id(), "task already deleted");
            }
            Err(e) => {
                return Err(Error::DeleteFailed {
                    id: c.id().to_string(),
                    reason: e.to_string(),
                });
            }
        }
        if let Ok(mut watchers) = self.watchers.lock()
            && let Some(watcher) = watchers.remove(c.id())
        {
            watcher.abort();
        }
        if let Ok(mut ios) = self.ios.lock()
            && let Some(io) = ios.remove(c.id())
        {
            io.mark_exited();
            io.fifos().remove();
        }
        if c.is_infra() {
            if let Err(e) = task.shutdown(c.id()).await {
                debug!(sandbox = %c.id(), error = %e, "shim shutdown failed");
            }
            self.server.take();
            self.stop_shim_log();
        }
        debug!(container = %c.id(), "deleted VM container");
        Ok(())
    }

    async fn update_container_status(&self, c: &Arc<Container>) -> Result<()> {
        let _op = c.op_lock().await;
        {
            let state = c.read_state()?;
            if state.status == ContainerStatus::Stopped && state.exit_code.is_some() {
                return Ok(());
            }
        }

        let queried = match self.task(c).await {
            Ok(task) => task.state(c.id()).await.map_err(Error::from),
            Err(e) => Err(e),
        };
        let state = match queried {
            Ok(state) => state,
            Err(e) => {
                debug!(
                    container = %c.id(),
                    error = %e,
                    "task state failed, treating container as stopped"
                );
                return recover_from_exit_files(c, &self.config.container_exits_dir, &self.metrics);
            }
        };

        let status = match state.status {
            TaskStatus::Created => ContainerStatus::Created,
            TaskStatus::Running => ContainerStatus::Running,
            TaskStatus::Paused | TaskStatus::Pausing => ContainerStatus::Paused,
            TaskStatus::Stopped => {
                return record_task_exit(
                    c,
                    ExitStatus {
                        code: state.exit_status,
                        exited_at: state.exited_at,
                    },
                    &self.metrics,
                );
            }
            TaskStatus::Unknown => {
                debug!(container = %c.id(), "shim reports unknown task status");
                return Ok(());
            }
        };
        c.update_state(|s| {
            s.transition(status);
            s.pid = state.pid;
        })
    }

    async fn pause_container(&self, c: &Arc<Container>) -> Result<()> {
        let _op = c.op_lock().await;
        self.task(c).await?.pause(c.id()).await?;
        c.update_state(|s| {
            s.transition(ContainerStatus::Paused);
        })
    }

    async fn unpause_container(&self, c: &Arc<Container>) -> Result<()> {
        let _op = c.op_lock().await;
        self.task(c).await?.resume(c.id()).await?;
        c.update_state(|s| {
            s.transition(ContainerStatus::Running);
        })
    }

    async fn container_stats(&self, c: &Arc<Container>, _cgroup: &str) -> Result<ContainerStats> {
        Ok(self.task(c).await?.stats(c.id()).await?)
    }

    /// Signal 0 doubles as a liveness check: a task that was never
    /// connected, or whose shim is gone, is reported as not found.
    async fn signal_container(&self, c: &Arc<Container>, sig: Signal) -> Result<()> {
        let task = match self.task(c).await {
            Ok(task) => task,
            Err(Error::Shim(e)) if e.is_unreachable() => return Err(Error::ProcessNotFound),
            Err(e) => return Err(e),
        };
        match task.kill(c.id(), None, sig.as_i32(), false).await {
            Ok(()) => Ok(()),
            Err(e) if e.is_not_found() || e.is_unreachable() => Err(Error::ProcessNotFound),
            Err(e) => Err(Error::SignalFailed {
                id: c.id().to_string(),
                reason: e.to_string(),
            }),
        }
    }

    async fn attach_container(
        &self,
        c: &Arc<Container>,
        mut streams: StreamOptions,
    ) -> Result<()> {
        let io = self.io(c).ok_or_else(|| {
            Error::Internal(format!(
                "container {} has no IO relay; it was created by an earlier daemon",
                c.id()
            ))
        })?;
        let task = self.task(c).await?;
        if let Some(resize) = streams.resize.take() {
            spawn_resize_forwarder(Arc::clone(&task), c.id().to_string(), None, resize);
        }

        let tty = streams.tty;
        let exited = io.exited();
        let rx = io.subscribe();
        let mut stdout = streams.stdout.take();
        let mut stderr = streams.stderr.take();
        let output = async {
            let res = tokio::select! {
                res = forward_output(rx, &mut stdout, &mut stderr, tty) => res,
                _ = exited.cancelled() => Ok(()),
            };
            for w in [stdout.as_mut(), stderr.as_mut()].into_iter().flatten() {
                let _ = w.shutdown().await;
            }
            res
        };

        let stdin = streams.stdin.take();
        let has_input = stdin.is_some();
        let input = async {
            let src = stdin?;
            let mut sink = io.stdin().lock().await;
            let dst = sink.as_mut()?;
            Some(copy_detachable(src, dst, DEFAULT_DETACH_KEYS).await)
        };
        tokio::pin!(input, output);

        tokio::select! {
            res = &mut output => res.map_err(Error::from),
            outcome = &mut input => {
                if let Some(Ok(CopyOutcome::Detached)) = outcome {
                    debug!(container = %c.id(), "attach detached");
                    return Ok(());
                }
                if has_input && c.stdin_once() {
                    if let Err(e) = task.close_io(c.id(), None).await {
                        debug!(container = %c.id(), error = %e, "failed to close container stdin");
                    }
                    io.stdin().lock().await.take();
                }
                if has_input && c.stdin() && !c.stdin_once() && !tty {
                    return Ok(());
                }
                output.await.map_err(Error::from)
            }
        }
    }

    async fn port_forward_container(
        &self,
        c: &Arc<Container>,
        netns_path: &Path,
        port: u16,
        stream: Box<dyn DuplexStream>,
        cancel: CancellationToken,
    ) -> Result<()> {
        debug!(container = %c.id(), netns = %netns_path.display(), port, "port forward");
        let conn = connect_in_netns(netns_path, port).await?;
        forward_bidirectional(stream, conn, &cancel).await
    }

    async fn reopen_container_log(&self, c: &Arc<Container>) -> Result<()> {
        match self.io(c) {
            Some(io) => Ok(io.reopen_log().await?),
            None => {
                debug!(container = %c.id(), "no IO relay, nothing to reopen");
                Ok(())
            }
        }
    }

    async fn shutdown(&self) -> Result<()> {
        if let Ok(mut watchers) = self.watchers.lock() {
            for (_, watcher) in watchers.drain() {
                watcher.abort();
            }
        }
        if let Ok(mut ios) = self.ios.lock() {
            ios.clear();
        }
        self.stop_shim_log();
        if let Some(shim) = self.server.take()
            && let Some(sandbox) = self.sandbox.get()
            && let Err(e) = shim.task.shutdown(sandbox).await
        {
            warn!(sandbox = %sandbox, error = %e, "shim shutdown failed");
        }
        Ok(())
    }
}
