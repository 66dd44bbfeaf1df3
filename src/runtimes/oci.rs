//! Monitor-process back-end.
//!
//! Every container gets a monitor process that launches it through the OCI
//! runtime, keeps its stdio and log, and writes its exit code when it exits.
//! After creation the daemon drives the OCI runtime CLI directly.
//!
//! # Create handshake
//!
//! ```text
//! daemon                                   monitor
//!   │ spawn, fd 3 = sync pipe, fd 4 = start   │
//!   │────────────────────────────────────────►│
//!   │ move monitor into its cgroup            │
//!   │ one byte on the start pipe              │
//!   │────────────────────────────────────────►│ runtime create
//!   │ wait for monitor exit (it daemonizes)   │
//!   │      {"pid": N, "message": ".."}        │
//!   │◄────────────────────────────────────────│ sync pipe
//! ```
//!
//! A `pid` of -1 reports failure. Any failure after the monitor exits
//! rolls the container back with `delete --force`.
//!
//! # Stop escalation
//!
//! ```text
//! stop signal ──(timeout, shortened by overlapping stops)──► SIGKILL
//!             ──(KILL_CONTAINER_TIMEOUT)──► StopFailed
//! ```

use crate::cgroup::CgroupManager;
use crate::config::{Config, RuntimeHandler};
use crate::constants::{
    ATTACH_FILE, CONFIG_FILE, CONTAINER_CREATE_TIMEOUT, CTL_FILE, DEFAULT_DETACH_KEYS,
    EXIT_FILE_BACKOFF_FACTOR, EXIT_FILE_BACKOFF_INITIAL, EXIT_FILE_BACKOFF_STEPS,
    KILL_CONTAINER_TIMEOUT, MAX_EXEC_SYNC_OUTPUT, MAX_SYNC_MESSAGE_SIZE, MONITOR_PID_FILE,
    PID_FILE, REOPEN_LOG_TIMEOUT, START_PIPE_ENV, START_PIPE_FD, STOP_POLL_INTERVAL,
    SYNC_PIPE_ENV, SYNC_PIPE_FD,
};
use crate::container::{Container, ContainerStatus, StopGuard};
use crate::error::{Error, Result};
use crate::metrics::Metrics;
use crate::process;
use crate::runtime::{ExecSyncResponse, LinuxResources, RuntimeImpl};
use crate::signal::Signal;
use crate::stats::{ContainerStats, read_cgroup_stats};
use crate::streams::{
    CopyOutcome, DuplexStream, StreamOptions, connect_in_netns, connect_seqpacket,
    copy_detachable, copy_pty_output, demux_attach_output, forward_bidirectional, open_pty,
    read_limited, set_winsize,
};
use crate::watch::{FileWatcher, wait_for_file};
use super::{check_oom, read_exit_file, recover_from_exit_files};
use async_trait::async_trait;
use chrono::Utc;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use std::io;
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, Command};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::level_filters::LevelFilter;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Lowest descriptor used to stage pipe ends in the monitor child.
const STAGING_FD_MIN: RawFd = 10;

/// Message the monitor writes on the sync pipe.
#[derive(Debug, Deserialize)]
struct SyncInfo {
    pid: i32,
    #[serde(default)]
    message: String,
}

/// The part of `<runtime> state` output the supervisor consumes.
#[derive(Debug, Deserialize)]
struct OciState {
    #[serde(default)]
    pid: i32,
    status: String,
}

/// Temporary file removed on drop.
#[derive(Debug)]
struct TempPath(PathBuf);

impl TempPath {
    fn new(prefix: &str) -> Self {
        Self(std::env::temp_dir().join(format!("{}-{}", prefix, Uuid::new_v4())))
    }

    fn path(&self) -> &Path {
        &self.0
    }
}

impl Drop for TempPath {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.0)
            && e.kind() != io::ErrorKind::NotFound
        {
            warn!(path = %self.0.display(), error = %e, "could not remove temporary file");
        }
    }
}

/// Monitor-process supervised OCI runtime.
pub struct OciRuntime {
    handler: String,
    path: PathBuf,
    root: PathBuf,
    monitor_path: PathBuf,
    config: Arc<Config>,
    cgroup_manager: Arc<dyn CgroupManager>,
    metrics: Arc<Metrics>,
}

impl std::fmt::Debug for OciRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OciRuntime")
            .field("handler", &self.handler)
            .field("path", &self.path)
            .field("root", &self.root)
            .field("monitor_path", &self.monitor_path)
            .finish()
    }
}

impl OciRuntime {
    /// Creates the back-end for one runtime handler.
    pub fn new(
        handler_name: &str,
        handler: &RuntimeHandler,
        config: Arc<Config>,
        cgroup_manager: Arc<dyn CgroupManager>,
        metrics: Arc<Metrics>,
    ) -> Self {
        let monitor_path = handler
            .monitor_path
            .clone()
            .unwrap_or_else(|| config.monitor_path.clone());
        Self {
            handler: handler_name.to_string(),
            path: handler.runtime_path.clone(),
            root: handler.root(),
            monitor_path,
            config,
            cgroup_manager,
            metrics,
        }
    }

    /// OCI runtime binary.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// OCI runtime state root.
    pub fn root(&self) -> &Path {
        &self.root
    }

    pub(crate) fn config(&self) -> &Config {
        &self.config
    }

    pub(crate) fn monitor_path(&self) -> &Path {
        &self.monitor_path
    }

    pub(crate) fn uses_systemd(&self) -> bool {
        self.cgroup_manager.is_systemd()
    }

    /// `<runtime> --root <root>`, ready for a subcommand.
    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.path);
        cmd.arg("--root").arg(&self.root);
        cmd
    }

    fn describe(&self, args: &[&str]) -> String {
        format!(
            "{} {}",
            self.path.display(),
            args.first().copied().unwrap_or_default()
        )
    }

    /// Runs a runtime subcommand to completion and returns its stdout.
    async fn run(&self, args: &[&str], stdin: Option<Vec<u8>>) -> Result<Vec<u8>> {
        debug!(runtime = %self.path.display(), ?args, "running OCI runtime");
        let mut cmd = self.command();
        cmd.args(args)
            .stdin(if stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        let mut child = cmd.spawn().map_err(|e| Error::RuntimeCommand {
            command: self.describe(args),
            code: None,
            stderr: e.to_string(),
        })?;
        if let Some(input) = stdin
            && let Some(mut pipe) = child.stdin.take()
        {
            pipe.write_all(&input).await?;
        }
        let output = child.wait_with_output().await?;
        if !output.status.success() {
            return Err(Error::RuntimeCommand {
                command: self.describe(args),
                code: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(output.stdout)
    }

    /// `<runtime> kill <id> <signal>`.
    async fn kill(&self, c: &Container, sig: Signal) -> Result<()> {
        let name = sig.name();
        self.run(&["kill", c.id(), &name], None).await.map(|_| ())
    }

    // =========================================================================
    // Create
    // =========================================================================

    /// Places a monitor process in the container's monitor cgroup. Failure
    /// is logged only.
    pub(crate) fn move_monitor_to_cgroup(&self, c: &Container, cgroup_parent: &str, pid: i32) {
        let Some(cgroup) = self
            .cgroup_manager
            .monitor_cgroup_path(c.id(), cgroup_parent)
        else {
            return;
        };
        if let Err(e) = self.cgroup_manager.move_pid_to_cgroup(&cgroup, pid) {
            warn!(container = %c.id(), pid, error = %e, "failed to move monitor into cgroup");
        }
    }

    /// Monitor command line for `c`.
    pub(crate) fn monitor_args(&self, c: &Container) -> Vec<String> {
        let bundle = c.bundle_path();
        let mut args: Vec<String> = Vec::new();
        if self.cgroup_manager.is_systemd() {
            args.push("-s".into());
        } else {
            args.push("--syslog".into());
        }
        args.extend([
            "-c".into(),
            c.id().to_string(),
            "-n".into(),
            c.name().to_string(),
            "-u".into(),
            c.id().to_string(),
            "-r".into(),
            self.path.display().to_string(),
            "-b".into(),
            bundle.display().to_string(),
            "-p".into(),
            bundle.join(PID_FILE).display().to_string(),
            "-P".into(),
            bundle.join(MONITOR_PID_FILE).display().to_string(),
            "-l".into(),
            c.log_path().display().to_string(),
            "--exit-dir".into(),
            self.config.container_exits_dir.display().to_string(),
            "--persist-dir".into(),
            c.dir().display().to_string(),
            "--socket-dir-path".into(),
            self.config.container_attach_socket_dir.display().to_string(),
            "--log-level".into(),
            monitor_log_level().to_string(),
            "--runtime-arg".into(),
            format!("--root={}", self.root.display()),
        ]);
        if self.config.log_size_max >= 0 {
            args.push("--log-size-max".into());
            args.push(self.config.log_size_max.to_string());
        }
        if self.config.log_to_journald {
            args.push("--log-path".into());
            args.push("journald:".into());
        }
        if self.config.no_pivot {
            args.push("--no-pivot".into());
        }
        if c.terminal() {
            args.push("-t".into());
        } else if c.stdin() {
            if !c.stdin_once() {
                args.push("--leave-stdin-open".into());
            }
            args.push("-i".into());
        }
        args
    }

    fn spawn_monitor(
        &self,
        c: &Container,
        child_sync: &std::os::unix::net::UnixStream,
        child_start: &std::os::unix::net::UnixStream,
    ) -> Result<Child> {
        let args = self.monitor_args(c);
        debug!(
            container = %c.id(),
            monitor = %self.monitor_path.display(),
            ?args,
            "running monitor"
        );

        let mut cmd = Command::new(&self.monitor_path);
        cmd.args(&args)
            .current_dir(c.bundle_path())
            .env_clear()
            .envs(
                self.config
                    .monitor_env
                    .iter()
                    .filter_map(|kv| kv.split_once('=')),
            )
            .env(SYNC_PIPE_ENV, SYNC_PIPE_FD.to_string())
            .env(START_PIPE_ENV, START_PIPE_FD.to_string())
            .stdin(Stdio::null());
        if let Ok(dir) = std::env::var("XDG_RUNTIME_DIR") {
            cmd.env("XDG_RUNTIME_DIR", dir);
        }

        let pipes = [
            (child_sync.as_raw_fd(), SYNC_PIPE_FD),
            (child_start.as_raw_fd(), START_PIPE_FD),
        ];
        // SAFETY: the hook only calls fcntl(2) and dup2(2), both
        // async-signal-safe, and allocates nothing.
        unsafe {
            cmd.pre_exec(move || install_fds(pipes));
        }

        cmd.spawn().map_err(|e| Error::CreateFailed {
            id: c.id().to_string(),
            reason: format!(
                "failed to spawn monitor {}: {}",
                self.monitor_path.display(),
                e
            ),
        })
    }

    /// Reads the sync message and records the init PID.
    async fn finish_create(
        &self,
        c: &Container,
        reader: &mut tokio::task::JoinHandle<Result<SyncInfo>>,
    ) -> Result<()> {
        let info = match tokio::time::timeout(CONTAINER_CREATE_TIMEOUT, &mut *reader).await {
            Err(_) => {
                reader.abort();
                error!(
                    container = %c.id(),
                    timeout = ?CONTAINER_CREATE_TIMEOUT,
                    "container creation timeout"
                );
                return Err(Error::Timeout {
                    operation: format!("create container {}", c.id()),
                    duration: CONTAINER_CREATE_TIMEOUT,
                });
            }
            Ok(joined) => joined
                .map_err(|e| Error::Internal(format!("sync pipe reader failed: {}", e)))?
                .map_err(|e| Error::CreateFailed {
                    id: c.id().to_string(),
                    reason: format!(
                        "error reading container (probably exited) json message: {}",
                        e
                    ),
                })?,
        };
        debug!(container = %c.id(), pid = info.pid, "received container pid");

        if info.pid == -1 {
            let reason = if info.message.is_empty() {
                "container create failed".to_string()
            } else {
                format!("container create failed: {}", info.message)
            };
            return Err(Error::CreateFailed {
                id: c.id().to_string(),
                reason,
            });
        }
        c.set_init_pid(info.pid)
    }

    // =========================================================================
    // Status
    // =========================================================================

    /// Waits for the monitor's exit file, with backoff, and records it.
    async fn record_exit(&self, c: &Container) -> Result<()> {
        let exit_path = self.config.container_exits_dir.join(c.id());
        let mut delay = EXIT_FILE_BACKOFF_INITIAL;
        let mut found = false;
        for _ in 0..EXIT_FILE_BACKOFF_STEPS {
            if tokio::fs::metadata(&exit_path).await.is_ok() {
                found = true;
                break;
            }
            tokio::time::sleep(delay).await;
            delay = delay.mul_f64(EXIT_FILE_BACKOFF_FACTOR);
        }

        if found {
            let (code, finished) = read_exit_file(&exit_path)?;
            c.update_state(|s| {
                s.exit_code = Some(code);
                s.finished = Some(finished);
            })?;
        } else {
            warn!(
                container = %c.id(),
                path = %exit_path.display(),
                "failed to find container exit file"
            );
            c.update_state(|s| {
                s.exit_code = Some(-1);
                s.finished.get_or_insert_with(Utc::now);
            })?;
        }
        check_oom(c, &self.metrics)
    }

    // =========================================================================
    // Exec
    // =========================================================================

    fn exec_command(&self, process_file: &Path) -> Command {
        let mut cmd = self.command();
        cmd.arg("exec").arg("--process").arg(process_file);
        cmd
    }
}

/// Maps the active tracing level to the monitor's `--log-level`.
pub(crate) fn monitor_log_level() -> &'static str {
    let level = LevelFilter::current();
    if level >= LevelFilter::TRACE {
        "trace"
    } else if level >= LevelFilter::DEBUG {
        "debug"
    } else if level >= LevelFilter::INFO {
        "info"
    } else if level >= LevelFilter::WARN {
        "warn"
    } else {
        "error"
    }
}

/// Places inherited pipe ends at fixed descriptor numbers in a forked child.
///
/// Sources are first duplicated above [`STAGING_FD_MIN`] so installing one
/// target can never clobber another source.
fn install_fds(pairs: [(RawFd, RawFd); 2]) -> io::Result<()> {
    let mut staged = [(0, 0); 2];
    for (slot, (src, dst)) in staged.iter_mut().zip(pairs) {
        // SAFETY: fcntl(2) on a descriptor inherited from the parent.
        let fd = unsafe { libc::fcntl(src, libc::F_DUPFD_CLOEXEC, STAGING_FD_MIN) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        *slot = (fd, dst);
    }
    for (src, dst) in staged {
        // SAFETY: dup2(2) onto a fixed target; the copy is not close-on-exec.
        if unsafe { libc::dup2(src, dst) } < 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

fn into_tokio(stream: std::os::unix::net::UnixStream) -> io::Result<tokio::net::UnixStream> {
    stream.set_nonblocking(true)?;
    tokio::net::UnixStream::from_std(stream)
}

/// Decodes the first JSON value from `src`, reading no more than `limit` bytes.
///
/// The writer may keep the pipe open after the message, so decoding stops
/// at the end of the first complete value instead of at EOF.
async fn read_json_message<T, R>(mut src: R, limit: usize) -> Result<T>
where
    T: DeserializeOwned,
    R: AsyncRead + Unpin,
{
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];
    loop {
        let n = src.read(&mut chunk).await?;
        if n == 0 {
            return Ok(serde_json::from_slice(&buf)?);
        }
        buf.extend_from_slice(&chunk[..n]);
        if buf.len() > limit {
            return Err(Error::Internal(format!(
                "sync message exceeds {} bytes",
                limit
            )));
        }
        match serde_json::Deserializer::from_slice(&buf)
            .into_iter::<T>()
            .next()
        {
            Some(Ok(value)) => return Ok(value),
            Some(Err(e)) if e.is_eof() => continue,
            Some(Err(e)) => return Err(e.into()),
            None => continue,
        }
    }
}

/// The process spec for an exec: the container's own process with new
/// arguments and terminal setting.
pub(crate) fn exec_process_spec(c: &Container, cmd: &[String], tty: bool) -> Result<serde_json::Value> {
    let spec = match c.spec() {
        Some(spec) => spec,
        None => match std::fs::read(c.bundle_path().join(CONFIG_FILE)) {
            Ok(data) => serde_json::from_slice(&data)?,
            Err(e) if e.kind() == io::ErrorKind::NotFound => serde_json::Value::Null,
            Err(e) => return Err(e.into()),
        },
    };
    let mut process = match spec.get("process") {
        Some(p) if p.is_object() => p.clone(),
        _ => serde_json::json!({ "cwd": "/", "user": { "uid": 0, "gid": 0 } }),
    };
    process["args"] = serde_json::json!(cmd);
    process["terminal"] = serde_json::json!(tty);
    Ok(process)
}

fn write_process_file(c: &Container, cmd: &[String], tty: bool) -> Result<TempPath> {
    let process = exec_process_spec(c, cmd, tty)?;
    let file = TempPath::new("exec-process");
    std::fs::write(file.path(), serde_json::to_vec(&process)?)?;
    Ok(file)
}

/// Exit code of a finished process; death by signal maps to `128 + signo`.
pub(crate) fn exit_code_of(status: ExitStatus) -> i32 {
    status
        .code()
        .unwrap_or_else(|| status.signal().map_or(-1, |sig| 128 + sig))
}

/// Waits for an exec to finish. With a timeout, the clock starts once the
/// runtime writes the PID file; `None` means the timeout hit.
async fn wait_exec(
    child: &mut Child,
    pid_file: &Path,
    timeout: Option<Duration>,
) -> io::Result<Option<ExitStatus>> {
    let Some(limit) = timeout else {
        return child.wait().await.map(Some);
    };
    let wait = child.wait();
    tokio::pin!(wait);
    tokio::select! {
        status = &mut wait => status.map(Some),
        _ = wait_for_file(pid_file) => match tokio::time::timeout(limit, &mut wait).await {
            Ok(status) => status.map(Some),
            Err(_) => Ok(None),
        },
    }
}

/// Polls liveness until the container is gone or the deadline passes.
///
/// With a guard, timeouts forwarded by overlapping stops may pull the
/// deadline in, never push it out.
async fn wait_for_exit(c: &Container, timeout: Duration, mut guard: Option<&mut StopGuard>) -> bool {
    let mut deadline = Instant::now() + timeout;
    loop {
        if !c.is_alive() {
            return true;
        }
        if let Some(requested) = guard.as_deref_mut().and_then(StopGuard::requested_timeout) {
            let candidate = Instant::now() + requested;
            if candidate < deadline {
                debug!(container = %c.id(), timeout = ?requested, "stop deadline shortened");
                deadline = candidate;
            }
        }
        if Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(STOP_POLL_INTERVAL).await;
    }
}

fn record_finished(c: &Container) -> Result<()> {
    c.update_state(|s| {
        s.finished.get_or_insert_with(Utc::now);
    })
}

/// Streams a session over a monitor's seqpacket attach socket.
pub(crate) async fn attach_socket(
    c: &Container,
    attach_path: &Path,
    mut streams: StreamOptions,
) -> Result<()> {
    let conn = connect_seqpacket(attach_path).map_err(|e| {
        Error::Internal(format!(
            "failed to connect to container {} attach socket: {}",
            c.id(),
            e
        ))
    })?;
    let (conn_rd, mut conn_wr) = conn.into_split();

    let tty = streams.tty;
    let stdin = streams.stdin.take();
    let has_input = stdin.is_some();
    let input = async move {
        let outcome = match stdin {
            Some(src) => Some(copy_detachable(src, &mut conn_wr, DEFAULT_DETACH_KEYS).await),
            None => None,
        };
        let _ = conn_wr.shutdown().await;
        outcome
    };

    let mut stdout = streams.stdout.take();
    let mut stderr = streams.stderr.take();
    if stdout.is_none() && stderr.is_none() {
        if let Some(Err(e)) = input.await {
            return Err(e.into());
        }
        return Ok(());
    }
    let output = demux_attach_output(conn_rd, &mut stdout, &mut stderr);
    tokio::pin!(input, output);

    tokio::select! {
        res = &mut output => res.map_err(Error::from),
        outcome = &mut input => {
            if let Some(Ok(CopyOutcome::Detached)) = outcome {
                debug!(container = %c.id(), "attach detached");
                return Ok(());
            }
            if has_input && c.stdin() && !c.stdin_once() && !tty {
                return Ok(());
            }
            output.await.map_err(Error::from)
        }
    }
}

#[async_trait]
impl RuntimeImpl for OciRuntime {
    fn name(&self) -> &str {
        &self.handler
    }

    async fn create_container(&self, c: &Arc<Container>, cgroup_parent: &str) -> Result<()> {
        let (parent_sync, child_sync) = std::os::unix::net::UnixStream::pair()?;
        let (parent_start, child_start) = std::os::unix::net::UnixStream::pair()?;

        let mut monitor = self.spawn_monitor(c, &child_sync, &child_start)?;
        drop(child_sync);
        drop(child_start);

        if let Some(pid) = monitor.id() {
            self.move_monitor_to_cgroup(c, cgroup_parent, pid as i32);
        }

        let mut start = into_tokio(parent_start)?;
        if let Err(e) = start.write_all(&[0]).await {
            let _ = monitor.wait().await;
            return Err(Error::CreateFailed {
                id: c.id().to_string(),
                reason: format!("failed to release monitor: {}", e),
            });
        }

        let sync = into_tokio(parent_sync)?;
        let mut reader = tokio::spawn(read_json_message::<SyncInfo, _>(
            sync,
            MAX_SYNC_MESSAGE_SIZE,
        ));

        let status = match monitor.wait().await {
            Ok(status) => status,
            Err(e) => {
                reader.abort();
                return Err(e.into());
            }
        };
        if !status.success() {
            reader.abort();
            return Err(Error::CreateFailed {
                id: c.id().to_string(),
                reason: format!("monitor failed: {}", status),
            });
        }

        let created = {
            let _op = c.op_lock().await;
            let res = self.finish_create(c, &mut reader).await;
            if res.is_ok() {
                c.set_created();
            }
            res
        };
        // The rollback delete takes the operation lock itself.
        if let Err(e) = created {
            error!(container = %c.id(), error = %e, "container creation failed");
            if let Err(del) = self.delete_container(c).await {
                warn!(container = %c.id(), error = %del, "unable to delete container");
            }
            return Err(e);
        }
        info!(container = %c.id(), handler = %self.handler, "created container");
        Ok(())
    }

    async fn start_container(&self, c: &Arc<Container>) -> Result<()> {
        let _op = c.op_lock().await;
        self.run(&["start", c.id()], None)
            .await
            .map_err(|e| Error::StartFailed {
                id: c.id().to_string(),
                reason: e.to_string(),
            })?;
        c.update_state(|s| {
            s.transition(ContainerStatus::Running);
            s.started = Some(Utc::now());
        })?;
        info!(container = %c.id(), "started container");
        Ok(())
    }

    async fn exec_container(
        &self,
        c: &Arc<Container>,
        cmd: &[String],
        mut streams: StreamOptions,
    ) -> Result<()> {
        if cmd.is_empty() {
            return Err(Error::ExecFailed {
                container: c.id().to_string(),
                reason: "empty command".to_string(),
            });
        }
        let process_file = write_process_file(c, cmd, streams.tty)?;
        let mut command = self.exec_command(process_file.path());
        command.arg(c.id());

        let pty = if streams.tty { Some(open_pty()?) } else { None };
        match &pty {
            Some(pty) => {
                command
                    .stdin(Stdio::from(pty.slave.try_clone()?))
                    .stdout(Stdio::from(pty.slave.try_clone()?))
                    .stderr(Stdio::from(pty.slave.try_clone()?));
                // SAFETY: setsid(2) and ioctl(2) are async-signal-safe.
                unsafe {
                    command.pre_exec(|| {
                        if libc::setsid() < 0 || libc::ioctl(0, libc::TIOCSCTTY, 0) < 0 {
                            return Err(io::Error::last_os_error());
                        }
                        Ok(())
                    });
                }
            }
            None => {
                command
                    .stdin(if streams.stdin.is_some() {
                        Stdio::piped()
                    } else {
                        Stdio::null()
                    })
                    .stdout(Stdio::piped())
                    .stderr(Stdio::piped());
            }
        }

        let mut child = command.spawn().map_err(|e| Error::ExecFailed {
            container: c.id().to_string(),
            reason: e.to_string(),
        })?;
        let pid = child.id().map_or(0, |p| p as i32);
        if let Err(e) = c.add_exec_pid(pid, true) {
            let _ = child.start_kill();
            return Err(e);
        }
        debug!(container = %c.id(), pid, ?cmd, "exec started");

        let mut input = None;
        let mut outputs = Vec::new();
        match pty {
            Some(pty) => {
                drop(pty.slave);
                let master = std::fs::File::from(pty.master);
                if let Some(mut resize) = streams.resize.take() {
                    let resize_fd = master.try_clone()?;
                    tokio::spawn(async move {
                        while let Some(size) = resize.recv().await {
                            if let Err(e) = set_winsize(&resize_fd, size) {
                                debug!(error = %e, "failed to resize exec terminal");
                            }
                        }
                    });
                }
                let reader = tokio::fs::File::from_std(master.try_clone()?);
                let mut writer = tokio::fs::File::from_std(master);
                if let Some(mut stdin) = streams.stdin.take() {
                    input = Some(tokio::spawn(async move {
                        tokio::io::copy(&mut stdin, &mut writer).await.map(|_| ())
                    }));
                }
                if let Some(stdout) = streams.stdout.take() {
                    outputs.push(tokio::spawn(async move {
                        copy_pty_output(reader, stdout).await.map(|_| ())
                    }));
                }
            }
            None => {
                if let (Some(mut src), Some(mut dst)) = (streams.stdin.take(), child.stdin.take()) {
                    input = Some(tokio::spawn(async move {
                        tokio::io::copy(&mut src, &mut dst).await?;
                        dst.shutdown().await
                    }));
                }
                if let (Some(mut src), Some(mut dst)) = (child.stdout.take(), streams.stdout.take())
                {
                    outputs.push(tokio::spawn(async move {
                        tokio::io::copy(&mut src, &mut dst).await?;
                        dst.shutdown().await
                    }));
                }
                if let (Some(mut src), Some(mut dst)) = (child.stderr.take(), streams.stderr.take())
                {
                    outputs.push(tokio::spawn(async move {
                        tokio::io::copy(&mut src, &mut dst).await?;
                        dst.shutdown().await
                    }));
                }
            }
        }

        let status = child.wait().await;
        c.delete_exec_pid(pid);
        for output in outputs {
            match output.await {
                Ok(Err(e)) => debug!(container = %c.id(), error = %e, "exec output copy failed"),
                Err(e) => debug!(container = %c.id(), error = %e, "exec output task failed"),
                Ok(Ok(())) => {}
            }
        }
        if let Some(input) = input {
            input.abort();
        }
        drop(process_file);

        let status = status?;
        if !status.success() {
            return Err(Error::ExecFailed {
                container: c.id().to_string(),
                reason: format!("command exited with code {}", exit_code_of(status)),
            });
        }
        Ok(())
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
        let process_file = write_process_file(c, cmd, false)?;
        let pid_file = TempPath::new("exec-pid");

        let mut command = self.exec_command(process_file.path());
        command
            .arg("--pid-file")
            .arg(pid_file.path())
            .arg(c.id())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0)
            .kill_on_drop(true);
        let mut child = command.spawn().map_err(|e| Error::ExecFailed {
            container: c.id().to_string(),
            reason: e.to_string(),
        })?;
        let pid = child.id().map_or(0, |p| p as i32);
        if let Err(e) = c.add_exec_pid(pid, false) {
            let _ = child.start_kill();
            return Err(e);
        }

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let stdout_task = tokio::spawn(async move {
            match stdout {
                Some(s) => read_limited(s, MAX_EXEC_SYNC_OUTPUT).await,
                None => Ok(Vec::new()),
            }
        });
        let stderr_task = tokio::spawn(async move {
            match stderr {
                Some(s) => read_limited(s, MAX_EXEC_SYNC_OUTPUT).await,
                None => Ok(Vec::new()),
            }
        });

        let waited = wait_exec(&mut child, pid_file.path(), timeout).await;
        c.delete_exec_pid(pid);

        let status = match waited {
            Ok(Some(status)) => status,
            Ok(None) => {
                warn!(container = %c.id(), ?timeout, ?cmd, "exec sync timed out");
                if process::kill_group(pid, Signal::KILL.as_i32()).is_err() {
                    let _ = process::kill(pid, Signal::KILL.as_i32());
                }
                let _ = child.wait().await;
                stdout_task.abort();
                stderr_task.abort();
                return Ok(ExecSyncResponse::timed_out());
            }
            Err(e) => {
                stdout_task.abort();
                stderr_task.abort();
                return Err(Error::ExecFailed {
                    container: c.id().to_string(),
                    reason: e.to_string(),
                });
            }
        };

        let join = |e: tokio::task::JoinError| Error::Internal(format!("exec output reader: {}", e));
        let stdout = stdout_task.await.map_err(join)??;
        let stderr = stderr_task.await.map_err(join)??;
        let exit_code = exit_code_of(status);
        debug!(container = %c.id(), exit_code, "exec sync finished");
        Ok(ExecSyncResponse {
            stdout,
            stderr,
            exit_code,
        })
    }

    async fn update_container(
        &self,
        c: &Arc<Container>,
        resources: &LinuxResources,
    ) -> Result<()> {
        let _op = c.op_lock().await;
        let data = serde_json::to_vec(resources)?;
        self.run(&["update", "--resources", "-", c.id()], Some(data))
            .await
            .map(|_| ())
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
        c.kill_exec_pids().await;

        if !c.is_alive() {
            record_finished(c)?;
            return Ok(());
        }

        if !timeout.is_zero() {
            let sig = c.stop_signal();
            if let Err(e) = self.kill(c, sig).await {
                if c.is_alive() {
                    return Err(Error::StopFailed {
                        id: c.id().to_string(),
                        reason: e.to_string(),
                    });
                }
                record_finished(c)?;
                return Ok(());
            }
            if wait_for_exit(c, timeout, Some(&mut guard)).await {
                record_finished(c)?;
                info!(container = %c.id(), signal = %sig, "stopped container");
                return Ok(());
            }
            warn!(
                container = %c.id(),
                ?timeout,
                signal = %sig,
                "stop signal timed out, sending SIGKILL"
            );
        }

        if let Err(e) = self.kill(c, Signal::KILL).await
            && c.is_alive()
        {
            return Err(Error::StopFailed {
                id: c.id().to_string(),
                reason: e.to_string(),
            });
        }
        if wait_for_exit(c, KILL_CONTAINER_TIMEOUT, None).await {
            record_finished(c)?;
            info!(container = %c.id(), "killed container");
            return Ok(());
        }
        Err(Error::StopFailed {
            id: c.id().to_string(),
            reason: format!(
                "process did not exit within {:?} of SIGKILL",
                KILL_CONTAINER_TIMEOUT
            ),
        })
    }

    async fn delete_container(&self, c: &Arc<Container>) -> Result<()> {
        let _op = c.op_lock().await;
        self.run(&["delete", "--force", c.id()], None)
            .await
            .map_err(|e| Error::DeleteFailed {
                id: c.id().to_string(),
                reason: e.to_string(),
            })?;
        debug!(container = %c.id(), "deleted container");
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

        let out = match self.run(&["state", c.id()], None).await {
            Ok(out) => out,
            Err(e) => {
                debug!(
                    container = %c.id(),
                    error = %e,
                    "runtime state failed, treating container as stopped"
                );
                return recover_from_exit_files(
                    c,
                    &self.config.container_exits_dir,
                    &self.metrics,
                );
            }
        };
        let oci: OciState = serde_json::from_slice(&out).map_err(|e| {
            Error::Internal(format!(
                "failed to decode container status for {}: {}",
                c.id(),
                e
            ))
        })?;
        let status = ContainerStatus::from_oci(&oci.status).ok_or_else(|| {
            Error::Internal(format!(
                "unknown status {:?} for container {}",
                oci.status,
                c.id()
            ))
        })?;

        c.update_state(|s| {
            if !s.transition(status) {
                debug!(
                    container = %c.id(),
                    from = %s.status,
                    to = %status,
                    "ignoring backwards status transition"
                );
            }
            s.pid = oci.pid;
        })?;

        if status == ContainerStatus::Stopped {
            self.record_exit(c).await?;
        }
        Ok(())
    }

    async fn pause_container(&self, c: &Arc<Container>) -> Result<()> {
        let _op = c.op_lock().await;
        self.run(&["pause", c.id()], None).await?;
        c.update_state(|s| {
            s.transition(ContainerStatus::Paused);
        })
    }

    async fn unpause_container(&self, c: &Arc<Container>) -> Result<()> {
        let _op = c.op_lock().await;
        self.run(&["resume", c.id()], None).await?;
        c.update_state(|s| {
            s.transition(ContainerStatus::Running);
        })
    }

    async fn container_stats(&self, c: &Arc<Container>, cgroup: &str) -> Result<ContainerStats> {
        let id = c.id().to_string();
        let root = self.config.cgroup_root.clone();
        let cgroup = cgroup.to_string();
        tokio::task::spawn_blocking(move || read_cgroup_stats(&id, &root, &cgroup))
            .await
            .map_err(|e| Error::Internal(format!("stats reader failed: {}", e)))?
    }

    async fn signal_container(&self, c: &Arc<Container>, sig: Signal) -> Result<()> {
        let _op = c.op_lock().await;
        self.kill(c, sig).await.map_err(|e| Error::SignalFailed {
            id: c.id().to_string(),
            reason: e.to_string(),
        })
    }

    async fn attach_container(
        &self,
        c: &Arc<Container>,
        mut streams: StreamOptions,
    ) -> Result<()> {
        if let Some(mut resize) = streams.resize.take() {
            let ctl_path = c.bundle_path().join(CTL_FILE);
            let mut ctl = tokio::fs::OpenOptions::new()
                .write(true)
                .open(&ctl_path)
                .await
                .map_err(|e| {
                    Error::Internal(format!("failed to open container ctl file: {}", e))
                })?;
            let id = c.id().to_string();
            tokio::spawn(async move {
                while let Some(size) = resize.recv().await {
                    debug!(container = %id, ?size, "resize event");
                    let msg = format!("1 {} {}\n", size.height, size.width);
                    if let Err(e) = ctl.write_all(msg.as_bytes()).await {
                        debug!(container = %id, error = %e, "failed to write resize message");
                    }
                }
            });
        }

        let attach_path = self
            .config
            .container_attach_socket_dir
            .join(c.id())
            .join(ATTACH_FILE);
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
        debug!(container = %c.id(), netns = %netns_path.display(), port, "port forward");
        let conn = connect_in_netns(netns_path, port).await?;
        forward_bidirectional(stream, conn, &cancel).await
    }

    async fn reopen_container_log(&self, c: &Arc<Container>) -> Result<()> {
        let ctl_path = c.bundle_path().join(CTL_FILE);
        let mut ctl = tokio::fs::OpenOptions::new()
            .write(true)
            .open(&ctl_path)
            .await
            .map_err(|e| Error::Internal(format!("failed to open container ctl file: {}", e)))?;
        let mut watcher = FileWatcher::new(c.log_path()).await;
        ctl.write_all(b"2 0 0\n").await?;

        match tokio::time::timeout(REOPEN_LOG_TIMEOUT, watcher.changed()).await {
            Ok(()) => debug!(container = %c.id(), log = %c.log_path().display(), "log reopened"),
            Err(_) => warn!(
                container = %c.id(),
                timeout = ?REOPEN_LOG_TIMEOUT,
                "timed out waiting for log reopen"
            ),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_sync_message_with_open_pipe() {
        let (mut tx, rx) = tokio::io::duplex(256);
        tx.write_all(br#"{"pid": 4242}"#).await.unwrap();
        // Writer stays open, as the monitor's daemonized child keeps it.
        let info: SyncInfo = tokio::time::timeout(
            Duration::from_secs(5),
            read_json_message(rx, MAX_SYNC_MESSAGE_SIZE),
        )
        .await
        .unwrap()
        .unwrap();
        assert_eq!(info.pid, 4242);
        assert!(info.message.is_empty());
        drop(tx);
    }

    #[tokio::test]
    async fn test_sync_message_limit() {
        let big = vec![b' '; 128];
        let err = read_json_message::<SyncInfo, _>(&big[..], 64)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Internal(_)));
    }

    #[tokio::test]
    async fn test_sync_message_eof_without_value() {
        let empty: &[u8] = b"";
        assert!(read_json_message::<SyncInfo, _>(empty, 64).await.is_err());
    }

    #[test]
    fn test_exit_code_of_signal() {
        assert_eq!(exit_code_of(ExitStatus::from_raw(9)), 137);
        assert_eq!(exit_code_of(ExitStatus::from_raw(3 << 8)), 3);
    }
}
