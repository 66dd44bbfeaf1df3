//! Runtime back-ends.
//!
//! | Back-end | Process model | Talks to |
//! |----------|---------------|----------|
//! | [`OciRuntime`] | monitor process per container | OCI runtime CLI |
//! | [`VmRuntime`] | task-API shim per sandbox | shim RPC |
//! | [`PodRuntime`] | pod monitor per sandbox | monitor RPC + OCI runtime CLI |
//! | [`SpoofedRuntime`] | placeholder process | nothing |
//!
//! The helpers below are shared by the back-ends that recover exit data
//! from disk or talk to a long-lived task server.

pub mod oci;
pub mod pod;
pub mod spoofed;
pub mod vm;

mod fifo;

pub use self::oci::OciRuntime;
pub use self::pod::PodRuntime;
pub use self::spoofed::SpoofedRuntime;
pub use self::vm::VmRuntime;

use crate::constants::{ADDRESS_FILE, MAX_RPC_LINE_LEN, SHIM_START_TIMEOUT};
use crate::container::{Container, ContainerStatus};
use crate::error::{Error, Result};
use crate::metrics::Metrics;
use chrono::{DateTime, Utc};
use std::io;
use std::path::Path;
use std::process::Stdio;
use std::sync::RwLock;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::Command;
use tracing::{debug, info, warn};

/// Exit code recorded when a container vanished without an exit file.
pub(crate) const UNKNOWN_EXIT_CODE: i32 = 255;

// =============================================================================
// Exit Files
// =============================================================================

/// Reads a plain-text exit code and takes the file's mtime as the exit time.
pub(crate) fn read_exit_file(path: &Path) -> Result<(i32, DateTime<Utc>)> {
    let finished: DateTime<Utc> = std::fs::metadata(path)?.modified()?.into();
    let text = std::fs::read_to_string(path)?;
    let code = text.trim().parse::<i32>().map_err(|e| {
        Error::Internal(format!(
            "status code conversion failed for {}: {}",
            path.display(),
            e
        ))
    })?;
    Ok((code, finished))
}

/// Writes `<exits_dir>/<id>` the way the monitor does.
pub(crate) fn write_exit_file(exits_dir: &Path, id: &str, code: i32) -> Result<()> {
    std::fs::create_dir_all(exits_dir)?;
    std::fs::write(exits_dir.join(id), code.to_string())?;
    Ok(())
}

/// Flags an OOM kill once, counting it in `metrics`.
pub(crate) fn check_oom(c: &Container, metrics: &Metrics) -> Result<()> {
    if !c.oom_file_path().exists() {
        return Ok(());
    }
    let newly = c.update_state(|s| !std::mem::replace(&mut s.oom_killed, true))?;
    if newly {
        info!(container = %c.id(), "container was OOM killed");
        metrics.record_oom(c.name());
    }
    Ok(())
}

/// Marks a container the runtime lost track of as stopped.
///
/// Exit code and time come from `<exits_dir>/<id>` or `<bundle>/exit`;
/// with neither, the exit code is [`UNKNOWN_EXIT_CODE`].
pub(crate) fn recover_from_exit_files(
    c: &Container,
    exits_dir: &Path,
    metrics: &Metrics,
) -> Result<()> {
    let candidates = [exits_dir.join(c.id()), c.exit_file_path()];
    let recovered = candidates.iter().find_map(|p| read_exit_file(p).ok());
    if recovered.is_none() {
        debug!(container = %c.id(), "no exit file, recording unknown exit code");
    }
    c.update_state(|s| {
        s.transition(ContainerStatus::Stopped);
        s.pid = 0;
        match recovered {
            Some((code, finished)) => {
                s.exit_code = Some(code);
                s.finished = Some(finished);
            }
            None => {
                s.exit_code.get_or_insert(UNKNOWN_EXIT_CODE);
                s.finished.get_or_insert_with(Utc::now);
            }
        }
    })?;
    check_oom(c, metrics)
}

// =============================================================================
// Task Servers
// =============================================================================

/// Connection slot for a per-sandbox task server (VM shim or pod monitor).
///
/// Empty after a daemon restart; callers then redial the address persisted
/// in the container's bundle (see [`read_persisted_address`]).
#[derive(Debug)]
pub(crate) struct TaskServer<C> {
    client: RwLock<Option<C>>,
}

impl<C> Default for TaskServer<C> {
    fn default() -> Self {
        Self {
            client: RwLock::new(None),
        }
    }
}

impl<C: Clone> TaskServer<C> {
    pub(crate) fn set(&self, client: C) -> Result<()> {
        *self
            .client
            .write()
            .map_err(|e| Error::Internal(format!("lock poisoned: {}", e)))? = Some(client);
        Ok(())
    }

    pub(crate) fn take(&self) -> Option<C> {
        self.client.write().ok().and_then(|mut c| c.take())
    }

    pub(crate) fn is_connected(&self) -> bool {
        self.client.read().map(|c| c.is_some()).unwrap_or(false)
    }

    /// The client held in memory, if any.
    pub(crate) fn cached(&self) -> Result<Option<C>> {
        Ok(self
            .client
            .read()
            .map_err(|e| Error::Internal(format!("lock poisoned: {}", e)))?
            .clone())
    }
}

/// Reads the task server address from `<bundle>/address`.
///
/// `ProcessNotFound` when none was persisted: a task that was never
/// connected cannot be alive.
pub(crate) fn read_persisted_address(c: &Container) -> Result<String> {
    let path = c.bundle_path().join(ADDRESS_FILE);
    match std::fs::read_to_string(&path) {
        Ok(address) => Ok(address.trim().to_string()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            debug!(container = %c.id(), "no task server address persisted");
            Err(Error::ProcessNotFound)
        }
        Err(e) => Err(e.into()),
    }
}

/// Records the task server address in the container's bundle.
pub(crate) fn persist_address(c: &Container, address: &str) -> Result<()> {
    std::fs::write(c.bundle_path().join(ADDRESS_FILE), address)?;
    Ok(())
}

/// Spawns a task server and returns the address it prints on its first
/// stdout line.
///
/// The server may daemonize or stay in the foreground; either way it is
/// reaped in the background.
pub(crate) async fn launch_task_server(mut cmd: Command, id: &str) -> Result<String> {
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::null());
    let mut child = cmd.spawn().map_err(|e| Error::CreateFailed {
        id: id.to_string(),
        reason: format!("failed to spawn task server: {}", e),
    })?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| Error::Internal("task server stdout not captured".to_string()))?;

    let mut line = String::new();
    let mut reader = BufReader::new(stdout).take(MAX_RPC_LINE_LEN as u64);
    let read = tokio::time::timeout(SHIM_START_TIMEOUT, reader.read_line(&mut line)).await;
    drop(reader);

    let server_id = id.to_string();
    tokio::spawn(async move {
        match child.wait().await {
            Ok(status) => debug!(sandbox = %server_id, %status, "task server launcher exited"),
            Err(e) => warn!(sandbox = %server_id, error = %e, "failed to reap task server"),
        }
    });

    match read {
        Err(_) => {
            return Err(Error::Timeout {
                operation: format!("start task server for {}", id),
                duration: SHIM_START_TIMEOUT,
            });
        }
        Ok(res) => {
            res?;
        }
    }
    let address = line.trim();
    if address.is_empty() {
        return Err(Error::CreateFailed {
            id: id.to_string(),
            reason: "task server exited without printing its address".to_string(),
        });
    }
    info!(sandbox = %id, address, "task server started");
    Ok(address.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::ContainerConfig;
    use tempfile::TempDir;

    fn container(bundle: &Path) -> Container {
        Container::new(ContainerConfig {
            id: "ctr".to_string(),
            name: "ctr-name".to_string(),
            sandbox: "sb".to_string(),
            bundle_path: bundle.to_path_buf(),
            dir: bundle.to_path_buf(),
            ..Default::default()
        })
        .unwrap()
    }

    #[test]
    fn test_recover_prefers_exits_dir() {
        let tmp = TempDir::new().unwrap();
        let exits = tmp.path().join("exits");
        write_exit_file(&exits, "ctr", 137).unwrap();
        std::fs::write(tmp.path().join("exit"), "1").unwrap();

        let c = container(tmp.path());
        recover_from_exit_files(&c, &exits, &Metrics::new()).unwrap();
        let state = c.state().unwrap();
        assert_eq!(state.status, ContainerStatus::Stopped);
        assert_eq!(state.exit_code, Some(137));
    }

    #[test]
    fn test_recover_without_exit_file() {
        let tmp = TempDir::new().unwrap();
        let c = container(tmp.path());
        recover_from_exit_files(&c, &tmp.path().join("exits"), &Metrics::new()).unwrap();
        let state = c.state().unwrap();
        assert_eq!(state.exit_code, Some(UNKNOWN_EXIT_CODE));
        assert!(state.finished.is_some());
    }

    #[test]
    fn test_oom_counted_once() {
        let tmp = TempDir::new().unwrap();
        std::fs::write(tmp.path().join("oom"), "").unwrap();
        let c = container(tmp.path());
        let metrics = Metrics::new();
        check_oom(&c, &metrics).unwrap();
        check_oom(&c, &metrics).unwrap();
        assert!(c.state().unwrap().oom_killed);
        assert_eq!(metrics.containers_oom("ctr-name"), 1);
    }

    #[test]
    fn test_missing_address_is_not_found() {
        let tmp = TempDir::new().unwrap();
        let c = container(tmp.path());
        assert!(matches!(read_persisted_address(&c), Err(Error::ProcessNotFound)));
    }

    #[test]
    fn test_persisted_address_round_trips_trimmed() {
        let tmp = TempDir::new().unwrap();
        let c = container(tmp.path());
        persist_address(&c, "unix:///run/shim.sock\n").unwrap();
        assert_eq!(read_persisted_address(&c).unwrap(), "unix:///run/shim.sock");
    }

    #[test]
    fn test_task_server_slot() {
        let server: TaskServer<String> = TaskServer::default();
        assert!(!server.is_connected());
        assert_eq!(server.cached().unwrap(), None);
        server.set("a".to_string()).unwrap();
        assert_eq!(server.cached().unwrap().as_deref(), Some("a"));
        assert_eq!(server.take().as_deref(), Some("a"));
        assert!(!server.is_connected());
    }

    #[tokio::test]
    async fn test_launch_reads_printed_address() {
        let mut cmd = Command::new("/bin/sh");
        cmd.arg("-c").arg("echo unix:///run/x.sock; exit 0");
        let address = launch_task_server(cmd, "sb").await.unwrap();
        assert_eq!(address, "unix:///run/x.sock");
    }

    #[tokio::test]
    async fn test_launch_without_address_fails() {
        let mut cmd = Command::new("/bin/sh");
        cmd.arg("-c").arg("exit 1");
        let err = launch_task_server(cmd, "sb").await.unwrap_err();
        assert!(matches!(err, Error::CreateFailed { .. }));
    }
}
