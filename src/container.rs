//! The container entity and its state machine.
//!
//! ```text
//!   ┌─────────┐  start   ┌─────────┐  pause   ┌────────┐
//!   │ Created │ ───────► │ Running │ ───────► │ Paused │
//!   └────┬────┘          └────┬────┘ ◄─────── └───┬────┘
//!        │                    │      unpause      │
//!        │        process gone / stop             │
//!        └──────────────► ┌─────────┐ ◄───────────┘
//!                         │ Stopped │  (terminal)
//!                         └─────────┘
//! ```
//!
//! # Locking
//!
//! A [`Container`] carries three locks with distinct jobs:
//!
//! - `op_lock` (async read-write) serializes runtime operations on this
//!   container and may be held across awaits.
//! - `state` (sync read-write) guards the [`ContainerState`] fields and is
//!   only held for short, non-async sections.
//! - `stop` (sync mutex) guards stop coordination and exec PID tracking.
//!
//! Lock order: `op_lock` before `state`. The facade's implementation cache
//! lock is never held while waiting on `op_lock`.

use crate::constants::{
    DEFAULT_STOP_SIGNAL, EXIT_FILE, KUBERNETES_CONTAINER_NAME_LABEL, KUBERNETES_POD_NAME_LABEL,
    KUBERNETES_POD_NAMESPACE_LABEL, OOM_FILE, STATE_FILE, STOP_POLL_INTERVAL,
    validate_container_id,
};
use crate::error::{Error, Result};
use crate::process;
use crate::signal::Signal;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Upper bound on passes made by [`Container::kill_exec_pids`].
const MAX_EXEC_KILL_PASSES: usize = 50;

// =============================================================================
// Container Status
// =============================================================================

/// Lifecycle status of a container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerStatus {
    /// Created but not started.
    #[default]
    Created,
    /// Running.
    Running,
    /// Frozen.
    Paused,
    /// Exited. Terminal.
    Stopped,
}

impl ContainerStatus {
    /// Maps an OCI runtime `state` status string.
    ///
    /// `creating` is folded into `Created`.
    pub fn from_oci(status: &str) -> Option<Self> {
        match status {
            "creating" | "created" => Some(Self::Created),
            "running" => Some(Self::Running),
            "paused" => Some(Self::Paused),
            "stopped" => Some(Self::Stopped),
            _ => None,
        }
    }

    /// Returns true if a transition from `self` to `next` is allowed.
    ///
    /// Status only moves forward, except `Running ⇄ Paused`. Any
    /// non-terminal status may jump to `Stopped`. Re-entering the current
    /// status is always allowed.
    pub fn can_transition_to(self, next: Self) -> bool {
        use ContainerStatus::*;
        match (self, next) {
            (a, b) if a == b => true,
            (Stopped, _) => false,
            (_, Created) => false,
            (Created, _) | (Running, _) | (Paused, _) => true,
        }
    }
}

impl fmt::Display for ContainerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Created => write!(f, "created"),
            Self::Running => write!(f, "running"),
            Self::Paused => write!(f, "paused"),
            Self::Stopped => write!(f, "stopped"),
        }
    }
}

// =============================================================================
// Container State
// =============================================================================

/// Mutable state of a container, persisted as `<dir>/state.json`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerState {
    /// Lifecycle status.
    #[serde(default)]
    pub status: ContainerStatus,
    /// PID last reported by the runtime. Zero once the runtime reports the
    /// container gone.
    #[serde(default)]
    pub pid: i32,
    /// Creation time.
    pub created: DateTime<Utc>,
    /// Start time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started: Option<DateTime<Utc>>,
    /// Exit time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished: Option<DateTime<Utc>>,
    /// Exit code, once known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    /// Set when the OOM sentinel was found.
    #[serde(default, rename = "oomKilled")]
    pub oom_killed: bool,
    /// Last error message.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub error: String,
    /// Init PID captured at creation. Write-once.
    #[serde(default)]
    pub init_pid: i32,
    /// Kernel start time of the init PID. Write-once.
    #[serde(default)]
    pub init_start_time: String,
}

impl ContainerState {
    /// Creates a fresh `Created` state.
    pub fn new(created: DateTime<Utc>) -> Self {
        Self {
            created,
            ..Default::default()
        }
    }

    /// Records the init PID and its kernel start time.
    ///
    /// Fails if either value was already set; the first values stay intact.
    pub fn set_init_pid(&mut self, pid: i32) -> Result<()> {
        self.ensure_init_pid_unset()?;
        let start_time = process::start_time(pid)?;
        self.init_pid = pid;
        self.init_start_time = start_time;
        Ok(())
    }

    /// Records the init PID with an already-known start time.
    pub fn set_init_pid_with_start_time(&mut self, pid: i32, start_time: String) -> Result<()> {
        self.ensure_init_pid_unset()?;
        self.init_pid = pid;
        self.init_start_time = start_time;
        Ok(())
    }

    fn ensure_init_pid_unset(&self) -> Result<()> {
        if self.init_pid != 0 || !self.init_start_time.is_empty() {
            return Err(Error::InitPidAlreadySet {
                pid: self.init_pid,
                start_time: self.init_start_time.clone(),
            });
        }
        Ok(())
    }

    /// Moves to `next` if the state machine allows it.
    ///
    /// Returns false, leaving the status unchanged, otherwise.
    pub fn transition(&mut self, next: ContainerStatus) -> bool {
        if self.status.can_transition_to(next) {
            self.status = next;
            true
        } else {
            false
        }
    }

    /// Loads a state file, upgrading states written before init PID
    /// tracking existed.
    pub fn from_disk(path: &Path) -> Result<Self> {
        let data = std::fs::read(path)?;
        let mut state: ContainerState = serde_json::from_slice(&data)?;
        if state.init_pid == 0 && state.init_start_time.is_empty() && state.pid != 0 {
            state.set_init_pid(state.pid)?;
            info!(
                pid = state.init_pid,
                start_time = %state.init_start_time,
                "upgraded PID information from {}",
                path.display()
            );
        }
        Ok(state)
    }
}

// =============================================================================
// Stop Coordination
// =============================================================================

#[derive(Debug, Default)]
struct StopCoordinator {
    stopping: bool,
    timeouts: Option<mpsc::UnboundedSender<Duration>>,
    done: Option<watch::Receiver<bool>>,
    exec_pids: HashMap<i32, bool>,
}

/// Ownership of the single in-flight stop of a container.
///
/// Returned by [`Container::set_as_stopping`]. Overlapping stop requests
/// forward their timeouts to the holder, which may only ever shorten its
/// deadline. Dropping the guard (or calling [`StopGuard::finish`]) clears
/// the stopping flag and wakes every waiter; since the guard is consumed,
/// completion happens exactly once.
#[derive(Debug)]
pub struct StopGuard {
    coordinator: Arc<Mutex<StopCoordinator>>,
    timeouts: mpsc::UnboundedReceiver<Duration>,
    done: watch::Sender<bool>,
}

impl StopGuard {
    /// Returns the shortest timeout requested by overlapping stops since the
    /// last call, if any.
    pub fn requested_timeout(&mut self) -> Option<Duration> {
        let mut shortest: Option<Duration> = None;
        while let Ok(t) = self.timeouts.try_recv() {
            shortest = Some(shortest.map_or(t, |s| s.min(t)));
        }
        shortest
    }

    /// Completes the stop.
    pub fn finish(self) {}
}

impl Drop for StopGuard {
    fn drop(&mut self) {
        if let Ok(mut coordinator) = self.coordinator.lock() {
            coordinator.stopping = false;
            coordinator.timeouts = None;
            coordinator.done = None;
        }
        self.done.send_replace(true);
    }
}

// =============================================================================
// Container
// =============================================================================

/// Construction parameters for a [`Container`].
#[derive(Debug, Clone, Default)]
pub struct ContainerConfig {
    /// Unique ID, assigned by the caller.
    pub id: String,
    /// Human-readable name.
    pub name: String,
    /// Owning sandbox ID. Equal to `id` for the infra container.
    pub sandbox: String,
    /// Ephemeral bundle directory (rootfs + `config.json`).
    pub bundle_path: PathBuf,
    /// Persistent metadata directory.
    pub dir: PathBuf,
    /// Container log file.
    pub log_path: PathBuf,
    /// Labels.
    pub labels: HashMap<String, String>,
    /// Annotations.
    pub annotations: HashMap<String, String>,
    /// Image ID.
    pub image: String,
    /// Image name as requested.
    pub image_name: String,
    /// Resolved image reference.
    pub image_ref: String,
    /// Runtime handler name; empty selects the default handler.
    pub runtime_handler: String,
    /// Stop signal name or number; empty means SIGTERM.
    pub stop_signal: String,
    /// Allocate a terminal.
    pub terminal: bool,
    /// Keep stdin open.
    pub stdin: bool,
    /// Close stdin after the first attach disconnects.
    pub stdin_once: bool,
    /// Creation time; defaults to now.
    pub created: Option<DateTime<Utc>>,
}

/// One managed container.
///
/// Identity and paths are immutable. Everything that changes lives behind
/// the container's own locks, so a `Container` is shared as
/// `Arc<Container>` between the store, the facade and background tasks.
#[derive(Debug)]
pub struct Container {
    id: String,
    name: String,
    sandbox: String,
    bundle_path: PathBuf,
    dir: PathBuf,
    log_path: PathBuf,
    labels: HashMap<String, String>,
    annotations: HashMap<String, String>,
    image: String,
    image_name: String,
    image_ref: String,
    runtime_handler: String,
    stop_signal: String,
    terminal: bool,
    stdin: bool,
    stdin_once: bool,
    spoofed: bool,
    created: AtomicBool,
    mount_point: RwLock<Option<PathBuf>>,
    spec: RwLock<Option<serde_json::Value>>,
    state: RwLock<ContainerState>,
    op_lock: tokio::sync::RwLock<()>,
    stop: Arc<Mutex<StopCoordinator>>,
}

impl Container {
    /// Creates a container from its configuration.
    pub fn new(config: ContainerConfig) -> Result<Self> {
        validate_container_id(&config.id).map_err(|reason| Error::CreateFailed {
            id: config.id.clone(),
            reason: reason.to_string(),
        })?;
        let created = config.created.unwrap_or_else(Utc::now);
        Ok(Self {
            id: config.id,
            name: config.name,
            sandbox: config.sandbox,
            bundle_path: config.bundle_path,
            dir: config.dir,
            log_path: config.log_path,
            labels: config.labels,
            annotations: config.annotations,
            image: config.image,
            image_name: config.image_name,
            image_ref: config.image_ref,
            runtime_handler: config.runtime_handler,
            stop_signal: config.stop_signal,
            terminal: config.terminal,
            stdin: config.stdin,
            stdin_once: config.stdin_once,
            spoofed: false,
            created: AtomicBool::new(false),
            mount_point: RwLock::new(None),
            spec: RwLock::new(None),
            state: RwLock::new(ContainerState::new(created)),
            op_lock: tokio::sync::RwLock::new(()),
            stop: Arc::new(Mutex::new(StopCoordinator::default())),
        })
    }

    /// Creates a spoofed container: it exists in metadata only and is
    /// driven by the spoofed back-end.
    pub fn new_spoofed(
        id: &str,
        name: &str,
        labels: HashMap<String, String>,
        sandbox: &str,
        dir: &Path,
    ) -> Result<Self> {
        let mut container = Self::new(ContainerConfig {
            id: id.to_string(),
            name: name.to_string(),
            sandbox: sandbox.to_string(),
            bundle_path: dir.to_path_buf(),
            dir: dir.to_path_buf(),
            labels,
            ..Default::default()
        })?;
        container.spoofed = true;
        Ok(container)
    }

    // =========================================================================
    // Identity
    // =========================================================================

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn sandbox(&self) -> &str {
        &self.sandbox
    }

    /// The infra container is the one whose ID is the sandbox ID.
    pub fn is_infra(&self) -> bool {
        self.id == self.sandbox
    }

    pub fn is_spoofed(&self) -> bool {
        self.spoofed
    }

    pub fn bundle_path(&self) -> &Path {
        &self.bundle_path
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn log_path(&self) -> &Path {
        &self.log_path
    }

    pub fn labels(&self) -> &HashMap<String, String> {
        &self.labels
    }

    pub fn annotations(&self) -> &HashMap<String, String> {
        &self.annotations
    }

    pub fn image(&self) -> &str {
        &self.image
    }

    pub fn image_name(&self) -> &str {
        &self.image_name
    }

    pub fn image_ref(&self) -> &str {
        &self.image_ref
    }

    pub fn runtime_handler(&self) -> &str {
        &self.runtime_handler
    }

    pub fn terminal(&self) -> bool {
        self.terminal
    }

    pub fn stdin(&self) -> bool {
        self.stdin
    }

    pub fn stdin_once(&self) -> bool {
        self.stdin_once
    }

    /// `<namespace>/<pod>/<container>` from the kubernetes labels.
    pub fn description(&self) -> String {
        let label = |key: &str| self.labels.get(key).map(String::as_str).unwrap_or("");
        format!(
            "{}/{}/{}",
            label(KUBERNETES_POD_NAMESPACE_LABEL),
            label(KUBERNETES_POD_NAME_LABEL),
            label(KUBERNETES_CONTAINER_NAME_LABEL)
        )
    }

    /// Configured stop signal, SIGTERM when unset or unparseable.
    pub fn stop_signal(&self) -> Signal {
        if self.stop_signal.is_empty() {
            return Signal(DEFAULT_STOP_SIGNAL);
        }
        match self.stop_signal.parse::<Signal>() {
            Ok(sig) if sig.as_i32() > 0 => sig,
            _ => {
                warn!(
                    container = %self.id,
                    stop_signal = %self.stop_signal,
                    "invalid stop signal, using SIGTERM"
                );
                Signal(DEFAULT_STOP_SIGNAL)
            }
        }
    }

    /// `<dir>/state.json`.
    pub fn state_path(&self) -> PathBuf {
        self.dir.join(STATE_FILE)
    }

    /// `<bundle>/exit`, written by the monitor when the process exits.
    pub fn exit_file_path(&self) -> PathBuf {
        self.bundle_path.join(EXIT_FILE)
    }

    /// `<bundle>/oom`, present once the container was OOM-killed.
    pub fn oom_file_path(&self) -> PathBuf {
        self.bundle_path.join(OOM_FILE)
    }

    pub fn set_mount_point(&self, mount_point: PathBuf) -> Result<()> {
        *self
            .mount_point
            .write()
            .map_err(|e| Error::Internal(format!("lock poisoned: {}", e)))? = Some(mount_point);
        Ok(())
    }

    pub fn mount_point(&self) -> Option<PathBuf> {
        self.mount_point.read().ok().and_then(|m| m.clone())
    }

    /// Stores the OCI runtime spec (`config.json` contents).
    pub fn set_spec(&self, spec: serde_json::Value) -> Result<()> {
        *self
            .spec
            .write()
            .map_err(|e| Error::Internal(format!("lock poisoned: {}", e)))? = Some(spec);
        Ok(())
    }

    pub fn spec(&self) -> Option<serde_json::Value> {
        self.spec.read().ok().and_then(|s| s.clone())
    }

    pub fn set_created(&self) {
        self.created.store(true, Ordering::SeqCst);
    }

    /// True once the create operation completed.
    pub fn is_created(&self) -> bool {
        self.created.load(Ordering::SeqCst)
    }

    // =========================================================================
    // State Access
    // =========================================================================

    /// Serializes runtime operations on this container.
    pub async fn op_lock(&self) -> tokio::sync::RwLockWriteGuard<'_, ()> {
        self.op_lock.write().await
    }

    pub(crate) fn read_state(&self) -> Result<RwLockReadGuard<'_, ContainerState>> {
        self.state
            .read()
            .map_err(|e| Error::Internal(format!("lock poisoned: {}", e)))
    }

    pub(crate) fn write_state(&self) -> Result<RwLockWriteGuard<'_, ContainerState>> {
        self.state
            .write()
            .map_err(|e| Error::Internal(format!("lock poisoned: {}", e)))
    }

    /// Snapshot of the current state.
    pub fn state(&self) -> Result<ContainerState> {
        Ok(self.read_state()?.clone())
    }

    /// Current status.
    pub fn status(&self) -> Result<ContainerStatus> {
        Ok(self.read_state()?.status)
    }

    /// Applies `f` to the state under the write lock.
    pub fn update_state<R>(&self, f: impl FnOnce(&mut ContainerState) -> R) -> Result<R> {
        let mut state = self.write_state()?;
        Ok(f(&mut state))
    }

    /// Creation time.
    pub fn created_at(&self) -> Result<DateTime<Utc>> {
        Ok(self.read_state()?.created)
    }

    /// Records the init PID as the container's PID.
    pub fn set_init_pid(&self, pid: i32) -> Result<()> {
        let mut state = self.write_state()?;
        state.set_init_pid(pid)?;
        state.pid = pid;
        Ok(())
    }

    /// Records a start failure: `started` and `finished` collapse onto
    /// `created`.
    pub fn set_start_failed(&self, err: Option<&Error>) -> Result<()> {
        let mut state = self.write_state()?;
        state.started = Some(state.created);
        state.finished = Some(state.created);
        if let Some(err) = err {
            state.error = err.to_string();
        }
        Ok(())
    }

    /// Marks the container stopped now, keeping any known exit data.
    pub fn set_stopped_now(&self) -> Result<()> {
        let mut state = self.write_state()?;
        state.transition(ContainerStatus::Stopped);
        if state.finished.is_none() {
            state.finished = Some(Utc::now());
        }
        Ok(())
    }

    /// Persists the state to `state.json` atomically.
    pub fn to_disk(&self) -> Result<()> {
        let data = serde_json::to_vec(&*self.read_state()?)?;
        let path = self.state_path();
        let tmp = path.with_extension("json.tmp");
        std::fs::create_dir_all(&self.dir)?;
        std::fs::write(&tmp, data)?;
        std::fs::rename(&tmp, &path)?;
        Ok(())
    }

    /// Replaces the in-memory state with `state.json`.
    ///
    /// Callers should refresh status from the runtime first: an upgraded
    /// state assumes the recorded PID is still the container.
    pub fn from_disk(&self) -> Result<()> {
        let loaded = ContainerState::from_disk(&self.state_path())?;
        *self.write_state()? = loaded;
        Ok(())
    }

    // =========================================================================
    // Liveness
    // =========================================================================

    /// Returns the init PID if it still belongs to this container.
    ///
    /// - `NotInitialized` if no init PID was recorded.
    /// - `ProcessNotFound` if the runtime reports no PID, the process is
    ///   gone or defunct, or its stat file is unreadable.
    /// - `PidWrap` if the PID now belongs to a different process.
    pub fn pid(&self) -> Result<i32> {
        let (init_pid, pid, init_start_time) = {
            let state = self.read_state()?;
            (state.init_pid, state.pid, state.init_start_time.clone())
        };
        if init_pid <= 0 {
            return Err(Error::NotInitialized(self.id.clone()));
        }
        if pid == 0 {
            return Err(Error::ProcessNotFound);
        }
        process::kill(init_pid, 0)?;

        let stat = process::proc_stat(init_pid)?;
        if stat.start_time != init_start_time {
            warn!(
                container = %self.id,
                pid = init_pid,
                expected = %init_start_time,
                found = %stat.start_time,
                "PID wrap detected"
            );
            return Err(Error::PidWrap {
                pid: init_pid,
                expected: init_start_time,
                found: stat.start_time,
            });
        }
        if stat.is_defunct() {
            return Err(Error::ProcessNotFound);
        }
        Ok(init_pid)
    }

    /// Returns `Ok(())` if the container's init process is alive.
    pub fn living(&self) -> Result<()> {
        self.pid().map(|_| ())
    }

    pub fn is_alive(&self) -> bool {
        self.pid().is_ok()
    }

    /// Checks whether stopping makes sense.
    ///
    /// `AlreadyStopped` for a stopped container, `InvalidState` for a paused
    /// one.
    pub fn should_be_stopped(&self) -> Result<()> {
        match self.status()? {
            ContainerStatus::Stopped => Err(Error::AlreadyStopped(self.id.clone())),
            ContainerStatus::Paused => Err(Error::InvalidState {
                id: self.id.clone(),
                state: ContainerStatus::Paused.to_string(),
                operation: "stop".to_string(),
            }),
            _ => Ok(()),
        }
    }

    // =========================================================================
    // Stop Coordination
    // =========================================================================

    fn coordinator(&self) -> Result<std::sync::MutexGuard<'_, StopCoordinator>> {
        self.stop
            .lock()
            .map_err(|e| Error::Internal(format!("lock poisoned: {}", e)))
    }

    /// Claims the in-flight stop. Returns `None` if a stop is already running.
    pub fn set_as_stopping(&self) -> Result<Option<StopGuard>> {
        let mut coordinator = self.coordinator()?;
        if coordinator.stopping {
            return Ok(None);
        }
        let (timeout_tx, timeout_rx) = mpsc::unbounded_channel();
        let (done_tx, done_rx) = watch::channel(false);
        coordinator.stopping = true;
        coordinator.timeouts = Some(timeout_tx);
        coordinator.done = Some(done_rx);
        Ok(Some(StopGuard {
            coordinator: Arc::clone(&self.stop),
            timeouts: timeout_rx,
            done: done_tx,
        }))
    }

    /// True while a stop is in flight.
    pub fn is_stopping(&self) -> bool {
        self.coordinator().map(|c| c.stopping).unwrap_or(false)
    }

    /// Forwards `timeout` to the in-flight stop and waits for it to finish.
    ///
    /// Returns immediately if no stop is in flight, and early on `cancel`.
    pub async fn wait_on_stop_timeout(&self, timeout: Duration, cancel: &CancellationToken) {
        let done = {
            let Ok(coordinator) = self.coordinator() else {
                return;
            };
            if !coordinator.stopping {
                return;
            }
            if let Some(tx) = &coordinator.timeouts {
                let _ = tx.send(timeout);
            }
            coordinator.done.clone()
        };
        let Some(mut done) = done else {
            return;
        };
        tokio::select! {
            _ = cancel.cancelled() => {}
            _ = done.wait_for(|finished| *finished) => {}
        }
    }

    // =========================================================================
    // Exec Session Tracking
    // =========================================================================

    /// Tracks an exec session PID so a stop can interrupt it.
    ///
    /// `should_kill` selects SIGKILL over SIGINT. Refused while stopping.
    pub fn add_exec_pid(&self, pid: i32, should_kill: bool) -> Result<()> {
        let mut coordinator = self.coordinator()?;
        debug!(container = %self.id, pid, should_kill, "tracking exec PID");
        if coordinator.stopping {
            return Err(Error::InvalidState {
                id: self.id.clone(),
                state: "stopping".to_string(),
                operation: "register an exec PID".to_string(),
            });
        }
        coordinator.exec_pids.insert(pid, should_kill);
        Ok(())
    }

    pub fn delete_exec_pid(&self, pid: i32) {
        if let Ok(mut coordinator) = self.coordinator() {
            coordinator.exec_pids.remove(&pid);
        }
    }

    /// Number of tracked exec sessions.
    pub fn exec_pid_count(&self) -> usize {
        self.coordinator().map(|c| c.exec_pids.len()).unwrap_or(0)
    }

    /// Signals every tracked exec session until each is gone.
    pub async fn kill_exec_pids(&self) {
        let mut pending: HashMap<i32, bool> = match self.coordinator() {
            Ok(c) => c.exec_pids.clone(),
            Err(_) => return,
        };
        for _ in 0..MAX_EXEC_KILL_PASSES {
            if pending.is_empty() {
                return;
            }
            pending.retain(|&pid, &mut should_kill| {
                let sig = if should_kill { Signal::KILL } else { Signal::INT };
                debug!(container = %self.id, pid, signal = %sig, "stopping exec PID");
                !matches!(process::kill(pid, sig.as_i32()), Ok(()) | Err(Error::ProcessNotFound))
            });
            tokio::time::sleep(STOP_POLL_INTERVAL).await;
        }
        if !pending.is_empty() {
            warn!(container = %self.id, remaining = pending.len(), "failed to stop exec PIDs");
        }
    }
}
