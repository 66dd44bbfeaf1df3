//! # Supervision Constants
//!
//! Timeouts, poll intervals, on-disk file names and size bounds used by the
//! container supervision layer. These constants are the **single source of
//! truth** for every bounded wait in the crate.
//!
//! ## Cross-References
//!
//! - [`crate::container`]: stop coordination and liveness polling
//! - [`crate::runtimes`]: create/stop/exec timeouts and file layout
//! - [`crate::facade`]: the stopped-state wait loop

use std::time::Duration;

// =============================================================================
// Timeouts
// =============================================================================
//
// Every suspension point in the supervision layer is bounded. The only
// unbounded waits are IO copies for attach/exec, which end on EOF or when
// the caller cancels.
// =============================================================================

/// Maximum time to wait for the monitor to report the container PID (240s).
///
/// **Rationale**: Image mounts, SELinux relabeling and hook execution all
/// run before the monitor writes to the sync pipe. Four minutes covers slow
/// storage while still failing a wedged create.
///
/// **Recovery**: On expiry the create is fatal and the caller rolls back with
/// a delete.
pub const CONTAINER_CREATE_TIMEOUT: Duration = Duration::from_secs(240);

/// Grace period after SIGKILL before a stop is declared failed (2 min).
///
/// **Rationale**: SIGKILL cannot be caught, but a process stuck in
/// uninterruptible sleep (D state) only dies once its IO completes.
pub const KILL_CONTAINER_TIMEOUT: Duration = Duration::from_secs(120);

/// Interval between liveness checks while waiting for a stop (100ms).
pub const STOP_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Interval between status refreshes in the stopped-state wait loop (100ms).
pub const WAIT_STOPPED_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Default bound for the stopped-state wait loop (10s).
pub const DEFAULT_WAIT_STOPPED_TIMEOUT: Duration = Duration::from_secs(10);

/// Maximum time to wait for the monitor to reopen the log file (3 min).
///
/// **Recovery**: Expiry is logged and ignored.
pub const REOPEN_LOG_TIMEOUT: Duration = Duration::from_secs(180);

/// Grace window for the second direction of a port forward (1s).
pub const PORT_FORWARD_GRACE: Duration = Duration::from_secs(1);

/// Timeout for a single shim or pod-monitor RPC (30s).
pub const RPC_TIMEOUT: Duration = Duration::from_secs(30);

/// Maximum time to wait for the shim to print its address (30s).
pub const SHIM_START_TIMEOUT: Duration = Duration::from_secs(30);

/// How long exec output keeps draining after the process exited (200ms).
pub const EXEC_IO_DRAIN: Duration = Duration::from_millis(200);

/// Interval between file-watch polls (50ms).
pub const WATCH_POLL_INTERVAL: Duration = Duration::from_millis(50);

// =============================================================================
// Exit File Backoff
// =============================================================================
//
// The runtime may report a container as stopped before the monitor has
// written the exit file. Status refresh retries reading it with a bounded
// exponential backoff: 500ms, 600ms, 720ms, ... for six steps (~5s total).
// =============================================================================

/// Initial delay before re-reading a missing exit file.
pub const EXIT_FILE_BACKOFF_INITIAL: Duration = Duration::from_millis(500);

/// Multiplier applied to the delay after every attempt.
pub const EXIT_FILE_BACKOFF_FACTOR: f64 = 1.2;

/// Number of attempts before giving up on the exit file.
pub const EXIT_FILE_BACKOFF_STEPS: u32 = 6;

// =============================================================================
// Size Limits
// =============================================================================

/// Maximum size of the JSON message read from the sync pipe (64 KiB).
///
/// **Security**: The monitor is trusted, but a corrupted pipe must not be
/// able to make the daemon buffer unbounded data.
pub const MAX_SYNC_MESSAGE_SIZE: usize = 64 * 1024;

/// Maximum captured stdout or stderr for a synchronous exec (16 MiB).
///
/// **Security**: Health checks run arbitrary user commands. Output beyond
/// this bound is dropped rather than buffered.
pub const MAX_EXEC_SYNC_OUTPUT: usize = 16 * 1024 * 1024;

/// Maximum length of a single RPC response line (4 MiB).
pub const MAX_RPC_LINE_LEN: usize = 4 * 1024 * 1024;

/// Buffer size for attach and port-forward copies (32 KiB).
pub const COPY_BUFFER_SIZE: usize = 32 * 1024;

// =============================================================================
// Signals and Messages
// =============================================================================

/// Signal sent on stop when the container does not configure one (SIGTERM).
pub const DEFAULT_STOP_SIGNAL: i32 = 15;

/// Exit code reported for an exec that hit its timeout.
pub const EXEC_TIMEOUT_EXIT_CODE: i32 = -1;

/// Stderr reported for an exec that hit its timeout.
pub const EXEC_TIMED_OUT_MESSAGE: &str = "command timed out";

/// Detach sequence for attach sessions (ctrl-p, ctrl-q).
pub const DEFAULT_DETACH_KEYS: &[u8] = &[16, 17];

// =============================================================================
// On-Disk Layout
// =============================================================================

/// Persisted container state, under the container's metadata dir.
pub const STATE_FILE: &str = "state.json";

/// Exit-code file written next to the persisted state.
pub const EXIT_FILE: &str = "exit";

/// OOM sentinel, under the bundle dir.
pub const OOM_FILE: &str = "oom";

/// Control socket (FIFO) for resize and reopen-log messages, under the bundle.
pub const CTL_FILE: &str = "ctl";

/// Attach socket name under `<attachSocketDir>/<id>/`.
pub const ATTACH_FILE: &str = "attach";

/// Persisted shim address, under the bundle dir.
pub const ADDRESS_FILE: &str = "address";

/// FIFO the shim writes its own log to, under the bundle dir.
pub const SHIM_LOG_FIFO: &str = "log";

/// containerd namespace shims are started in.
pub const SHIM_NAMESPACE: &str = "default";

/// Container PID file written by the OCI runtime, under the bundle dir.
pub const PID_FILE: &str = "pidfile";

/// Monitor PID file, under the bundle dir.
pub const MONITOR_PID_FILE: &str = "conmon-pidfile";

/// OCI runtime config, under the bundle dir.
pub const CONFIG_FILE: &str = "config.json";

/// Environment variable carrying the sync pipe fd number.
pub const SYNC_PIPE_ENV: &str = "_OCI_SYNCPIPE";

/// Environment variable carrying the start pipe fd number.
pub const START_PIPE_ENV: &str = "_OCI_STARTPIPE";

/// Fd number of the sync pipe in the monitor.
pub const SYNC_PIPE_FD: i32 = 3;

/// Fd number of the start pipe in the monitor.
pub const START_PIPE_FD: i32 = 4;

// =============================================================================
// Kubernetes Labels
// =============================================================================

/// Label carrying the pod namespace.
pub const KUBERNETES_POD_NAMESPACE_LABEL: &str = "io.kubernetes.pod.namespace";

/// Label carrying the pod name.
pub const KUBERNETES_POD_NAME_LABEL: &str = "io.kubernetes.pod.name";

/// Label carrying the container name.
pub const KUBERNETES_CONTAINER_NAME_LABEL: &str = "io.kubernetes.container.name";

// =============================================================================
// Validation
// =============================================================================

/// Valid characters for container IDs.
///
/// Includes: `a-z`, `A-Z`, `0-9`, `-`, `_`, `.`
///
/// **Security**: Excludes `/` so IDs can be joined onto the exits dir and the
/// attach socket dir without escaping them.
pub const CONTAINER_ID_VALID_CHARS: &str =
    "abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789-_.";

/// Maximum container ID length.
///
/// **Rationale**: 128 characters accommodates 64-hex IDs with room to spare.
pub const MAX_CONTAINER_ID_LEN: usize = 128;

/// Validates a container ID for safety.
///
/// IDs are joined onto filesystem paths, so they must be non-empty, bounded,
/// restricted to [`CONTAINER_ID_VALID_CHARS`], and must not be `.` or `..`.
#[inline]
#[must_use = "validation result must be checked to ensure container ID is safe"]
pub fn validate_container_id(id: &str) -> std::result::Result<(), &'static str> {
    if id.is_empty() {
        return Err("container ID cannot be empty");
    }
    if id.len() > MAX_CONTAINER_ID_LEN {
        return Err("container ID exceeds maximum length");
    }
    if id == "." || id == ".." {
        return Err("container ID cannot be a relative path component");
    }
    if !id.chars().all(|c| CONTAINER_ID_VALID_CHARS.contains(c)) {
        return Err("container ID contains invalid characters");
    }
    Ok(())
}
