//! Error types for the container supervision layer.
//!
//! Callers above this layer distinguish three outcomes: a normal state
//! transition, an idempotent condition ("already stopped", "process not
//! found") that they may treat as success, and a hard failure. The helpers
//! [`Error::is_already_stopped`] and [`Error::is_process_gone`] make the
//! idempotent cases easy to match.

use crate::shim::ShimError;
use std::time::Duration;

/// Result type alias for supervision operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the supervision layer.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    // =========================================================================
    // Configuration Errors
    // =========================================================================
    /// Runtime handler name does not resolve to a configured handler.
    #[error("runtime handler not found: {0}")]
    RuntimeHandlerNotFound(String),

    /// Configuration is invalid.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    // =========================================================================
    // Liveness Errors
    // =========================================================================
    /// The container's init PID has not been recorded yet.
    #[error("container {0} PID not initialized")]
    NotInitialized(String),

    /// The container process is gone.
    #[error("container process not found")]
    ProcessNotFound,

    /// The PID was reused by an unrelated process.
    #[error(
        "PID {pid} is running but has start time of {found}, whereas the saved start time is {expected}. PID wrap may have occurred"
    )]
    PidWrap {
        pid: i32,
        expected: String,
        found: String,
    },

    // =========================================================================
    // Container Lifecycle Errors
    // =========================================================================
    /// Container not found in the store or runtime cache.
    #[error("container not found: {0}")]
    ContainerNotFound(String),

    /// Container already exists in the store.
    #[error("container already exists: {0}")]
    ContainerAlreadyExists(String),

    /// Container is already stopped. Callers treat this as success.
    #[error("container {0} is already stopped")]
    AlreadyStopped(String),

    /// Container is in wrong state for operation.
    #[error("container '{id}' is in state '{state}', cannot {operation}")]
    InvalidState {
        id: String,
        state: String,
        operation: String,
    },

    /// `set_init_pid` was called a second time.
    #[error("pid and start time already initialized: {pid} {start_time}")]
    InitPidAlreadySet { pid: i32, start_time: String },

    /// Container create failed.
    #[error("failed to create container '{id}': {reason}")]
    CreateFailed { id: String, reason: String },

    /// Container start failed.
    #[error("failed to start container '{id}': {reason}")]
    StartFailed { id: String, reason: String },

    /// Container stop failed.
    #[error("failed to stop container '{id}': {reason}")]
    StopFailed { id: String, reason: String },

    /// Signal delivery failed.
    #[error("failed to send signal to container '{id}': {reason}")]
    SignalFailed { id: String, reason: String },

    /// Container delete failed.
    #[error("failed to delete container '{id}': {reason}")]
    DeleteFailed { id: String, reason: String },

    /// Exec failed.
    #[error("exec failed in container '{container}': {reason}")]
    ExecFailed { container: String, reason: String },

    // =========================================================================
    // Runtime Errors
    // =========================================================================
    /// The OCI runtime binary exited unsuccessfully.
    #[error("{command} failed (exit code {code:?}): {stderr}")]
    RuntimeCommand {
        command: String,
        code: Option<i32>,
        stderr: String,
    },

    /// Shim or pod monitor RPC failed.
    #[error("shim error: {0}")]
    Shim(#[from] ShimError),

    /// Operation not supported by this runtime.
    #[error("operation not supported: {0}")]
    NotSupported(String),

    // =========================================================================
    // Generic Errors
    // =========================================================================
    /// Operation timed out.
    #[error("operation '{operation}' timed out after {duration:?}")]
    Timeout {
        operation: String,
        duration: Duration,
    },

    /// The caller cancelled the operation.
    #[error("operation cancelled: {0}")]
    Cancelled(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON encoding error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Internal error.
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Returns true for the "already stopped" condition.
    pub fn is_already_stopped(&self) -> bool {
        matches!(self, Self::AlreadyStopped(_))
    }

    /// Returns true when the container process should be treated as exited.
    ///
    /// PID wrap is included: a reused PID is never the container.
    pub fn is_process_gone(&self) -> bool {
        match self {
            Self::ProcessNotFound | Self::PidWrap { .. } => true,
            Self::Shim(e) => e.is_not_found(),
            _ => false,
        }
    }

    /// Returns true when the error is a timeout.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}
