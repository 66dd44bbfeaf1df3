//! Task API spoken by VM shims.
//!
//! ```text
//! ┌──────────────────┐   ttrpc over unix socket   ┌──────────────────┐
//! │ dyn TaskService  │ ─────────────────────────► │ containerd shim  │
//! │ (TtrpcTaskClient)│   containerd.task.v2.Task  │ (kata, ...)      │
//! └──────────────────┘                            └──────────────────┘
//! ```
//!
//! [`TaskService`] is the seam the VM back-end programs against;
//! [`TtrpcDialer`] produces the production implementation. The error and
//! IO types below are shared with the pod monitor client.

pub mod client;
pub mod task;

pub use client::{TtrpcDialer, TtrpcTaskClient};
pub use task::{CreateTask, TaskDialer, TaskService};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Scheme prefix task servers print in front of their socket path.
pub const UNIX_SCHEME: &str = "unix://";

/// Task server error.
#[derive(Debug, thiserror::Error)]
pub enum ShimError {
    /// Connection failed.
    #[error("failed to connect to {address}: {reason}")]
    ConnectionFailed { address: String, reason: String },

    /// Request timeout.
    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The server answered with an error.
    #[error("remote error ({code:?}): {message}")]
    Remote { code: ErrorCode, message: String },

    /// The server answered with the wrong payload.
    #[error("unexpected response: expected {expected}, got {got}")]
    UnexpectedResponse { expected: String, got: String },

    /// The connection dropped before a response arrived.
    #[error("connection closed before response")]
    ConnectionClosed,

    /// Response exceeded the size limit.
    #[error("response exceeds {0} bytes")]
    ResponseTooLarge(usize),

    /// A payload could not be decoded.
    #[error("failed to decode {what}: {reason}")]
    Decode { what: String, reason: String },

    #[error("invalid input: {0}")]
    InvalidInput(String),
}

impl ShimError {
    /// True when the server reports the task or process does not exist.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Self::Remote {
                code: ErrorCode::NotFound,
                ..
            }
        )
    }

    /// True when the server could not be reached at all.
    pub fn is_unreachable(&self) -> bool {
        matches!(
            self,
            Self::ConnectionFailed { .. } | Self::ConnectionClosed
        )
    }
}

/// Result type for task API calls.
pub type ShimResult<T> = std::result::Result<T, ShimError>;

/// Error codes carried by remote errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    NotFound,
    AlreadyExists,
    InvalidArgument,
    FailedPrecondition,
    DeadlineExceeded,
    Unimplemented,
    Internal,
}

/// Exit status of a task or exec process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitStatus {
    pub code: i32,
    pub exited_at: Option<DateTime<Utc>>,
}

/// IO endpoints for a task or exec process. Empty paths are not connected.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessIo {
    #[serde(default)]
    pub stdin: PathBuf,
    #[serde(default)]
    pub stdout: PathBuf,
    #[serde(default)]
    pub stderr: PathBuf,
    #[serde(default)]
    pub terminal: bool,
}

/// Task status as reported by the shim.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum TaskStatus {
    #[default]
    Unknown,
    Created,
    Running,
    Stopped,
    Paused,
    Pausing,
}

/// Task state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskState {
    pub id: String,
    pub pid: i32,
    pub status: TaskStatus,
    pub exit_status: i32,
    pub exited_at: Option<DateTime<Utc>>,
    pub io: ProcessIo,
}
