//! Pod monitor wire protocol.
//!
//! - **Transport**: unix stream socket, one connection per request
//! - **Encoding**: JSON
//! - **Framing**: newline-delimited (each message ends with `\n`)
//!
//! ```text
//! Daemon                           Pod monitor
//!   |  {"action":"create","id":..}\n  |
//!   |-------------------------------->|
//!   |  {"status":"ok","data":{..}}\n  |
//!   |<--------------------------------|
//! ```
//!
//! | Action | Reply data |
//! |--------|------------|
//! | `connect` | `connected` |
//! | `create` | `created` |
//! | `exec_sync` | `exec_sync` |
//! | `resize_pty`, `reopen_log`, `shutdown` | none |

use crate::shim::{ErrorCode, ProcessIo};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

// =============================================================================
// Request Types
// =============================================================================

/// Request from the daemon.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Request {
    /// Handshake: returns the monitor's PID and version.
    Connect,
    /// Create a container from a bundle.
    Create(CreateTaskRequest),
    /// Run a command to completion and return its output.
    ExecSync(ExecSyncRequest),
    /// Resize a container's terminal.
    ResizePty(ResizePtyRequest),
    /// Reopen the container log file.
    ReopenLog(TaskRef),
    /// Ask the monitor to exit once it serves no more containers.
    Shutdown(TaskRef),
}

/// Names a container.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskRef {
    pub id: String,
}

impl TaskRef {
    pub fn task(id: &str) -> Self {
        Self { id: id.to_string() }
    }
}

/// Creates a container.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateTaskRequest {
    pub id: String,
    pub bundle: PathBuf,
    #[serde(flatten)]
    pub io: ProcessIo,
    /// Exit files to write when the container exits.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub exit_paths: Vec<PathBuf>,
    /// Files to create if the container is OOM-killed.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub oom_exit_paths: Vec<PathBuf>,
    /// Container log file.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_path: Option<PathBuf>,
}

/// Runs a command to completion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecSyncRequest {
    pub id: String,
    pub command: Vec<String>,
    /// Zero waits indefinitely.
    pub timeout_secs: u64,
    #[serde(default)]
    pub terminal: bool,
}

/// Resizes a terminal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResizePtyRequest {
    #[serde(flatten)]
    pub task: TaskRef,
    pub width: u16,
    pub height: u16,
}

// =============================================================================
// Response Types
// =============================================================================

/// Reply to a request.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Response {
    Ok(OkPayload),
    Error(ErrorPayload),
}

impl Response {
    #[must_use]
    pub fn ok() -> Self {
        Self::Ok(OkPayload { data: None })
    }

    #[must_use]
    pub fn ok_with_data(data: ResponseData) -> Self {
        Self::Ok(OkPayload { data: Some(data) })
    }

    #[must_use]
    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        Self::Error(ErrorPayload {
            code,
            message: message.into(),
        })
    }
}

/// Success payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OkPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<ResponseData>,
}

/// Reply data variants.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ResponseData {
    Connected {
        pid: i32,
        version: String,
    },
    Created {
        pid: i32,
    },
    ExecSync {
        exit_code: i32,
        #[serde(default)]
        stdout: Vec<u8>,
        #[serde(default)]
        stderr: Vec<u8>,
        #[serde(default)]
        timed_out: bool,
    },
}

impl ResponseData {
    /// Variant name, for error messages.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Connected { .. } => "connected",
            Self::Created { .. } => "created",
            Self::ExecSync { .. } => "exec_sync",
        }
    }
}

/// Error payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub code: ErrorCode,
    pub message: String,
}

// =============================================================================
// Wire Format Helpers
// =============================================================================

impl Request {
    /// Serializes to a JSON line.
    pub fn to_json_line(&self) -> Result<String, serde_json::Error> {
        let mut json = serde_json::to_string(self)?;
        json.push('\n');
        Ok(json)
    }

    pub fn from_json(s: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(s.trim())
    }
}

impl Response {
    /// Serializes to a JSON line.
    pub fn to_json_line(&self) -> Result<String, serde_json::Error> {
        let mut json = serde_json::to_string(self)?;
        json.push('\n');
        Ok(json)
    }

    pub fn from_json(s: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(s.trim())
    }
}
