//! Pod monitor RPC: line-delimited JSON over a unix socket.
//!
//! ```text
//! ┌───────────────┐   unix socket, JSON lines   ┌─────────────┐
//! │ MonitorClient │ ──────────────────────────► │ pod monitor │
//! └───────────────┘                             └─────────────┘
//! ```

pub mod client;
pub mod protocol;

pub use client::MonitorClient;
pub use protocol::CreateTaskRequest;
