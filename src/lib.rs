//! # magikoci
//!
//! **Container Lifecycle Supervision Layer**
//!
//! This crate sits between a CRI-style daemon and the processes that
//! actually run containers. It tracks each container's state, supervises
//! its init process and exec sessions, and drives one of several
//! interchangeable back-ends. Image handling, mount computation and the
//! gRPC surface belong to the embedding daemon.
//!
//! # Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────┐
//! │                            magikoci                                 │
//! ├─────────────────────────────────────────────────────────────────────┤
//! │  ┌──────────────────┐        ┌──────────────────────────────────┐   │
//! │  │  ContainerStore  │        │        Runtime (facade)          │   │
//! │  │  id → Container  │        │  handler → RuntimeImpl, cached   │   │
//! │  └──────────────────┘        │  per container (per sandbox for  │   │
//! │                              │  shared back-ends)               │   │
//! │  ┌──────────────────┐        └────────────────┬─────────────────┘   │
//! │  │    Container     │                         │                     │
//! │  │  state machine   │                         │                     │
//! │  │  PID-wrap guard  │                         │                     │
//! │  │  stop coordinator│                         │                     │
//! │  └──────────────────┘                         │                     │
//! ├───────────────────────────────────────────────┼─────────────────────┤
//! │                      Runtime Back-ends        ▼                     │
//! │  ┌──────────────┐  ┌──────────────┐  ┌──────────────┐  ┌─────────┐  │
//! │  │  OciRuntime  │  │  VmRuntime   │  │  PodRuntime  │  │ Spoofed │  │
//! │  │ monitor per  │  │ task-API shim│  │ pod monitor  │  │ sleep   │  │
//! │  │ container    │  │ per sandbox  │  │ per sandbox  │  │ stand-in│  │
//! │  └──────────────┘  └──────────────┘  └──────────────┘  └─────────┘  │
//! └─────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Container Lifecycle
//!
//! ```text
//!   ┌─────────┐   start   ┌─────────┐   pause   ┌─────────┐
//!   │ Created │ ────────► │ Running │ ────────► │ Paused  │
//!   └────┬────┘           └────┬────┘ ◄──────── └─────────┘
//!        │                     │       unpause
//!        │      exit / stop    │
//!        └──────────┬──────────┘
//!                   ▼
//!              ┌─────────┐
//!              │ Stopped │  (terminal)
//!              └─────────┘
//! ```
//!
//! # Liveness
//!
//! A recorded PID is only trusted while the process holding it has the
//! start time captured at creation. A different start time means the PID
//! was reused ([`Error::PidWrap`]) and the container is treated as gone.
//!
//! # Example
//!
//! ```rust,ignore
//! use magikoci::{Config, Container, ContainerConfig, Metrics, Runtime};
//! use magikoci::cgroup::CgroupfsManager;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> magikoci::Result<()> {
//!     let config = Arc::new(Config::from_yaml_file("/etc/magikoci.yaml".as_ref())?);
//!     let cgroups = Arc::new(CgroupfsManager::new(&config.cgroup_root));
//!     let runtime = Runtime::new(config, Arc::new(Metrics::new()), cgroups);
//!
//!     let ctr = Arc::new(Container::new(ContainerConfig {
//!         id: "abc".into(),
//!         sandbox: "abc".into(),
//!         bundle_path: "/run/containers/abc".into(),
//!         ..Default::default()
//!     })?);
//!     runtime.create_container(&ctr, "/kubepods").await?;
//!     runtime.start_container(&ctr).await?;
//!     Ok(())
//! }
//! ```

pub mod cgroup;
pub mod config;
pub mod constants;
pub mod container;
pub mod error;
pub mod facade;
pub mod metrics;
pub mod monitor;
pub mod process;
pub mod runtime;
pub mod runtimes;
pub mod shim;
pub mod signal;
pub mod stats;
pub mod store;
pub mod streams;
pub mod watch;

// Re-exports
pub use config::{CgroupManagerKind, Config, RuntimeHandler, RuntimeType};
pub use container::{Container, ContainerConfig, ContainerState, ContainerStatus, StopGuard};
pub use error::{Error, Result};
pub use facade::Runtime;
pub use metrics::Metrics;
pub use runtime::{ExecSyncResponse, LinuxResources, RuntimeImpl};
pub use runtimes::{OciRuntime, PodRuntime, SpoofedRuntime, VmRuntime};
pub use signal::Signal;
pub use stats::ContainerStats;
pub use store::ContainerStore;
pub use streams::{StreamOptions, TerminalSize};
