//! Cgroup manager interface.
//!
//! Cgroup path computation belongs to the embedder. The supervision layer
//! only asks for the monitor's cgroup path and moves the monitor into it
//! before releasing the start pipe.

use crate::config::CgroupManagerKind;
use crate::error::{Error, Result};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Places processes into cgroups.
pub trait CgroupManager: Send + Sync + std::fmt::Debug {
    /// True for the systemd driver.
    fn is_systemd(&self) -> bool;

    /// Cgroup directory for a container's monitor, or `None` to skip the move.
    fn monitor_cgroup_path(&self, container_id: &str, cgroup_parent: &str) -> Option<PathBuf>;

    /// Moves `pid` into the cgroup at `path`.
    fn move_pid_to_cgroup(&self, path: &Path, pid: i32) -> Result<()>;
}

/// Manages cgroups directly on the cgroup filesystem.
#[derive(Debug, Clone)]
pub struct CgroupfsManager {
    root: PathBuf,
}

impl CgroupfsManager {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl CgroupManager for CgroupfsManager {
    fn is_systemd(&self) -> bool {
        false
    }

    /// `<root>/<parent>/crio-conmon-<id>`; no move without a parent.
    fn monitor_cgroup_path(&self, container_id: &str, cgroup_parent: &str) -> Option<PathBuf> {
        if cgroup_parent.is_empty() {
            return None;
        }
        Some(
            self.root
                .join(cgroup_parent.trim_start_matches('/'))
                .join(format!("crio-conmon-{}", container_id)),
        )
    }

    fn move_pid_to_cgroup(&self, path: &Path, pid: i32) -> Result<()> {
        std::fs::create_dir_all(path)?;
        std::fs::write(path.join("cgroup.procs"), pid.to_string()).map_err(|e| {
            Error::Internal(format!(
                "failed to move pid {} into cgroup {}: {}",
                pid,
                path.display(),
                e
            ))
        })?;
        debug!(pid, cgroup = %path.display(), "moved process into cgroup");
        Ok(())
    }
}

/// Leaves processes where they are. Used with the systemd driver, whose
/// scope creation the embedder owns, and in tests.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopCgroupManager {
    kind: CgroupManagerKind,
}

impl NoopCgroupManager {
    pub fn new(kind: CgroupManagerKind) -> Self {
        Self { kind }
    }
}

impl CgroupManager for NoopCgroupManager {
    fn is_systemd(&self) -> bool {
        self.kind == CgroupManagerKind::Systemd
    }

    fn monitor_cgroup_path(&self, _container_id: &str, _cgroup_parent: &str) -> Option<PathBuf> {
        None
    }

    fn move_pid_to_cgroup(&self, _path: &Path, _pid: i32) -> Result<()> {
        Ok(())
    }
}
