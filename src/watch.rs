//! Polling file watches.
//!
//! Two waits in the supervision layer hinge on files written by other
//! processes: the PID file the OCI runtime writes during `exec`, and the
//! log file the monitor reopens on request. Both are observed by polling
//! metadata at [`WATCH_POLL_INTERVAL`].

use crate::constants::WATCH_POLL_INTERVAL;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};

/// Identity and size of a file at one point in time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Fingerprint {
    ino: u64,
    len: u64,
    mtime_nsec: i64,
    mtime: i64,
}

impl Fingerprint {
    async fn of(path: &Path) -> Option<Self> {
        let meta = tokio::fs::metadata(path).await.ok()?;
        Some(Self {
            ino: meta.ino(),
            len: meta.len(),
            mtime: meta.mtime(),
            mtime_nsec: meta.mtime_nsec(),
        })
    }
}

/// Watches one path for creation or modification.
#[derive(Debug)]
pub struct FileWatcher {
    path: PathBuf,
    baseline: Option<Fingerprint>,
}

impl FileWatcher {
    /// Starts watching; changes are judged against the file as it is now.
    pub async fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let baseline = Fingerprint::of(&path).await;
        Self { path, baseline }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Resolves once the file is created, replaced or written.
    ///
    /// A file removed and not recreated does not count as a change.
    pub async fn changed(&mut self) {
        loop {
            let current = Fingerprint::of(&self.path).await;
            if current.is_some() && current != self.baseline {
                self.baseline = current;
                return;
            }
            tokio::time::sleep(WATCH_POLL_INTERVAL).await;
        }
    }
}

/// Resolves once `path` exists.
pub async fn wait_for_file(path: &Path) {
    while tokio::fs::metadata(path).await.is_err() {
        tokio::time::sleep(WATCH_POLL_INTERVAL).await;
    }
}
