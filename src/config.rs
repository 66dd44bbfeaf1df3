//! Supervision configuration.
//!
//! The configuration names the available runtime handlers and the paths the
//! back-ends share (monitor binary, exits dir, attach socket dir). It is
//! deserialized from YAML:
//!
//! ```yaml
//! default_runtime: runc
//! monitor_path: /usr/bin/conmon
//! container_exits_dir: /var/run/crio/exits
//! container_attach_socket_dir: /var/run/crio
//! cgroup_manager: systemd
//! runtimes:
//!   runc:
//!     runtime_path: /usr/bin/runc
//!     runtime_root: /run/runc
//!   kata:
//!     runtime_path: /usr/bin/containerd-shim-kata-v2
//!     runtime_type: vm
//! ```

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default OCI runtime state root.
pub const DEFAULT_RUNTIME_ROOT: &str = "/run/runc";

/// Prefix a VM handler's runtime path must carry.
pub const SHIM_BINARY_PREFIX: &str = "containerd-shim-";

/// Suffix a VM handler's runtime path must carry.
pub const SHIM_BINARY_VERSION: &str = "-v2";

// =============================================================================
// Runtime Handler
// =============================================================================

/// Back-end kind selected by a runtime handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuntimeType {
    /// Monitor-process supervised OCI runtime.
    #[default]
    Oci,
    /// Task-API shim (VM-isolated containers).
    Vm,
    /// One monitor process per sandbox.
    Pod,
    /// No real runtime: placeholder processes only.
    Spoofed,
}

impl fmt::Display for RuntimeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Oci => write!(f, "oci"),
            Self::Vm => write!(f, "vm"),
            Self::Pod => write!(f, "pod"),
            Self::Spoofed => write!(f, "spoofed"),
        }
    }
}

/// Configuration of a single runtime handler.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeHandler {
    /// OCI runtime binary, or the shim binary for VM handlers.
    pub runtime_path: PathBuf,
    /// State root passed to the OCI runtime as `--root`.
    pub runtime_root: Option<PathBuf>,
    /// Back-end kind.
    pub runtime_type: RuntimeType,
    /// Runtime-specific config file forwarded to VM shims.
    pub runtime_config_path: Option<PathBuf>,
    /// Per-handler monitor binary override.
    pub monitor_path: Option<PathBuf>,
}

impl RuntimeHandler {
    /// Returns the runtime root, falling back to [`DEFAULT_RUNTIME_ROOT`].
    pub fn root(&self) -> PathBuf {
        self.runtime_root
            .clone()
            .unwrap_or_else(|| PathBuf::from(DEFAULT_RUNTIME_ROOT))
    }
}

// =============================================================================
// Cgroup Manager Mode
// =============================================================================

/// Cgroup manager mode, forwarded to the monitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CgroupManagerKind {
    /// Cgroups are managed through systemd scopes.
    #[default]
    Systemd,
    /// Cgroups are managed directly on the cgroup filesystem.
    Cgroupfs,
}

// =============================================================================
// Config
// =============================================================================

/// Static configuration consumed by the [`crate::facade::Runtime`] facade.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Handler used when a container names none.
    pub default_runtime: String,
    /// Handler name to handler configuration.
    pub runtimes: HashMap<String, RuntimeHandler>,
    /// Monitor binary used by OCI handlers.
    pub monitor_path: PathBuf,
    /// Extra environment passed to the monitor.
    pub monitor_env: Vec<String>,
    /// Directory where exit-code files are written, one per container ID.
    pub container_exits_dir: PathBuf,
    /// Directory holding per-container attach sockets.
    pub container_attach_socket_dir: PathBuf,
    /// Cgroup manager mode.
    pub cgroup_manager: CgroupManagerKind,
    /// Root of the cgroup filesystem.
    pub cgroup_root: PathBuf,
    /// Maximum container log size in bytes; negative disables the limit.
    pub log_size_max: i64,
    /// Also send container logs to journald.
    pub log_to_journald: bool,
    /// Ask the OCI runtime not to use pivot_root.
    pub no_pivot: bool,
    /// Bound, in seconds, for the stopped-state wait loop.
    pub ctr_stop_timeout: u64,
}

impl Default for Config {
    fn default() -> Self {
        let mut runtimes = HashMap::new();
        runtimes.insert(
            "runc".to_string(),
            RuntimeHandler {
                runtime_path: PathBuf::from("/usr/bin/runc"),
                ..Default::default()
            },
        );
        Self {
            default_runtime: "runc".to_string(),
            runtimes,
            monitor_path: PathBuf::from("/usr/bin/conmon"),
            monitor_env: Vec::new(),
            container_exits_dir: PathBuf::from("/var/run/crio/exits"),
            container_attach_socket_dir: PathBuf::from("/var/run/crio"),
            cgroup_manager: CgroupManagerKind::Systemd,
            cgroup_root: PathBuf::from("/sys/fs/cgroup"),
            log_size_max: -1,
            log_to_journald: false,
            no_pivot: false,
            ctr_stop_timeout: crate::constants::DEFAULT_WAIT_STOPPED_TIMEOUT.as_secs(),
        }
    }
}

impl Config {
    /// Parses a configuration from YAML and validates it.
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(yaml)
            .map_err(|e| Error::InvalidConfig(format!("failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Reads, parses and validates a YAML configuration file.
    pub fn from_yaml_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::InvalidConfig(format!("failed to read {}: {}", path.display(), e))
        })?;
        Self::from_yaml_str(&content)
    }

    /// Checks handler consistency.
    pub fn validate(&self) -> Result<()> {
        if !self.runtimes.contains_key(&self.default_runtime) {
            return Err(Error::InvalidConfig(format!(
                "default runtime {:?} is not among the configured runtimes",
                self.default_runtime
            )));
        }
        for (name, handler) in &self.runtimes {
            if handler.runtime_path.as_os_str().is_empty() {
                return Err(Error::InvalidConfig(format!(
                    "empty runtime path for runtime handler {}",
                    name
                )));
            }
            if handler.runtime_type == RuntimeType::Vm {
                let file = handler
                    .runtime_path
                    .file_name()
                    .and_then(|f| f.to_str())
                    .unwrap_or_default();
                if !file.starts_with(SHIM_BINARY_PREFIX) || !file.ends_with(SHIM_BINARY_VERSION)
                {
                    return Err(Error::InvalidConfig(format!(
                        "invalid runtime_path for runtime '{}': containerd binary naming pattern is not followed",
                        name
                    )));
                }
            }
        }
        Ok(())
    }

    /// Bound for the stopped-state wait loop.
    pub fn wait_stopped_timeout(&self) -> Duration {
        Duration::from_secs(self.ctr_stop_timeout)
    }
}

/// Converts a `containerd-shim-<name>-v2` path into the
/// `containerd.shim.<name>.v2` binary name containerd expects, keeping
/// the directory.
///
/// The path must already have passed [`Config::validate`].
pub fn build_containerd_binary_name(path: &Path) -> PathBuf {
    let file = path
        .file_name()
        .and_then(|f| f.to_str())
        .unwrap_or_default();
    let name = file
        .strip_prefix(SHIM_BINARY_PREFIX)
        .unwrap_or(file)
        .split(SHIM_BINARY_VERSION)
        .next()
        .unwrap_or_default();
    let binary = format!("containerd.shim.{}.v2", name);
    match path.parent() {
        Some(dir) => dir.join(binary),
        None => PathBuf::from(binary),
    }
}

/// Resolves a containerd runtime name back to the shim binary to run:
/// `containerd.shim.<name>.<version>` becomes `containerd-shim-<name>-<version>`
/// in the same directory.
///
/// `None` for a name without at least a name and a version part.
pub fn shim_binary_path(runtime_name: &Path) -> Option<PathBuf> {
    let file = runtime_name.file_name()?.to_str()?;
    let mut parts = file.rsplit('.');
    let version = parts.next()?;
    let name = parts.next()?;
    if name.is_empty() || version.is_empty() {
        return None;
    }
    let binary = format!("{}{}-{}", SHIM_BINARY_PREFIX, name, version);
    Some(match runtime_name.parent() {
        Some(dir) => dir.join(binary),
        None => PathBuf::from(binary),
    })
}
