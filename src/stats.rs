//! Container resource statistics.
//!
//! The process-supervised back-ends read statistics straight from the
//! container's cgroup; the VM back-end receives the same structure from the
//! shim.

use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

/// CPU usage.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CpuStats {
    /// Cumulative CPU time in nanoseconds.
    pub usage_core_nanos: u64,
}

/// Memory usage.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryStats {
    /// Usage minus inactive file cache.
    pub working_set_bytes: u64,
    /// Total usage including cache.
    pub usage_bytes: u64,
    /// Limit, `None` when unlimited.
    pub limit_bytes: Option<u64>,
    /// Anonymous memory.
    pub rss_bytes: u64,
    pub page_faults: u64,
    pub major_page_faults: u64,
}

/// Resource usage snapshot of one container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerStats {
    pub container_id: String,
    pub timestamp: DateTime<Utc>,
    pub cpu: CpuStats,
    pub memory: MemoryStats,
}

impl ContainerStats {
    /// An all-zero snapshot taken now.
    pub fn empty(container_id: &str) -> Self {
        Self {
            container_id: container_id.to_string(),
            timestamp: Utc::now(),
            cpu: CpuStats::default(),
            memory: MemoryStats::default(),
        }
    }
}

/// Reads statistics for the cgroup at `cgroup_path`, relative to
/// `cgroup_root`. Unified (v2) and legacy (v1) hierarchies are supported.
pub fn read_cgroup_stats(
    container_id: &str,
    cgroup_root: &Path,
    cgroup_path: &str,
) -> Result<ContainerStats> {
    let relative = cgroup_path.trim_start_matches('/');
    if cgroup_root.join("cgroup.controllers").exists() {
        read_v2(container_id, &cgroup_root.join(relative))
    } else {
        read_v1(container_id, cgroup_root, relative)
    }
}

fn read_v2(container_id: &str, dir: &Path) -> Result<ContainerStats> {
    if !dir.is_dir() {
        return Err(Error::ContainerNotFound(format!(
            "cgroup {} for container {}",
            dir.display(),
            container_id
        )));
    }
    let cpu_stat = read_flat_keyed(&dir.join("cpu.stat"))?;
    let memory_stat = read_flat_keyed(&dir.join("memory.stat"))?;
    let usage = read_u64(&dir.join("memory.current"))?;
    let limit = read_limit(&dir.join("memory.max"))?;
    let inactive_file = memory_stat.get("inactive_file").copied().unwrap_or(0);

    Ok(ContainerStats {
        container_id: container_id.to_string(),
        timestamp: Utc::now(),
        cpu: CpuStats {
            usage_core_nanos: cpu_stat.get("usage_usec").copied().unwrap_or(0) * 1000,
        },
        memory: MemoryStats {
            working_set_bytes: usage.saturating_sub(inactive_file),
            usage_bytes: usage,
            limit_bytes: limit,
            rss_bytes: memory_stat.get("anon").copied().unwrap_or(0),
            page_faults: memory_stat.get("pgfault").copied().unwrap_or(0),
            major_page_faults: memory_stat.get("pgmajfault").copied().unwrap_or(0),
        },
    })
}

fn read_v1(container_id: &str, root: &Path, relative: &str) -> Result<ContainerStats> {
    let cpu_dir = root.join("cpuacct").join(relative);
    let mem_dir = root.join("memory").join(relative);
    if !mem_dir.is_dir() {
        return Err(Error::ContainerNotFound(format!(
            "cgroup {} for container {}",
            mem_dir.display(),
            container_id
        )));
    }
    let memory_stat = read_flat_keyed(&mem_dir.join("memory.stat"))?;
    let usage = read_u64(&mem_dir.join("memory.usage_in_bytes"))?;
    let inactive_file = memory_stat
        .get("total_inactive_file")
        .copied()
        .unwrap_or(0);
    // v1 reports "unlimited" as a page-aligned i64::MAX.
    let limit = read_u64(&mem_dir.join("memory.limit_in_bytes"))
        .ok()
        .filter(|&l| l < (i64::MAX as u64) & !4095);

    Ok(ContainerStats {
        container_id: container_id.to_string(),
        timestamp: Utc::now(),
        cpu: CpuStats {
            usage_core_nanos: read_u64(&cpu_dir.join("cpuacct.usage")).unwrap_or(0),
        },
        memory: MemoryStats {
            working_set_bytes: usage.saturating_sub(inactive_file),
            usage_bytes: usage,
            limit_bytes: limit,
            rss_bytes: memory_stat.get("total_rss").copied().unwrap_or(0),
            page_faults: memory_stat.get("total_pgfault").copied().unwrap_or(0),
            major_page_faults: memory_stat.get("total_pgmajfault").copied().unwrap_or(0),
        },
    })
}

fn read_u64(path: &Path) -> Result<u64> {
    let content = std::fs::read_to_string(path)?;
    content
        .trim()
        .parse()
        .map_err(|e| Error::Internal(format!("failed to parse {}: {}", path.display(), e)))
}

fn read_limit(path: &Path) -> Result<Option<u64>> {
    let content = std::fs::read_to_string(path)?;
    match content.trim() {
        "max" => Ok(None),
        v => v
            .parse()
            .map(Some)
            .map_err(|e| Error::Internal(format!("failed to parse {}: {}", path.display(), e))),
    }
}

/// Parses `key value` lines; malformed lines are skipped.
fn read_flat_keyed(path: &Path) -> Result<HashMap<String, u64>> {
    let content = std::fs::read_to_string(path)?;
    Ok(content
        .lines()
        .filter_map(|line| {
            let mut parts = line.split_whitespace();
            let key = parts.next()?;
            let value = parts.next()?.parse().ok()?;
            Some((key.to_string(), value))
        })
        .collect())
}
