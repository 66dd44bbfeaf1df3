//! OOM counters.
//!
//! A [`Metrics`] value is built once by the embedder and handed to the
//! [`crate::facade::Runtime`], which shares it with every back-end.

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

/// Container OOM counters, total and per container name.
#[derive(Debug, Default)]
pub struct Metrics {
    containers_oom_total: AtomicU64,
    containers_oom: Mutex<HashMap<String, u64>>,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records one OOM kill of the named container.
    pub fn record_oom(&self, name: &str) {
        self.containers_oom_total.fetch_add(1, Ordering::Relaxed);
        if let Ok(mut counts) = self.containers_oom.lock() {
            *counts.entry(name.to_string()).or_insert(0) += 1;
        }
        tracing::debug!(container = %name, "recorded container OOM");
    }

    /// Total OOM kills across all containers.
    pub fn containers_oom_total(&self) -> u64 {
        self.containers_oom_total.load(Ordering::Relaxed)
    }

    /// OOM kills recorded for one container name.
    pub fn containers_oom(&self, name: &str) -> u64 {
        self.containers_oom
            .lock()
            .ok()
            .and_then(|counts| counts.get(name).copied())
            .unwrap_or(0)
    }

    /// Clears a name's counter, e.g. once its container is removed.
    pub fn forget(&self, name: &str) {
        if let Ok(mut counts) = self.containers_oom.lock() {
            counts.remove(name);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_oom_counters() {
        let metrics = Metrics::new();
        metrics.record_oom("web");
        metrics.record_oom("web");
        metrics.record_oom("db");
        assert_eq!(metrics.containers_oom_total(), 3);
        assert_eq!(metrics.containers_oom("web"), 2);
        metrics.forget("web");
        assert_eq!(metrics.containers_oom("web"), 0);
        assert_eq!(metrics.containers_oom_total(), 3);
    }
}
