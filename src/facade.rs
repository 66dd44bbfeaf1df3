//! The [`Runtime`] facade: picks a back-end per container and forwards to it.
//!
//! ```text
//!                 ┌──────────── impls: container ID → RuntimeImpl ───────────┐
//! create_container│  oci handler      → OciRuntime    (one per container)     │
//!   ──────────────►  spoofed          → SpoofedRuntime (one per container)    │
//!                 │  vm / pod handler → VmRuntime / PodRuntime                │
//!                 │                     (one per sandbox, shared by siblings) │
//!                 └───────────────────────────────────────────────────────────┘
//! ```
//!
//! The cache lock only covers map lookups and mutations. It is never held
//! while a back-end call is in flight, so work on one container does not
//! block lookups for another.

use crate::cgroup::CgroupManager;
use crate::config::{Config, RuntimeHandler, RuntimeType};
use crate::constants::WAIT_STOPPED_POLL_INTERVAL;
use crate::container::{Container, ContainerStatus};
use crate::error::{Error, Result};
use crate::metrics::Metrics;
use crate::runtime::{ExecSyncResponse, LinuxResources, RuntimeImpl};
use crate::runtimes::{OciRuntime, PodRuntime, SpoofedRuntime, VmRuntime};
use crate::signal::Signal;
use crate::stats::ContainerStats;
use crate::streams::{DuplexStream, StreamOptions};
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Dispatches container operations to the back-end chosen at creation.
pub struct Runtime {
    config: Arc<Config>,
    metrics: Arc<Metrics>,
    cgroup_manager: Arc<dyn CgroupManager>,
    impls: RwLock<HashMap<String, Arc<dyn RuntimeImpl>>>,
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("default_runtime", &self.config.default_runtime)
            .field("cached", &self.cached_len())
            .finish()
    }
}

impl Runtime {
    pub fn new(
        config: Arc<Config>,
        metrics: Arc<Metrics>,
        cgroup_manager: Arc<dyn CgroupManager>,
    ) -> Self {
        Self {
            config,
            metrics,
            cgroup_manager,
            impls: RwLock::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    // =========================================================================
    // Handlers
    // =========================================================================

    /// Resolves `name`, with an empty name meaning the default handler.
    fn resolve_handler(&self, name: &str) -> Result<(&str, &RuntimeHandler)> {
        let name = if name.is_empty() {
            self.config.default_runtime.as_str()
        } else {
            name
        };
        self.config
            .runtimes
            .get_key_value(name)
            .map(|(name, handler)| (name.as_str(), handler))
            .ok_or_else(|| Error::RuntimeHandlerNotFound(name.to_string()))
    }

    /// Checks that `handler` names a configured runtime handler.
    pub fn validate_runtime_handler(&self, handler: &str) -> Result<&RuntimeHandler> {
        if handler.is_empty() {
            return Err(Error::RuntimeHandlerNotFound(
                "empty runtime handler".to_string(),
            ));
        }
        self.resolve_handler(handler).map(|(_, h)| h)
    }

    /// Back-end kind of `handler`, or of the default handler if empty.
    pub fn runtime_type(&self, handler: &str) -> Result<RuntimeType> {
        self.resolve_handler(handler).map(|(_, h)| h.runtime_type)
    }

    /// All configured handlers.
    pub fn runtimes(&self) -> &HashMap<String, RuntimeHandler> {
        &self.config.runtimes
    }

    /// True if a back-end is cached under `id`, a container or sandbox ID.
    pub fn has_runtime(&self, id: &str) -> bool {
        self.impls.read().map(|m| m.contains_key(id)).unwrap_or(false)
    }

    // =========================================================================
    // Implementation Cache
    // =========================================================================

    fn read_impls(
        &self,
    ) -> Result<std::sync::RwLockReadGuard<'_, HashMap<String, Arc<dyn RuntimeImpl>>>> {
        self.impls
            .read()
            .map_err(|e| Error::Internal(format!("lock poisoned: {}", e)))
    }

    fn write_impls(
        &self,
    ) -> Result<std::sync::RwLockWriteGuard<'_, HashMap<String, Arc<dyn RuntimeImpl>>>> {
        self.impls
            .write()
            .map_err(|e| Error::Internal(format!("lock poisoned: {}", e)))
    }

    fn cached(&self, id: &str) -> Result<Option<Arc<dyn RuntimeImpl>>> {
        Ok(self.read_impls()?.get(id).cloned())
    }

    fn cached_len(&self) -> usize {
        self.impls.read().map(|m| m.len()).unwrap_or(0)
    }

    /// Builds the back-end for `c`.
    ///
    /// Shared back-ends are created with the infra container. A sibling
    /// created before its sandbox is an error; a sibling looked up after a
    /// daemon restart gets a fresh shared back-end that redials the
    /// persisted task server address.
    fn new_runtime_impl(&self, c: &Container, creating: bool) -> Result<Arc<dyn RuntimeImpl>> {
        let (name, handler) = self.resolve_handler(c.runtime_handler())?;
        match handler.runtime_type {
            _ if c.is_spoofed() => return Ok(Arc::new(SpoofedRuntime::new(name))),
            RuntimeType::Spoofed => return Ok(Arc::new(SpoofedRuntime::new(name))),
            RuntimeType::Oci => {
                return Ok(Arc::new(OciRuntime::new(
                    name,
                    handler,
                    Arc::clone(&self.config),
                    Arc::clone(&self.cgroup_manager),
                    Arc::clone(&self.metrics),
                )));
            }
            RuntimeType::Vm | RuntimeType::Pod => {}
        }
        if c.is_infra() {
            return Ok(self.new_shared_impl(name, handler));
        }
        if let Some(existing) = self.cached(c.sandbox())? {
            return Ok(existing);
        }
        if creating {
            return Err(Error::Internal(format!(
                "container {} created before its sandbox {}",
                c.id(),
                c.sandbox()
            )));
        }
        debug!(container = %c.id(), sandbox = %c.sandbox(), "rebuilding sandbox runtime");
        let mut impls = self.write_impls()?;
        Ok(Arc::clone(
            impls
                .entry(c.sandbox().to_string())
                .or_insert_with(|| self.new_shared_impl(name, handler)),
        ))
    }

    fn new_shared_impl(&self, name: &str, handler: &RuntimeHandler) -> Arc<dyn RuntimeImpl> {
        match handler.runtime_type {
            RuntimeType::Pod => Arc::new(PodRuntime::new(
                name,
                handler,
                Arc::clone(&self.config),
                Arc::clone(&self.cgroup_manager),
                Arc::clone(&self.metrics),
            )),
            _ => Arc::new(VmRuntime::new(
                name,
                handler,
                Arc::clone(&self.config),
                Arc::clone(&self.metrics),
            )),
        }
    }

    /// Cached back-end of `c`, built on first use.
    fn runtime_impl(&self, c: &Container) -> Result<Arc<dyn RuntimeImpl>> {
        if let Some(existing) = self.cached(c.id())? {
            return Ok(existing);
        }
        let built = self.new_runtime_impl(c, false)?;
        let mut impls = self.write_impls()?;
        Ok(Arc::clone(
            impls.entry(c.id().to_string()).or_insert(built),
        ))
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Creates `c` with the back-end of its runtime handler.
    pub async fn create_container(&self, c: &Arc<Container>, cgroup_parent: &str) -> Result<()> {
        let runtime = self.new_runtime_impl(c, true)?;
        self.write_impls()?
            .insert(c.id().to_string(), Arc::clone(&runtime));
        debug!(container = %c.id(), runtime = %runtime.name(), "creating container");
        runtime.create_container(c, cgroup_parent).await
    }

    pub async fn start_container(&self, c: &Arc<Container>) -> Result<()> {
        self.runtime_impl(c)?.start_container(c).await
    }

    pub async fn exec_container(
        &self,
        c: &Arc<Container>,
        cmd: &[String],
        streams: StreamOptions,
    ) -> Result<()> {
        self.runtime_impl(c)?.exec_container(c, cmd, streams).await
    }

    pub async fn exec_sync_container(
        &self,
        c: &Arc<Container>,
        cmd: &[String],
        timeout: Option<Duration>,
    ) -> Result<ExecSyncResponse> {
        self.runtime_impl(c)?
            .exec_sync_container(c, cmd, timeout)
            .await
    }

    pub async fn update_container(
        &self,
        c: &Arc<Container>,
        resources: &LinuxResources,
    ) -> Result<()> {
        self.runtime_impl(c)?.update_container(c, resources).await
    }

    /// Stops `c`. A stopped container yields [`Error::AlreadyStopped`].
    pub async fn stop_container(&self, c: &Arc<Container>, timeout: Duration) -> Result<()> {
        self.runtime_impl(c)?.stop_container(c, timeout).await
    }

    /// Deletes `c`. The cache entry goes only once the back-end succeeded,
    /// so a failed delete can be retried.
    pub async fn delete_container(&self, c: &Arc<Container>) -> Result<()> {
        let runtime = self.runtime_impl(c)?;
        runtime.delete_container(c).await?;
        self.write_impls()?.remove(c.id());
        self.metrics.forget(c.name());
        debug!(container = %c.id(), "removed runtime for container");
        Ok(())
    }

    pub async fn update_container_status(&self, c: &Arc<Container>) -> Result<()> {
        self.runtime_impl(c)?.update_container_status(c).await
    }

    pub async fn pause_container(&self, c: &Arc<Container>) -> Result<()> {
        self.runtime_impl(c)?.pause_container(c).await
    }

    pub async fn unpause_container(&self, c: &Arc<Container>) -> Result<()> {
        self.runtime_impl(c)?.unpause_container(c).await
    }

    pub async fn container_stats(
        &self,
        c: &Arc<Container>,
        cgroup: &str,
    ) -> Result<ContainerStats> {
        self.runtime_impl(c)?.container_stats(c, cgroup).await
    }

    pub async fn signal_container(&self, c: &Arc<Container>, sig: Signal) -> Result<()> {
        self.runtime_impl(c)?.signal_container(c, sig).await
    }

    pub async fn attach_container(
        &self,
        c: &Arc<Container>,
        streams: StreamOptions,
    ) -> Result<()> {
        self.runtime_impl(c)?.attach_container(c, streams).await
    }

    pub async fn port_forward_container(
        &self,
        c: &Arc<Container>,
        netns_path: &Path,
        port: u16,
        stream: Box<dyn DuplexStream>,
        cancel: CancellationToken,
    ) -> Result<()> {
        self.runtime_impl(c)?
            .port_forward_container(c, netns_path, port, stream, cancel)
            .await
    }

    pub async fn reopen_container_log(&self, c: &Arc<Container>) -> Result<()> {
        self.runtime_impl(c)?.reopen_container_log(c).await
    }

    /// Polls the container's status until it is stopped.
    ///
    /// Bounded by [`Config::wait_stopped_timeout`]; returns
    /// [`Error::Cancelled`] once `cancel` fires.
    pub async fn wait_container_state_stopped(
        &self,
        c: &Arc<Container>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        if c.status()? == ContainerStatus::Stopped {
            return Ok(());
        }
        let runtime = self.runtime_impl(c)?;
        let timeout = self.config.wait_stopped_timeout();

        let poll = async {
            loop {
                runtime.update_container_status(c).await?;
                if c.status()? == ContainerStatus::Stopped {
                    return Ok::<(), Error>(());
                }
                tokio::time::sleep(WAIT_STOPPED_POLL_INTERVAL).await;
            }
        };

        tokio::select! {
            res = poll => res,
            _ = cancel.cancelled() => Err(Error::Cancelled(format!(
                "waiting for container {} to stop",
                c.id()
            ))),
            _ = tokio::time::sleep(timeout) => Err(Error::Timeout {
                operation: format!("wait for container {} stopped status", c.id()),
                duration: timeout,
            }),
        }
    }

    // =========================================================================
    // Teardown
    // =========================================================================

    /// Shuts down and forgets the shared back-end of a removed sandbox.
    pub async fn remove_runtime_for_sandbox(&self, sandbox_id: &str) -> Result<()> {
        let Some(runtime) = self.cached(sandbox_id)? else {
            return Ok(());
        };
        runtime.shutdown().await?;
        self.write_impls()?.remove(sandbox_id);
        info!(sandbox = %sandbox_id, "removed sandbox runtime");
        Ok(())
    }

    /// Shuts every cached back-end down once, however many containers share it.
    pub async fn shutdown(&self) -> Result<()> {
        let drained: Vec<_> = self.write_impls()?.drain().collect();
        for (id, runtime) in distinct_runtimes(drained) {
            if let Err(e) = runtime.shutdown().await {
                warn!(container = %id, runtime = %runtime.name(), error = %e, "runtime shutdown failed");
            }
        }
        Ok(())
    }
}

/// Drops entries whose back-end already appeared under another ID.
fn distinct_runtimes(
    entries: Vec<(String, Arc<dyn RuntimeImpl>)>,
) -> Vec<(String, Arc<dyn RuntimeImpl>)> {
    let mut distinct: Vec<(String, Arc<dyn RuntimeImpl>)> = Vec::with_capacity(entries.len());
    for (id, runtime) in entries {
        if !distinct.iter().any(|(_, seen)| Arc::ptr_eq(seen, &runtime)) {
            distinct.push((id, runtime));
        }
    }
    distinct
}
