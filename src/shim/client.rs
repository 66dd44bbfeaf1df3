//! ttrpc client for the containerd task API (`containerd.task.v2.Task`).
//!
//! OCI structures travel as JSON inside protobuf `Any` values, under the
//! type URLs containerd registers for them. Statistics come back as cgroup
//! metrics and are folded into [`ContainerStats`].
//!
//! ```rust,ignore
//! let task = TtrpcDialer.dial("unix:///run/containerd/s/abc").await?;
//! let state = task.state("ctr1").await?;
//! task.kill("ctr1", None, 15, false).await?;
//! ```

use super::task::{CreateTask, TaskDialer, TaskService};
use super::{
    ErrorCode, ExitStatus, ProcessIo, ShimError, ShimResult, TaskState, TaskStatus, UNIX_SCHEME,
};
use crate::constants::RPC_TIMEOUT;
use crate::runtime::LinuxResources;
use crate::stats::{ContainerStats, CpuStats, MemoryStats};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use containerd_shim_protos::api;
use containerd_shim_protos::cgroups::metrics::Metrics;
use containerd_shim_protos::protobuf::well_known_types::any::Any;
use containerd_shim_protos::protobuf::well_known_types::timestamp::Timestamp;
use containerd_shim_protos::protobuf::{CodedOutputStream, Message, MessageField};
use containerd_shim_protos::shim_async::TaskClient;
use containerd_shim_protos::types::task::Status;
use std::path::Path;
use std::sync::Arc;
use tracing::debug;
use ttrpc::context::{self, Context};
use ttrpc::proto::Code;

/// Type URL of an OCI process spec encoded as JSON.
const PROCESS_SPEC_TYPE_URL: &str = "types.containerd.io/opencontainers/runtime-spec/1/Process";

/// Type URL of OCI Linux resources encoded as JSON.
const LINUX_RESOURCES_TYPE_URL: &str =
    "types.containerd.io/opencontainers/runtime-spec/1/LinuxResources";

/// Type URL of the CRI runtime options carrying the shim config path.
const RUNTIME_OPTIONS_TYPE_URL: &str = "runtimeoptions.v1.Options";

/// Field number of `config_path` in `runtimeoptions.v1.Options`.
const RUNTIME_OPTIONS_CONFIG_PATH_FIELD: u32 = 2;

/// Prefixes `unix://` to a bare socket path.
pub fn normalize_address(address: &str) -> String {
    let trimmed = address.trim();
    if trimmed.contains("://") {
        trimmed.to_string()
    } else {
        format!("{}{}", UNIX_SCHEME, trimmed)
    }
}

fn map_rpc_error(err: ttrpc::Error) -> ShimError {
    match err {
        ttrpc::Error::RpcStatus(status) => {
            let code = match status.code() {
                Code::NOT_FOUND => ErrorCode::NotFound,
                Code::ALREADY_EXISTS => ErrorCode::AlreadyExists,
                Code::INVALID_ARGUMENT => ErrorCode::InvalidArgument,
                Code::FAILED_PRECONDITION => ErrorCode::FailedPrecondition,
                Code::DEADLINE_EXCEEDED => ErrorCode::DeadlineExceeded,
                Code::UNIMPLEMENTED => ErrorCode::Unimplemented,
                _ => ErrorCode::Internal,
            };
            ShimError::Remote {
                code,
                message: status.message().to_string(),
            }
        }
        ttrpc::Error::RemoteClosed | ttrpc::Error::LocalClosed => ShimError::ConnectionClosed,
        other => ShimError::Remote {
            code: ErrorCode::Internal,
            message: other.to_string(),
        },
    }
}

fn rpc_context() -> Context {
    context::with_timeout(i64::try_from(RPC_TIMEOUT.as_nanos()).unwrap_or(i64::MAX))
}

fn json_any(type_url: &str, value: &impl serde::Serialize) -> ShimResult<MessageField<Any>> {
    Ok(MessageField::some(Any {
        type_url: type_url.to_string(),
        value: serde_json::to_vec(value)?,
        ..Default::default()
    }))
}

/// Encodes `runtimeoptions.v1.Options { config_path }`.
fn runtime_options(config_path: &Path) -> ShimResult<MessageField<Any>> {
    let mut value = Vec::new();
    {
        let mut os = CodedOutputStream::vec(&mut value);
        os.write_string(
            RUNTIME_OPTIONS_CONFIG_PATH_FIELD,
            &config_path.to_string_lossy(),
        )
        .and_then(|_| os.flush())
        .map_err(|e| ShimError::InvalidInput(format!("runtime options: {}", e)))?;
    }
    Ok(MessageField::some(Any {
        type_url: RUNTIME_OPTIONS_TYPE_URL.to_string(),
        value,
        ..Default::default()
    }))
}

fn timestamp(ts: &MessageField<Timestamp>) -> Option<DateTime<Utc>> {
    let ts = ts.as_ref()?;
    if ts.seconds == 0 && ts.nanos == 0 {
        return None;
    }
    DateTime::from_timestamp(ts.seconds, ts.nanos.max(0) as u32)
}

fn task_status(status: Status) -> TaskStatus {
    match status {
        Status::CREATED => TaskStatus::Created,
        Status::RUNNING => TaskStatus::Running,
        Status::STOPPED => TaskStatus::Stopped,
        Status::PAUSED => TaskStatus::Paused,
        Status::PAUSING => TaskStatus::Pausing,
        _ => TaskStatus::Unknown,
    }
}

/// Folds cgroup metrics reported by the shim into [`ContainerStats`].
fn decode_stats(id: &str, stats: &MessageField<Any>) -> ShimResult<ContainerStats> {
    let mut out = ContainerStats::empty(id);
    let Some(any) = stats.as_ref() else {
        return Ok(out);
    };
    let metrics = Metrics::parse_from_bytes(&any.value).map_err(|e| ShimError::Decode {
        what: any.type_url.clone(),
        reason: e.to_string(),
    })?;
    if let Some(cpu) = metrics.cpu.as_ref()
        && let Some(usage) = cpu.usage.as_ref()
    {
        out.cpu = CpuStats {
            usage_core_nanos: usage.total,
        };
    }
    if let Some(memory) = metrics.memory.as_ref() {
        let (usage, limit) = memory
            .usage
            .as_ref()
            .map_or((0, 0), |entry| (entry.usage, entry.limit));
        out.memory = MemoryStats {
            working_set_bytes: usage.saturating_sub(memory.total_inactive_file),
            usage_bytes: usage,
            limit_bytes: (limit != 0 && limit != u64::MAX).then_some(limit),
            rss_bytes: memory.rss,
            page_faults: memory.pg_fault,
            major_page_faults: memory.pg_maj_fault,
        };
    }
    Ok(out)
}

fn signal_number(signal: i32) -> ShimResult<u32> {
    u32::try_from(signal).map_err(|_| ShimError::InvalidInput(format!("signal {}", signal)))
}

/// Task client over one ttrpc connection.
#[derive(Clone)]
pub struct TtrpcTaskClient {
    address: String,
    task: TaskClient,
}

impl std::fmt::Debug for TtrpcTaskClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TtrpcTaskClient")
            .field("address", &self.address)
            .finish()
    }
}

impl TtrpcTaskClient {
    /// Connects to `address`, with or without the `unix://` prefix.
    pub async fn dial(address: &str) -> ShimResult<Self> {
        let address = normalize_address(address);
        let connect = async { ttrpc::asynchronous::Client::connect(&address) };
        let client = tokio::time::timeout(RPC_TIMEOUT, connect)
            .await
            .map_err(|_| ShimError::Timeout(RPC_TIMEOUT))?
            .map_err(|e| ShimError::ConnectionFailed {
                address: address.clone(),
                reason: e.to_string(),
            })?;
        Ok(Self {
            address,
            task: TaskClient::new(client),
        })
    }

    pub fn address(&self) -> &str {
        &self.address
    }
}

#[async_trait]
impl TaskService for TtrpcTaskClient {
    async fn connect(&self, id: &str) -> ShimResult<u32> {
        let req = api::ConnectRequest {
            id: id.to_string(),
            ..Default::default()
        };
        let resp = self
            .task
            .connect(rpc_context(), &req)
            .await
            .map_err(map_rpc_error)?;
        Ok(resp.shim_pid)
    }

    async fn create(&self, req: CreateTask) -> ShimResult<i32> {
        if req.id.is_empty() {
            return Err(ShimError::InvalidInput("task id is empty".to_string()));
        }
        let options = match &req.config_path {
            Some(path) => runtime_options(path)?,
            None => MessageField::none(),
        };
        let create = api::CreateTaskRequest {
            id: req.id,
            bundle: req.bundle.to_string_lossy().into_owned(),
            terminal: req.io.terminal,
            stdin: req.io.stdin.to_string_lossy().into_owned(),
            stdout: req.io.stdout.to_string_lossy().into_owned(),
            stderr: req.io.stderr.to_string_lossy().into_owned(),
            options,
            ..Default::default()
        };
        let resp = self
            .task
            .create(rpc_context(), &create)
            .await
            .map_err(map_rpc_error)?;
        Ok(resp.pid as i32)
    }

    async fn start(&self, id: &str, exec_id: Option<&str>) -> ShimResult<i32> {
        let req = api::StartRequest {
            id: id.to_string(),
            exec_id: exec_id.unwrap_or_default().to_string(),
            ..Default::default()
        };
        let resp = self
            .task
            .start(rpc_context(), &req)
            .await
            .map_err(map_rpc_error)?;
        Ok(resp.pid as i32)
    }

    async fn state(&self, id: &str) -> ShimResult<TaskState> {
        let req = api::StateRequest {
            id: id.to_string(),
            ..Default::default()
        };
        let resp = self
            .task
            .state(rpc_context(), &req)
            .await
            .map_err(map_rpc_error)?;
        Ok(TaskState {
            id: resp.id.clone(),
            pid: resp.pid as i32,
            status: task_status(resp.status()),
            exit_status: resp.exit_status as i32,
            exited_at: timestamp(&resp.exited_at),
            io: ProcessIo {
                stdin: resp.stdin.clone().into(),
                stdout: resp.stdout.clone().into(),
                stderr: resp.stderr.clone().into(),
                terminal: resp.terminal,
            },
        })
    }

    async fn kill(
        &self,
        id: &str,
        exec_id: Option<&str>,
        signal: i32,
        all: bool,
    ) -> ShimResult<()> {
        let req = api::KillRequest {
            id: id.to_string(),
            exec_id: exec_id.unwrap_or_default().to_string(),
            signal: signal_number(signal)?,
            all,
            ..Default::default()
        };
        self.task
            .kill(rpc_context(), &req)
            .await
            .map_err(map_rpc_error)?;
        Ok(())
    }

    async fn wait(&self, id: &str, exec_id: Option<&str>) -> ShimResult<ExitStatus> {
        let req = api::WaitRequest {
            id: id.to_string(),
            exec_id: exec_id.unwrap_or_default().to_string(),
            ..Default::default()
        };
        let resp = self
            .task
            .wait(Context::default(), &req)
            .await
            .map_err(map_rpc_error)?;
        Ok(ExitStatus {
            code: resp.exit_status as i32,
            exited_at: timestamp(&resp.exited_at),
        })
    }

    async fn delete(&self, id: &str, exec_id: Option<&str>) -> ShimResult<()> {
        let req = api::DeleteRequest {
            id: id.to_string(),
            exec_id: exec_id.unwrap_or_default().to_string(),
            ..Default::default()
        };
        self.task
            .delete(rpc_context(), &req)
            .await
            .map_err(map_rpc_error)?;
        Ok(())
    }

    async fn exec(
        &self,
        id: &str,
        exec_id: &str,
        io: ProcessIo,
        spec: &serde_json::Value,
    ) -> ShimResult<()> {
        let req = api::ExecProcessRequest {
            id: id.to_string(),
            exec_id: exec_id.to_string(),
            terminal: io.terminal,
            stdin: io.stdin.to_string_lossy().into_owned(),
            stdout: io.stdout.to_string_lossy().into_owned(),
            stderr: io.stderr.to_string_lossy().into_owned(),
            spec: json_any(PROCESS_SPEC_TYPE_URL, spec)?,
            ..Default::default()
        };
        self.task
            .exec(rpc_context(), &req)
            .await
            .map_err(map_rpc_error)?;
        Ok(())
    }

    async fn pause(&self, id: &str) -> ShimResult<()> {
        let req = api::PauseRequest {
            id: id.to_string(),
            ..Default::default()
        };
        self.task
            .pause(rpc_context(), &req)
            .await
            .map_err(map_rpc_error)?;
        Ok(())
    }

    async fn resume(&self, id: &str) -> ShimResult<()> {
        let req = api::ResumeRequest {
            id: id.to_string(),
            ..Default::default()
        };
        self.task
            .resume(rpc_context(), &req)
            .await
            .map_err(map_rpc_error)?;
        Ok(())
    }

    async fn update(&self, id: &str, resources: &LinuxResources) -> ShimResult<()> {
        let req = api::UpdateTaskRequest {
            id: id.to_string(),
            resources: json_any(LINUX_RESOURCES_TYPE_URL, resources)?,
            ..Default::default()
        };
        self.task
            .update(rpc_context(), &req)
            .await
            .map_err(map_rpc_error)?;
        Ok(())
    }

    async fn stats(&self, id: &str) -> ShimResult<ContainerStats> {
        let req = api::StatsRequest {
            id: id.to_string(),
            ..Default::default()
        };
        let resp = self
            .task
            .stats(rpc_context(), &req)
            .await
            .map_err(map_rpc_error)?;
        decode_stats(id, &resp.stats)
    }

    async fn resize_pty(
        &self,
        id: &str,
        exec_id: Option<&str>,
        width: u32,
        height: u32,
    ) -> ShimResult<()> {
        let req = api::ResizePtyRequest {
            id: id.to_string(),
            exec_id: exec_id.unwrap_or_default().to_string(),
            width,
            height,
            ..Default::default()
        };
        self.task
            .resize_pty(rpc_context(), &req)
            .await
            .map_err(map_rpc_error)?;
        Ok(())
    }

    async fn close_io(&self, id: &str, exec_id: Option<&str>) -> ShimResult<()> {
        let req = api::CloseIORequest {
            id: id.to_string(),
            exec_id: exec_id.unwrap_or_default().to_string(),
            stdin: true,
            ..Default::default()
        };
        self.task
            .close_io(rpc_context(), &req)
            .await
            .map_err(map_rpc_error)?;
        Ok(())
    }

    async fn shutdown(&self, id: &str) -> ShimResult<()> {
        let req = api::ShutdownRequest {
            id: id.to_string(),
            ..Default::default()
        };
        match self.task.shutdown(rpc_context(), &req).await {
            Ok(_) => Ok(()),
            // The shim may exit before its reply is written.
            Err(ttrpc::Error::RemoteClosed) => {
                debug!(id, "shim closed the connection on shutdown");
                Ok(())
            }
            Err(e) => Err(map_rpc_error(e)),
        }
    }
}

/// Dials shims over ttrpc.
#[derive(Debug, Clone, Copy, Default)]
pub struct TtrpcDialer;

#[async_trait]
impl TaskDialer for TtrpcDialer {
    async fn dial(&self, address: &str) -> ShimResult<Arc<dyn TaskService>> {
        let client = TtrpcTaskClient::dial(address).await?;
        debug!(address = %client.address(), "dialed shim");
        Ok(Arc::new(client))
    }
}
