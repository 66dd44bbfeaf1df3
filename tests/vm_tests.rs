//! Tests for the shim-backed VM runtime.
//!
//! An in-process fake implements the task service and a fake dialer hands
//! it out for any address. Sibling containers carry an address in their
//! bundle, the way they look after a daemon restart. Infra containers
//! launch a shell script in place of the shim binary.

use async_trait::async_trait;
use magikoci::shim::{
    CreateTask, ErrorCode, ExitStatus, ProcessIo, ShimError, ShimResult, TaskDialer, TaskService,
    TaskState, TaskStatus,
};
use magikoci::{
    Config, Container, ContainerConfig, ContainerStats, ContainerStatus, Error, LinuxResources,
    Metrics, RuntimeHandler, RuntimeImpl, RuntimeType, Signal, StreamOptions, VmRuntime,
};
use std::collections::HashMap;
use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::{Duration, Instant};
use tempfile::TempDir;
use tokio::sync::watch;

const SANDBOX: &str = "sb";
const SHIM_ADDRESS: &str = "unix:///run/fake-shim.sock";
const SIBLING_ADDRESS: &str = "unix:///run/sibling-shim.sock";

// =============================================================================
// Fake Shim
// =============================================================================

fn not_found(what: &str) -> ShimError {
    ShimError::Remote {
        code: ErrorCode::NotFound,
        message: format!("{} not found", what),
    }
}

struct FakeTask {
    status: TaskStatus,
    exit_status: i32,
    kill_not_found: bool,
    /// Exec waits never return, even after a kill.
    exec_wait_hangs: bool,
    calls: Mutex<Vec<String>>,
    signals: Mutex<Vec<(Option<String>, i32)>>,
    created: Mutex<Vec<CreateTask>>,
    execs: Mutex<HashMap<String, (ProcessIo, Vec<String>)>>,
    init_exited: watch::Sender<bool>,
    exec_exits: watch::Sender<HashMap<String, i32>>,
}

impl FakeTask {
    fn new(status: TaskStatus, exit_status: i32) -> Self {
        Self {
            status,
            exit_status,
            kill_not_found: false,
            exec_wait_hangs: false,
            calls: Mutex::new(Vec::new()),
            signals: Mutex::new(Vec::new()),
            created: Mutex::new(Vec::new()),
            execs: Mutex::new(HashMap::new()),
            init_exited: watch::channel(false).0,
            exec_exits: watch::channel(HashMap::new()).0,
        }
    }

    fn record(&self, call: &str) {
        self.calls.lock().unwrap().push(call.to_string());
    }

    fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn exit_init(&self) {
        self.init_exited.send_replace(true);
    }

    fn finish_exec(&self, exec_id: &str, code: i32) {
        self.exec_exits.send_modify(|m| {
            m.insert(exec_id.to_string(), code);
        });
    }

    /// Runs an exec: `sleep` blocks until killed, `false` fails, anything
    /// else echoes its arguments to stdout.
    fn run_exec(&self, exec_id: &str) {
        let (io, args) = self.execs.lock().unwrap()[exec_id].clone();
        match args.first().map(String::as_str) {
            Some("sleep") => {}
            Some("false") => self.finish_exec(exec_id, 1),
            _ => {
                let mut out = std::fs::OpenOptions::new()
                    .write(true)
                    .open(&io.stdout)
                    .unwrap();
                out.write_all(args.join(" ").as_bytes()).unwrap();
                self.finish_exec(exec_id, 0);
            }
        }
    }
}

#[async_trait]
impl TaskService for FakeTask {
    async fn connect(&self, _id: &str) -> ShimResult<u32> {
        self.record("connect");
        Ok(4242)
    }

    async fn create(&self, req: CreateTask) -> ShimResult<i32> {
        self.record("create");
        self.created.lock().unwrap().push(req);
        Ok(4343)
    }

    async fn start(&self, _id: &str, exec_id: Option<&str>) -> ShimResult<i32> {
        self.record("start");
        if let Some(exec_id) = exec_id {
            self.run_exec(exec_id);
        }
        Ok(4444)
    }

    async fn state(&self, id: &str) -> ShimResult<TaskState> {
        Ok(TaskState {
            id: id.to_string(),
            pid: 42,
            status: self.status,
            exit_status: self.exit_status,
            exited_at: None,
            io: ProcessIo::default(),
        })
    }

    async fn kill(
        &self,
        _id: &str,
        exec_id: Option<&str>,
        signal: i32,
        _all: bool,
    ) -> ShimResult<()> {
        self.signals
            .lock()
            .unwrap()
            .push((exec_id.map(str::to_string), signal));
        if self.kill_not_found {
            return Err(not_found("task"));
        }
        match exec_id {
            Some(exec_id) => self.finish_exec(exec_id, 128 + signal),
            None if signal != 0 => self.exit_init(),
            None => {}
        }
        Ok(())
    }

    async fn wait(&self, _id: &str, exec_id: Option<&str>) -> ShimResult<ExitStatus> {
        let code = match exec_id {
            Some(_) if self.exec_wait_hangs => std::future::pending::<i32>().await,
            Some(exec_id) => {
                let mut exits = self.exec_exits.subscribe();
                let exits = exits
                    .wait_for(|m| m.contains_key(exec_id))
                    .await
                    .map_err(|_| ShimError::ConnectionClosed)?;
                exits[exec_id]
            }
            None => {
                let mut exited = self.init_exited.subscribe();
                let _ = exited.wait_for(|e| *e).await;
                self.exit_status
            }
        };
        Ok(ExitStatus {
            code,
            exited_at: None,
        })
    }

    async fn delete(&self, _id: &str, exec_id: Option<&str>) -> ShimResult<()> {
        self.record("delete");
        match exec_id {
            Some(_) => Ok(()),
            None => Err(not_found("task")),
        }
    }

    async fn exec(
        &self,
        _id: &str,
        exec_id: &str,
        io: ProcessIo,
        spec: &serde_json::Value,
    ) -> ShimResult<()> {
        self.record("exec");
        let args: Vec<String> = serde_json::from_value(spec["args"].clone()).unwrap();
        self.execs
            .lock()
            .unwrap()
            .insert(exec_id.to_string(), (io, args));
        Ok(())
    }

    async fn pause(&self, _id: &str) -> ShimResult<()> {
        self.record("pause");
        Ok(())
    }

    async fn resume(&self, _id: &str) -> ShimResult<()> {
        self.record("resume");
        Ok(())
    }

    async fn update(&self, _id: &str, _resources: &LinuxResources) -> ShimResult<()> {
        self.record("update");
        Ok(())
    }

    async fn stats(&self, id: &str) -> ShimResult<ContainerStats> {
        Ok(ContainerStats::empty(id))
    }

    async fn resize_pty(
        &self,
        _id: &str,
        _exec_id: Option<&str>,
        _width: u32,
        _height: u32,
    ) -> ShimResult<()> {
        Ok(())
    }

    async fn close_io(&self, _id: &str, _exec_id: Option<&str>) -> ShimResult<()> {
        Ok(())
    }

    async fn shutdown(&self, _id: &str) -> ShimResult<()> {
        self.record("shutdown");
        Ok(())
    }
}

/// Hands out the fake for every address; fails like a dead socket when
/// there is none.
struct FakeDialer {
    task: Option<Arc<FakeTask>>,
    dialed: Mutex<Vec<String>>,
}

#[async_trait]
impl TaskDialer for FakeDialer {
    async fn dial(&self, address: &str) -> ShimResult<Arc<dyn TaskService>> {
        self.dialed.lock().unwrap().push(address.to_string());
        match &self.task {
            Some(task) => Ok(Arc::clone(task) as Arc<dyn TaskService>),
            None => Err(ShimError::ConnectionFailed {
                address: address.to_string(),
                reason: "connection refused".to_string(),
            }),
        }
    }
}

/// Collects exec output.
#[derive(Clone, Default)]
struct Sink(Arc<Mutex<Vec<u8>>>);

impl tokio::io::AsyncWrite for Sink {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

// =============================================================================
// Fixtures
// =============================================================================

fn write_script(path: &Path, body: &str) {
    std::fs::write(path, body).unwrap();
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755)).unwrap();
}

struct Fixture {
    tmp: TempDir,
    dialer: Arc<FakeDialer>,
    runtime: VmRuntime,
    container: Arc<Container>,
}

impl Fixture {
    /// A sibling container `ctr`; `task` of `None` means no shim answers.
    fn new(task: Option<Arc<FakeTask>>) -> Self {
        let fx = Self::build("ctr", task);
        fx.point_at(SIBLING_ADDRESS);
        fx
    }

    /// The sandbox's infra container, with a fake shim binary on disk.
    fn infra(task: Arc<FakeTask>) -> Self {
        Self::build(SANDBOX, Some(task))
    }

    fn build(id: &str, task: Option<Arc<FakeTask>>) -> Self {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path();
        std::fs::create_dir_all(root.join("bundle")).unwrap();
        std::fs::create_dir_all(root.join("bin")).unwrap();
        let shim = root.join("bin").join("containerd-shim-fake-v2");
        write_script(
            &shim,
            &format!(
                "#!/bin/sh\necho \"$@\" > shim-args\npwd > shim-cwd\necho 'shim booting' > log\necho {}\n",
                SHIM_ADDRESS
            ),
        );
        let handler = RuntimeHandler {
            runtime_path: shim,
            runtime_type: RuntimeType::Vm,
            ..Default::default()
        };
        let config = Config {
            container_exits_dir: root.join("exits"),
            ..Default::default()
        };
        let dialer = Arc::new(FakeDialer {
            task,
            dialed: Mutex::new(Vec::new()),
        });
        let runtime = VmRuntime::with_dialer(
            "fake",
            &handler,
            Arc::new(config),
            Arc::new(Metrics::new()),
            Arc::clone(&dialer) as Arc<dyn TaskDialer>,
        );
        let container = Arc::new(
            Container::new(ContainerConfig {
                id: id.to_string(),
                name: id.to_string(),
                sandbox: SANDBOX.to_string(),
                bundle_path: root.join("bundle"),
                dir: root.join("bundle"),
                log_path: root.join("ctr.log"),
                ..Default::default()
            })
            .unwrap(),
        );
        Self {
            tmp,
            dialer,
            runtime,
            container,
        }
    }

    fn point_at(&self, address: &str) {
        std::fs::write(self.bundle().join("address"), address).unwrap();
    }

    fn bundle(&self) -> PathBuf {
        self.tmp.path().join("bundle")
    }

    fn exit_file(&self) -> PathBuf {
        self.tmp.path().join("exits").join(self.container.id())
    }
}

async fn eventually(what: &str, mut cond: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !cond() {
        assert!(Instant::now() < deadline, "{} never happened", what);
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

fn cmd(args: &[&str]) -> Vec<String> {
    args.iter().map(|a| a.to_string()).collect()
}

// =============================================================================
// Create
// =============================================================================

#[tokio::test]
async fn test_create_launches_shim_and_persists_address() {
    let task = Arc::new(FakeTask::new(TaskStatus::Created, 0));
    let fx = Fixture::infra(Arc::clone(&task));

    fx.runtime.create_container(&fx.container, "").await.unwrap();

    assert_eq!(
        std::fs::read_to_string(fx.bundle().join("address")).unwrap(),
        SHIM_ADDRESS
    );
    assert_eq!(*fx.dialer.dialed.lock().unwrap(), vec![SHIM_ADDRESS.to_string()]);
    assert!(fx.runtime.is_connected());

    let args = std::fs::read_to_string(fx.bundle().join("shim-args")).unwrap();
    assert!(args.starts_with("-namespace default -address  -publish-binary /"));
    assert!(args.trim_end().ends_with("-id sb start"));
    let cwd = std::fs::read_to_string(fx.bundle().join("shim-cwd")).unwrap();
    assert_eq!(
        Path::new(cwd.trim()).canonicalize().unwrap(),
        fx.bundle().canonicalize().unwrap()
    );

    let created = task.created.lock().unwrap().clone();
    assert_eq!(created.len(), 1);
    assert_eq!(created[0].id, SANDBOX);
    assert_eq!(created[0].bundle, fx.bundle());
    assert!(created[0].io.stdout.starts_with(fx.bundle()));
    assert_eq!(task.calls(), vec!["create", "connect"]);

    let state = fx.container.state().unwrap();
    assert_eq!(state.status, ContainerStatus::Created);
    assert_eq!(state.pid, 4343);
}

#[tokio::test]
async fn test_exit_watcher_writes_exit_file() {
    let task = Arc::new(FakeTask::new(TaskStatus::Running, 7));
    let fx = Fixture::infra(Arc::clone(&task));
    fx.runtime.create_container(&fx.container, "").await.unwrap();
    assert!(!fx.exit_file().exists());

    task.exit_init();
    let exit_file = fx.exit_file();
    eventually("exit file", || exit_file.exists()).await;
    assert_eq!(std::fs::read_to_string(&exit_file).unwrap(), "7");

    eventually("exit record", || {
        fx.container.status().unwrap() == ContainerStatus::Stopped
    })
    .await;
    assert_eq!(fx.container.state().unwrap().exit_code, Some(7));
}

#[tokio::test]
async fn test_sibling_create_reuses_shim() {
    let task = Arc::new(FakeTask::new(TaskStatus::Created, 0));
    let fx = Fixture::new(Some(Arc::clone(&task)));

    fx.runtime.create_container(&fx.container, "").await.unwrap();

    assert!(!fx.bundle().join("shim-args").exists());
    assert_eq!(task.calls(), vec!["create"]);
    assert_eq!(
        std::fs::read_to_string(fx.bundle().join("address")).unwrap(),
        SIBLING_ADDRESS
    );
}

#[tokio::test]
async fn test_delete_infra_shuts_shim_down() {
    let task = Arc::new(FakeTask::new(TaskStatus::Stopped, 0));
    let fx = Fixture::infra(Arc::clone(&task));
    fx.runtime.create_container(&fx.container, "").await.unwrap();

    fx.runtime.delete_container(&fx.container).await.unwrap();

    assert_eq!(
        task.calls(),
        vec!["create", "connect", "delete", "shutdown"]
    );
    assert!(!fx.runtime.is_connected());
}

// =============================================================================
// Signals
// =============================================================================

#[tokio::test]
async fn test_signal_without_shim_is_not_found() {
    let fx = Fixture::new(None);
    std::fs::remove_file(fx.bundle().join("address")).unwrap();
    let err = fx
        .runtime
        .signal_container(&fx.container, Signal::LIVENESS)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::ProcessNotFound));
    assert!(!fx.runtime.is_connected());
    assert!(fx.dialer.dialed.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_signal_reaches_shim() {
    let task = Arc::new(FakeTask::new(TaskStatus::Running, 0));
    let fx = Fixture::new(Some(Arc::clone(&task)));

    fx.runtime
        .signal_container(&fx.container, Signal::LIVENESS)
        .await
        .unwrap();
    assert!(fx.runtime.is_connected());
    assert_eq!(*task.signals.lock().unwrap(), vec![(None, 0)]);
    assert_eq!(
        *fx.dialer.dialed.lock().unwrap(),
        vec![SIBLING_ADDRESS.to_string()]
    );
}

#[tokio::test]
async fn test_signal_to_gone_task_is_not_found() {
    let mut task = FakeTask::new(TaskStatus::Stopped, 0);
    task.kill_not_found = true;
    let fx = Fixture::new(Some(Arc::new(task)));

    let err = fx
        .runtime
        .signal_container(&fx.container, Signal::LIVENESS)
        .await
        .unwrap_err();
    assert!(err.is_process_gone());
}

#[tokio::test]
async fn test_signal_to_dead_shim_is_not_found() {
    let fx = Fixture::new(None);
    let err = fx
        .runtime
        .signal_container(&fx.container, Signal::LIVENESS)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::ProcessNotFound));
}

// =============================================================================
// Status
// =============================================================================

#[tokio::test]
async fn test_status_running() {
    let fx = Fixture::new(Some(Arc::new(FakeTask::new(TaskStatus::Running, 0))));
    fx.runtime
        .update_container_status(&fx.container)
        .await
        .unwrap();

    let state = fx.container.state().unwrap();
    assert_eq!(state.status, ContainerStatus::Running);
    assert_eq!(state.pid, 42);
}

#[tokio::test]
async fn test_status_stopped_records_exit() {
    let fx = Fixture::new(Some(Arc::new(FakeTask::new(TaskStatus::Stopped, 3))));
    fx.runtime
        .update_container_status(&fx.container)
        .await
        .unwrap();

    let state = fx.container.state().unwrap();
    assert_eq!(state.status, ContainerStatus::Stopped);
    assert_eq!(state.exit_code, Some(3));
    assert_eq!(state.pid, 0);
    assert!(state.finished.is_some());
}

#[tokio::test]
async fn test_status_paused_while_pausing() {
    let fx = Fixture::new(Some(Arc::new(FakeTask::new(TaskStatus::Pausing, 0))));
    fx.container
        .update_state(|s| s.transition(ContainerStatus::Running))
        .unwrap();
    fx.runtime
        .update_container_status(&fx.container)
        .await
        .unwrap();
    assert_eq!(fx.container.status().unwrap(), ContainerStatus::Paused);
}

#[tokio::test]
async fn test_status_with_unreachable_shim_uses_exit_file() {
    let fx = Fixture::new(None);
    std::fs::create_dir_all(fx.tmp.path().join("exits")).unwrap();
    std::fs::write(fx.exit_file(), "137").unwrap();

    fx.runtime
        .update_container_status(&fx.container)
        .await
        .unwrap();

    let state = fx.container.state().unwrap();
    assert_eq!(state.status, ContainerStatus::Stopped);
    assert_eq!(state.exit_code, Some(137));
}

// =============================================================================
// Stop / Delete / Pause
// =============================================================================

#[tokio::test]
async fn test_stop_waits_for_task_exit() {
    let task = Arc::new(FakeTask::new(TaskStatus::Running, 143));
    let fx = Fixture::new(Some(Arc::clone(&task)));

    tokio::time::timeout(
        Duration::from_secs(10),
        fx.runtime
            .stop_container(&fx.container, Duration::from_secs(5)),
    )
    .await
    .unwrap()
    .unwrap();

    assert_eq!(*task.signals.lock().unwrap(), vec![(None, libc::SIGTERM)]);
    let ctr = fx.container.state().unwrap();
    assert_eq!(ctr.status, ContainerStatus::Stopped);
    assert_eq!(ctr.exit_code, Some(143));
    assert!(!fx.container.is_stopping());
}

#[tokio::test]
async fn test_stop_gone_task_marks_stopped() {
    let mut task = FakeTask::new(TaskStatus::Stopped, 0);
    task.kill_not_found = true;
    let fx = Fixture::new(Some(Arc::new(task)));

    fx.runtime
        .stop_container(&fx.container, Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(fx.container.status().unwrap(), ContainerStatus::Stopped);
}

#[tokio::test]
async fn test_delete_missing_task_succeeds() {
    let fx = Fixture::new(Some(Arc::new(FakeTask::new(TaskStatus::Stopped, 0))));
    fx.runtime.delete_container(&fx.container).await.unwrap();
}

#[tokio::test]
async fn test_pause_and_unpause() {
    let task = Arc::new(FakeTask::new(TaskStatus::Running, 0));
    let fx = Fixture::new(Some(Arc::clone(&task)));
    fx.container
        .update_state(|s| s.transition(ContainerStatus::Running))
        .unwrap();

    fx.runtime.pause_container(&fx.container).await.unwrap();
    assert_eq!(fx.container.status().unwrap(), ContainerStatus::Paused);
    fx.runtime.unpause_container(&fx.container).await.unwrap();
    assert_eq!(fx.container.status().unwrap(), ContainerStatus::Running);
    assert_eq!(task.calls(), vec!["pause", "resume"]);
}

// =============================================================================
// Exec
// =============================================================================

#[tokio::test]
async fn test_exec_sync_collects_output() {
    let task = Arc::new(FakeTask::new(TaskStatus::Running, 0));
    let fx = Fixture::new(Some(Arc::clone(&task)));
    let resp = fx
        .runtime
        .exec_sync_container(&fx.container, &cmd(&["echo", "hi"]), Some(Duration::from_secs(5)))
        .await
        .unwrap();
    assert_eq!(resp.exit_code, 0);
    assert_eq!(resp.stdout, b"echo hi");
    assert!(resp.stderr.is_empty());
    assert_eq!(task.calls(), vec!["exec", "start", "delete"]);
}

#[tokio::test]
async fn test_exec_sync_reports_exit_code() {
    let fx = Fixture::new(Some(Arc::new(FakeTask::new(TaskStatus::Running, 0))));
    let resp = fx
        .runtime
        .exec_sync_container(&fx.container, &cmd(&["false"]), None)
        .await
        .unwrap();
    assert_eq!(resp.exit_code, 1);
}

#[tokio::test]
async fn test_exec_sync_timeout_kills_exec() {
    let mut task = FakeTask::new(TaskStatus::Running, 0);
    task.exec_wait_hangs = true;
    let task = Arc::new(task);
    let fx = Fixture::new(Some(Arc::clone(&task)));

    let started = Instant::now();
    let resp = fx
        .runtime
        .exec_sync_container(
            &fx.container,
            &cmd(&["sleep", "10"]),
            Some(Duration::from_millis(500)),
        )
        .await
        .unwrap();

    assert!(started.elapsed() < Duration::from_secs(3));
    assert_eq!(resp.exit_code, -1);
    assert_eq!(resp.stderr, b"command timed out");
    let signals = task.signals.lock().unwrap().clone();
    assert_eq!(signals.len(), 1);
    assert!(signals[0].0.is_some());
    assert_eq!(signals[0].1, libc::SIGKILL);
}

#[tokio::test]
async fn test_exec_sync_empty_command() {
    let fx = Fixture::new(Some(Arc::new(FakeTask::new(TaskStatus::Running, 0))));
    let err = fx
        .runtime
        .exec_sync_container(&fx.container, &[], None)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::ExecFailed { .. }));
}

#[tokio::test]
async fn test_exec_streams_output() {
    let task = Arc::new(FakeTask::new(TaskStatus::Running, 0));
    let fx = Fixture::new(Some(Arc::clone(&task)));
    let sink = Sink::default();

    fx.runtime
        .exec_container(
            &fx.container,
            &cmd(&["echo", "streamed"]),
            StreamOptions {
                stdout: Some(Box::new(sink.clone())),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    assert_eq!(*sink.0.lock().unwrap(), b"echo streamed");
    assert_eq!(task.calls(), vec!["exec", "start", "delete"]);
    let leftover = std::fs::read_dir(fx.bundle())
        .unwrap()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_name().to_string_lossy().starts_with("exec-"))
        .count();
    assert_eq!(leftover, 0);
}

#[tokio::test]
async fn test_exec_failure_is_reported() {
    let fx = Fixture::new(Some(Arc::new(FakeTask::new(TaskStatus::Running, 0))));
    let err = fx
        .runtime
        .exec_container(&fx.container, &cmd(&["false"]), StreamOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::ExecFailed { .. }));
}
