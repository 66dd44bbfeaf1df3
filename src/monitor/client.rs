//! Async client for the pod monitor.
//!
//! Each request opens a fresh unix stream connection, writes one JSON line
//! and reads one JSON line back.
//!
//! ```rust,ignore
//! let client = MonitorClient::new("unix:///run/pods/sb1/monitor.sock");
//! let pid = client.create(request).await?;
//! client.reopen_log("ctr1").await?;
//! ```

use super::protocol::{
    CreateTaskRequest, ExecSyncRequest, OkPayload, Request, ResizePtyRequest, Response,
    ResponseData, TaskRef,
};
use crate::constants::{MAX_RPC_LINE_LEN, RPC_TIMEOUT};
use crate::runtime::ExecSyncResponse;
use crate::shim::{ShimError, ShimResult, UNIX_SCHEME};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tokio::time::timeout;
use tracing::debug;

/// Whole seconds covering `d`; the monitor's timeout granularity.
///
/// Rounds up so a sub-second limit never becomes zero, which the monitor
/// reads as "no timeout".
pub fn timeout_secs(d: Duration) -> u64 {
    d.as_secs() + u64::from(d.subsec_nanos() > 0)
}

/// Client for one pod monitor.
#[derive(Debug, Clone)]
pub struct MonitorClient {
    /// Socket path, without scheme.
    path: PathBuf,
    /// Connect and read timeout.
    timeout: Duration,
}

impl MonitorClient {
    /// Creates a client for `address`, with or without the `unix://` prefix.
    #[must_use]
    pub fn new(address: &str) -> Self {
        let trimmed = address.trim();
        let path = trimmed.strip_prefix(UNIX_SCHEME).unwrap_or(trimmed);
        Self {
            path: PathBuf::from(path),
            timeout: RPC_TIMEOUT,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Sends a request and waits at most `read_timeout` for the answer.
    async fn send_request(
        &self,
        request: &Request,
        read_timeout: Duration,
    ) -> ShimResult<Option<ResponseData>> {
        let stream = timeout(self.timeout, UnixStream::connect(&self.path))
            .await
            .map_err(|_| ShimError::Timeout(self.timeout))?
            .map_err(|e| ShimError::ConnectionFailed {
                address: self.path.display().to_string(),
                reason: e.to_string(),
            })?;

        let (reader, mut writer) = stream.into_split();
        let mut reader = BufReader::new(reader).take(MAX_RPC_LINE_LEN as u64 + 1);

        let request_line = request.to_json_line()?;
        writer.write_all(request_line.as_bytes()).await?;
        writer.flush().await?;

        let mut response_line = String::new();
        let n = timeout(read_timeout, reader.read_line(&mut response_line))
            .await
            .map_err(|_| ShimError::Timeout(read_timeout))??;
        if n == 0 {
            return Err(ShimError::ConnectionClosed);
        }
        if n > MAX_RPC_LINE_LEN {
            return Err(ShimError::ResponseTooLarge(MAX_RPC_LINE_LEN));
        }

        match Response::from_json(&response_line)? {
            Response::Ok(OkPayload { data }) => Ok(data),
            Response::Error(err) => {
                debug!(code = ?err.code, message = %err.message, "pod monitor error");
                Err(ShimError::Remote {
                    code: err.code,
                    message: err.message,
                })
            }
        }
    }

    async fn call(&self, request: &Request) -> ShimResult<Option<ResponseData>> {
        self.send_request(request, self.timeout).await
    }

    /// Sends a request whose reply carries no data.
    async fn call_empty(&self, request: &Request) -> ShimResult<()> {
        self.call(request).await.map(|_| ())
    }

    /// Handshake; returns the monitor PID.
    pub async fn connect(&self) -> ShimResult<i32> {
        match self.call(&Request::Connect).await? {
            Some(ResponseData::Connected { pid, .. }) => Ok(pid),
            other => Err(unexpected("connected", other)),
        }
    }

    /// Creates a container; returns its init PID.
    pub async fn create(&self, req: CreateTaskRequest) -> ShimResult<i32> {
        if req.id.is_empty() {
            return Err(ShimError::InvalidInput("container id is empty".to_string()));
        }
        match self.call(&Request::Create(req)).await? {
            Some(ResponseData::Created { pid }) => Ok(pid),
            other => Err(unexpected("created", other)),
        }
    }

    /// Runs a command to completion inside the monitor.
    ///
    /// The read deadline covers the command's own timeout plus the RPC timeout.
    pub async fn exec_sync(
        &self,
        id: &str,
        command: &[String],
        exec_timeout: Option<Duration>,
        terminal: bool,
    ) -> ShimResult<ExecSyncResponse> {
        let request = Request::ExecSync(ExecSyncRequest {
            id: id.to_string(),
            command: command.to_vec(),
            timeout_secs: exec_timeout.map(timeout_secs).unwrap_or(0),
            terminal,
        });
        let read_timeout = exec_timeout
            .map(|d| Duration::from_secs(timeout_secs(d)) + self.timeout)
            .unwrap_or(Duration::MAX);
        match self.send_request(&request, read_timeout).await? {
            Some(ResponseData::ExecSync {
                exit_code,
                stdout,
                stderr,
                timed_out,
            }) => {
                if timed_out {
                    return Ok(ExecSyncResponse::timed_out());
                }
                Ok(ExecSyncResponse {
                    stdout,
                    stderr,
                    exit_code,
                })
            }
            other => Err(unexpected("exec_sync", other)),
        }
    }

    pub async fn resize_pty(&self, id: &str, width: u16, height: u16) -> ShimResult<()> {
        self.call_empty(&Request::ResizePty(ResizePtyRequest {
            task: TaskRef::task(id),
            width,
            height,
        }))
        .await
    }

    pub async fn reopen_log(&self, id: &str) -> ShimResult<()> {
        self.call_empty(&Request::ReopenLog(TaskRef::task(id)))
            .await
    }

    pub async fn shutdown(&self, id: &str) -> ShimResult<()> {
        self.call_empty(&Request::Shutdown(TaskRef::task(id)))
            .await
    }
}

fn unexpected(expected: &str, got: Option<ResponseData>) -> ShimError {
    ShimError::UnexpectedResponse {
        expected: expected.to_string(),
        got: got.map_or("no data", |d| d.kind()).to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shim::ErrorCode;
    use tokio::net::UnixListener;

    /// Serves one connection, answering with `reply`.
    async fn serve_once(listener: UnixListener, reply: Response) -> Request {
        let (stream, _) = listener.accept().await.unwrap();
        let (rd, mut wr) = stream.into_split();
        let mut line = String::new();
        BufReader::new(rd).read_line(&mut line).await.unwrap();
        wr.write_all(reply.to_json_line().unwrap().as_bytes())
            .await
            .unwrap();
        Request::from_json(&line).unwrap()
    }

    #[test]
    fn test_address_scheme_stripped() {
        let client = MonitorClient::new("unix:///run/monitor.sock\n");
        assert_eq!(client.path(), Path::new("/run/monitor.sock"));
        let client = MonitorClient::new("/run/other.sock");
        assert_eq!(client.path(), Path::new("/run/other.sock"));
    }

    #[test]
    fn test_sub_second_timeout_rounds_up() {
        assert_eq!(timeout_secs(Duration::from_millis(500)), 1);
        assert_eq!(timeout_secs(Duration::from_secs(2)), 2);
        assert_eq!(timeout_secs(Duration::from_millis(2001)), 3);
    }

    #[tokio::test]
    async fn test_exec_sync_sends_rounded_timeout() {
        let tmp = tempfile::TempDir::new().unwrap();
        let sock = tmp.path().join("monitor.sock");
        let listener = UnixListener::bind(&sock).unwrap();
        let server = tokio::spawn(serve_once(
            listener,
            Response::ok_with_data(ResponseData::ExecSync {
                exit_code: 0,
                stdout: b"ok".to_vec(),
                stderr: Vec::new(),
                timed_out: false,
            }),
        ));

        let client = MonitorClient::new(sock.to_str().unwrap());
        let resp = client
            .exec_sync("ctr1", &["true".to_string()], Some(Duration::from_millis(500)), false)
            .await
            .unwrap();
        assert_eq!(resp.stdout, b"ok");

        match server.await.unwrap() {
            Request::ExecSync(req) => assert_eq!(req.timeout_secs, 1),
            other => panic!("unexpected request {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_not_found_maps_to_error() {
        let tmp = tempfile::TempDir::new().unwrap();
        let sock = tmp.path().join("monitor.sock");
        let listener = UnixListener::bind(&sock).unwrap();
        let server = tokio::spawn(serve_once(
            listener,
            Response::error(ErrorCode::NotFound, "container ctr1 not found"),
        ));

        let client = MonitorClient::new(sock.to_str().unwrap());
        let err = client.reopen_log("ctr1").await.unwrap_err();
        assert!(err.is_not_found());
        assert!(matches!(server.await.unwrap(), Request::ReopenLog(_)));
    }

    #[tokio::test]
    async fn test_unexpected_payload() {
        let tmp = tempfile::TempDir::new().unwrap();
        let sock = tmp.path().join("monitor.sock");
        let listener = UnixListener::bind(&sock).unwrap();
        let server = tokio::spawn(serve_once(listener, Response::ok()));

        let client = MonitorClient::new(sock.to_str().unwrap());
        let err = client.connect().await.unwrap_err();
        assert!(matches!(err, ShimError::UnexpectedResponse { .. }));
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_connect_failure() {
        let client = MonitorClient::new("/nonexistent/monitor.sock");
        assert!(matches!(
            client.connect().await,
            Err(ShimError::ConnectionFailed { .. })
        ));
    }
}
