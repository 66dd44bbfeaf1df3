//! FIFO-based IO for shim-hosted tasks.
//!
//! The shim opens the FIFOs by path. The daemon keeps the other ends open
//! read-write, so they never report EOF while the task lives, and relays
//! output into the container log and to attach sessions.
//!
//! Log lines use the CRI format: `<rfc3339nano> <stream> <F|P> <line>`.

use crate::constants::COPY_BUFFER_SIZE;
use crate::shim::ProcessIo;
use chrono::{DateTime, SecondsFormat, Utc};
use std::ffi::CString;
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::unix::pipe;
use tokio::sync::{Mutex, broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Output chunks buffered per attach subscriber before it lags.
const OUTPUT_CHANNEL_CAPACITY: usize = 256;

/// Creates a FIFO, tolerating one that already exists.
pub(crate) fn mkfifo(path: &Path) -> io::Result<()> {
    let c_path = CString::new(path.as_os_str().as_bytes())?;
    // SAFETY: mkfifo(3) with a valid NUL-terminated path.
    if unsafe { libc::mkfifo(c_path.as_ptr(), 0o600) } != 0 {
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::AlreadyExists {
            return Err(err);
        }
    }
    Ok(())
}

/// FIFO paths for one process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct FifoSet {
    pub stdin: Option<PathBuf>,
    pub stdout: PathBuf,
    /// Absent with a terminal: the pty merges both streams.
    pub stderr: Option<PathBuf>,
    pub terminal: bool,
}

impl FifoSet {
    /// Creates `<dir>/<prefix>-{stdin,stdout,stderr}`.
    pub(crate) fn create(dir: &Path, prefix: &str, stdin: bool, terminal: bool) -> io::Result<Self> {
        let path = |stream: &str| dir.join(format!("{}-{}", prefix, stream));
        let set = Self {
            stdin: stdin.then(|| path("stdin")),
            stdout: path("stdout"),
            stderr: (!terminal).then(|| path("stderr")),
            terminal,
        };
        for fifo in set.paths() {
            mkfifo(fifo)?;
        }
        Ok(set)
    }

    fn paths(&self) -> impl Iterator<Item = &PathBuf> {
        self.stdin
            .iter()
            .chain(std::iter::once(&self.stdout))
            .chain(self.stderr.iter())
    }

    /// The wire description handed to the shim.
    pub(crate) fn process_io(&self) -> ProcessIo {
        ProcessIo {
            stdin: self.stdin.clone().unwrap_or_default(),
            stdout: self.stdout.clone(),
            stderr: self.stderr.clone().unwrap_or_default(),
            terminal: self.terminal,
        }
    }

    /// Opens the daemon's ends without waiting for the shim.
    pub(crate) fn open(&self) -> io::Result<OpenFifos> {
        let mut opts = pipe::OpenOptions::new();
        opts.read_write(true);
        Ok(OpenFifos {
            stdin: self
                .stdin
                .as_ref()
                .map(|p| opts.open_sender(p))
                .transpose()?,
            stdout: opts.open_receiver(&self.stdout)?,
            stderr: self
                .stderr
                .as_ref()
                .map(|p| opts.open_receiver(p))
                .transpose()?,
        })
    }

    pub(crate) fn remove(&self) {
        for fifo in self.paths() {
            if let Err(e) = std::fs::remove_file(fifo)
                && e.kind() != io::ErrorKind::NotFound
            {
                debug!(path = %fifo.display(), error = %e, "failed to remove fifo");
            }
        }
    }
}

/// The daemon's ends of a [`FifoSet`].
#[derive(Debug)]
pub(crate) struct OpenFifos {
    pub stdin: Option<pipe::Sender>,
    pub stdout: pipe::Receiver,
    pub stderr: Option<pipe::Receiver>,
}

/// Which stream an output chunk came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum OutputStream {
    Stdout,
    Stderr,
}

impl OutputStream {
    fn as_str(self) -> &'static str {
        match self {
            Self::Stdout => "stdout",
            Self::Stderr => "stderr",
        }
    }
}

/// A chunk of container output.
#[derive(Debug, Clone)]
pub(crate) struct OutputChunk {
    pub stream: OutputStream,
    pub data: Vec<u8>,
}

/// Formats `data` as CRI log lines. A trailing fragment without newline is
/// tagged partial.
pub(crate) fn format_cri_log(ts: DateTime<Utc>, stream: OutputStream, data: &[u8]) -> Vec<u8> {
    let ts = ts.to_rfc3339_opts(SecondsFormat::Nanos, true);
    let mut out = Vec::with_capacity(data.len() + 64);
    let mut rest = data;
    while !rest.is_empty() {
        let (line, tag, next) = match rest.iter().position(|&b| b == b'\n') {
            Some(i) => (&rest[..i], "F", &rest[i + 1..]),
            None => (rest, "P", &rest[rest.len()..]),
        };
        out.extend_from_slice(format!("{} {} {} ", ts, stream.as_str(), tag).as_bytes());
        out.extend_from_slice(line);
        out.push(b'\n');
        rest = next;
    }
    out
}

type ReopenAck = oneshot::Sender<io::Result<()>>;

/// Live IO of a shim-hosted container: log relay plus attach fan-out.
#[derive(Debug)]
pub(crate) struct ContainerIo {
    fifos: FifoSet,
    stdin: Mutex<Option<pipe::Sender>>,
    output: broadcast::Sender<OutputChunk>,
    reopen: mpsc::UnboundedSender<ReopenAck>,
    exited: CancellationToken,
    relay: JoinHandle<()>,
}

impl ContainerIo {
    /// Opens `fifos` and starts relaying output into `log_path`.
    pub(crate) fn start(id: &str, fifos: FifoSet, log_path: PathBuf) -> io::Result<Self> {
        let open = fifos.open()?;
        let (output, _) = broadcast::channel(OUTPUT_CHANNEL_CAPACITY);
        let (reopen, reopen_rx) = mpsc::unbounded_channel();
        let relay = tokio::spawn(relay_output(
            id.to_string(),
            open.stdout,
            open.stderr,
            log_path,
            output.clone(),
            reopen_rx,
        ));
        Ok(Self {
            fifos,
            stdin: Mutex::new(open.stdin),
            output,
            reopen,
            exited: CancellationToken::new(),
            relay,
        })
    }

    pub(crate) fn fifos(&self) -> &FifoSet {
        &self.fifos
    }

    pub(crate) fn subscribe(&self) -> broadcast::Receiver<OutputChunk> {
        self.output.subscribe()
    }

    /// Container stdin, shared by attach sessions one at a time.
    pub(crate) fn stdin(&self) -> &Mutex<Option<pipe::Sender>> {
        &self.stdin
    }

    /// Cancelled once the task exited.
    pub(crate) fn exited(&self) -> CancellationToken {
        self.exited.clone()
    }

    pub(crate) fn mark_exited(&self) {
        self.exited.cancel();
    }

    /// Closes and reopens the log file, e.g. after rotation.
    pub(crate) async fn reopen_log(&self) -> io::Result<()> {
        let (ack, done) = oneshot::channel();
        self.reopen
            .send(ack)
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "log relay stopped"))?;
        done.await
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "log relay stopped"))?
    }
}

impl Drop for ContainerIo {
    fn drop(&mut self) {
        self.exited.cancel();
        self.relay.abort();
        self.fifos.remove();
    }
}

async fn open_log(path: &Path) -> io::Result<tokio::fs::File> {
    tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await
}

async fn write_log(file: &mut tokio::fs::File, data: &[u8]) -> io::Result<()> {
    file.write_all(data).await?;
    file.flush().await
}

async fn read_some(rx: &mut Option<pipe::Receiver>, buf: &mut [u8]) -> io::Result<usize> {
    match rx {
        Some(rx) => rx.read(buf).await,
        None => std::future::pending().await,
    }
}

async fn relay_output(
    id: String,
    stdout: pipe::Receiver,
    stderr: Option<pipe::Receiver>,
    log_path: PathBuf,
    output: broadcast::Sender<OutputChunk>,
    mut reopen: mpsc::UnboundedReceiver<ReopenAck>,
) {
    let mut log = match open_log(&log_path).await {
        Ok(f) => Some(f),
        Err(e) => {
            warn!(container = %id, log = %log_path.display(), error = %e, "failed to open container log");
            None
        }
    };
    let mut stdout = Some(stdout);
    let mut stderr = stderr;
    let mut out_buf = vec![0u8; COPY_BUFFER_SIZE];
    let mut err_buf = vec![0u8; COPY_BUFFER_SIZE];

    loop {
        let (stream, read) = tokio::select! {
            res = read_some(&mut stdout, &mut out_buf) => (OutputStream::Stdout, res),
            res = read_some(&mut stderr, &mut err_buf) => (OutputStream::Stderr, res),
            Some(ack) = reopen.recv() => {
                let res = open_log(&log_path).await.map(|f| log = Some(f));
                let _ = ack.send(res);
                continue;
            }
        };
        let n = match read {
            Ok(0) | Err(_) => {
                match stream {
                    OutputStream::Stdout => stdout = None,
                    OutputStream::Stderr => stderr = None,
                }
                if stdout.is_none() && stderr.is_none() {
                    break;
                }
                continue;
            }
            Ok(n) => n,
        };
        let data = match stream {
            OutputStream::Stdout => out_buf[..n].to_vec(),
            OutputStream::Stderr => err_buf[..n].to_vec(),
        };
        if let Some(file) = log.as_mut() {
            let line = format_cri_log(Utc::now(), stream, &data);
            if let Err(e) = write_log(file, &line).await {
                warn!(container = %id, error = %e, "failed to write container log");
            }
        }
        let _ = output.send(OutputChunk { stream, data });
    }
    debug!(container = %id, "output relay finished");
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_cri_log_format() {
        let ts = Utc.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).unwrap();
        let out = format_cri_log(ts, OutputStream::Stdout, b"one\ntwo");
        assert_eq!(
            String::from_utf8(out).unwrap(),
            "2024-01-02T03:04:05.000000000Z stdout F one\n2024-01-02T03:04:05.000000000Z stdout P two\n"
        );
    }

    #[test]
    fn test_fifo_set_paths() {
        let tmp = tempfile::TempDir::new().unwrap();
        let set = FifoSet::create(tmp.path(), "ctr", true, true).unwrap();
        assert!(set.stderr.is_none());
        let io = set.process_io();
        assert!(io.terminal);
        assert_eq!(io.stdin, tmp.path().join("ctr-stdin"));
        assert!(io.stderr.as_os_str().is_empty());
        set.remove();
        assert!(!tmp.path().join("ctr-stdout").exists());
    }

    #[tokio::test]
    async fn test_relay_writes_log_and_broadcasts() {
        let tmp = tempfile::TempDir::new().unwrap();
        let set = FifoSet::create(tmp.path(), "ctr", false, false).unwrap();
        let log_path = tmp.path().join("ctr.log");
        let io = ContainerIo::start("ctr", set.clone(), log_path.clone()).unwrap();
        let mut rx = io.subscribe();

        let mut writer = pipe::OpenOptions::new().open_sender(&set.stdout).unwrap();
        writer.write_all(b"hello\n").await.unwrap();

        let chunk = tokio::time::timeout(std::time::Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(chunk.stream, OutputStream::Stdout);
        assert_eq!(chunk.data, b"hello\n");

        let log = std::fs::read_to_string(&log_path).unwrap();
        assert!(log.ends_with(" stdout F hello\n"));
    }
}
