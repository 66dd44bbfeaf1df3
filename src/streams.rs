//! IO plumbing shared by attach, exec and port-forward.

use crate::constants::{COPY_BUFFER_SIZE, PORT_FORWARD_GRACE};
use crate::error::{Error, Result};
use std::io;
use std::os::fd::{FromRawFd, OwnedFd};
use std::path::Path;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Attach frame tag for stdout.
pub const ATTACH_PIPE_STDOUT: u8 = 1;

/// Attach frame tag for stderr.
pub const ATTACH_PIPE_STDERR: u8 = 2;

/// One attach frame: a tag byte plus up to 8 KiB of data.
const ATTACH_FRAME_SIZE: usize = 8192 + 1;

/// Caller-supplied input stream.
pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;

/// Caller-supplied output stream.
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Bidirectional stream handed to port-forward.
pub trait DuplexStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> DuplexStream for T {}

/// Terminal dimensions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TerminalSize {
    pub width: u16,
    pub height: u16,
}

/// Streams for an interactive exec or attach session.
#[derive(Default)]
pub struct StreamOptions {
    pub stdin: Option<BoxedReader>,
    pub stdout: Option<BoxedWriter>,
    pub stderr: Option<BoxedWriter>,
    pub tty: bool,
    pub resize: Option<mpsc::Receiver<TerminalSize>>,
}

impl std::fmt::Debug for StreamOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamOptions")
            .field("stdin", &self.stdin.is_some())
            .field("stdout", &self.stdout.is_some())
            .field("stderr", &self.stderr.is_some())
            .field("tty", &self.tty)
            .finish()
    }
}

// =============================================================================
// Attach
// =============================================================================

/// Connects a `SOCK_SEQPACKET` unix socket, the framing the monitor uses
/// for attach.
pub fn connect_seqpacket(path: &Path) -> io::Result<tokio::net::UnixStream> {
    use std::os::unix::ffi::OsStrExt;

    let bytes = path.as_os_str().as_bytes();
    // SAFETY: sockaddr_un is plain old data; zeroed is a valid value.
    let mut addr: libc::sockaddr_un = unsafe { std::mem::zeroed() };
    if bytes.len() >= addr.sun_path.len() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("socket path too long: {}", path.display()),
        ));
    }
    addr.sun_family = libc::AF_UNIX as libc::sa_family_t;
    for (dst, src) in addr.sun_path.iter_mut().zip(bytes) {
        *dst = *src as libc::c_char;
    }

    // SAFETY: socket(2) returns a new fd or -1.
    let fd = unsafe {
        libc::socket(
            libc::AF_UNIX,
            libc::SOCK_SEQPACKET | libc::SOCK_CLOEXEC | libc::SOCK_NONBLOCK,
            0,
        )
    };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: fd was just created and is exclusively owned here.
    let owned = unsafe { OwnedFd::from_raw_fd(fd) };
    let len = std::mem::size_of::<libc::sockaddr_un>() as libc::socklen_t;
    // SAFETY: addr is a fully initialised sockaddr_un of `len` bytes.
    let ret = unsafe {
        libc::connect(
            fd,
            &addr as *const libc::sockaddr_un as *const libc::sockaddr,
            len,
        )
    };
    if ret < 0 {
        let err = io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::EINPROGRESS) {
            return Err(err);
        }
    }
    tokio::net::UnixStream::from_std(std::os::unix::net::UnixStream::from(owned))
}

/// Splits tagged attach frames onto stdout and stderr until EOF.
///
/// Frames with an unknown tag are dropped. Output for a missing writer is
/// discarded.
pub async fn demux_attach_output<R>(
    mut src: R,
    stdout: &mut Option<BoxedWriter>,
    stderr: &mut Option<BoxedWriter>,
) -> io::Result<()>
where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; ATTACH_FRAME_SIZE];
    loop {
        let n = src.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        let target = match buf[0] {
            ATTACH_PIPE_STDOUT => stdout.as_mut(),
            ATTACH_PIPE_STDERR => stderr.as_mut(),
            tag => {
                debug!(tag, "dropping attach frame with unknown tag");
                continue;
            }
        };
        if let Some(w) = target {
            w.write_all(&buf[1..n]).await?;
            w.flush().await?;
        }
    }
    for w in [stdout.as_mut(), stderr.as_mut()].into_iter().flatten() {
        let _ = w.shutdown().await;
    }
    Ok(())
}

/// How an input copy ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CopyOutcome {
    /// Source reached EOF after this many bytes.
    Eof(u64),
    /// The detach sequence was read.
    Detached,
}

/// Copies `src` into `dst` until EOF or until `detach_keys` appear.
///
/// The detach sequence itself is never forwarded. A partial match that
/// turns out not to be the sequence is forwarded unchanged.
pub async fn copy_detachable<R, W>(
    mut src: R,
    mut dst: W,
    detach_keys: &[u8],
) -> io::Result<CopyOutcome>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; COPY_BUFFER_SIZE];
    let mut matched = 0usize;
    let mut total = 0u64;
    loop {
        let n = src.read(&mut buf).await?;
        if n == 0 {
            if matched > 0 {
                dst.write_all(&detach_keys[..matched]).await?;
                total += matched as u64;
            }
            return Ok(CopyOutcome::Eof(total));
        }
        let mut out = Vec::with_capacity(n);
        for &b in &buf[..n] {
            if !detach_keys.is_empty() && b == detach_keys[matched] {
                matched += 1;
                if matched == detach_keys.len() {
                    dst.write_all(&out).await?;
                    return Ok(CopyOutcome::Detached);
                }
                continue;
            }
            if matched > 0 {
                out.extend_from_slice(&detach_keys[..matched]);
                matched = 0;
                if b == detach_keys[0] {
                    matched = 1;
                    continue;
                }
            }
            out.push(b);
        }
        dst.write_all(&out).await?;
        total += out.len() as u64;
    }
}

/// Reads `src` to EOF, keeping at most `limit` bytes.
///
/// Excess input is still drained so the writer never blocks on a full pipe.
pub async fn read_limited<R>(mut src: R, limit: usize) -> io::Result<Vec<u8>>
where
    R: AsyncRead + Unpin,
{
    let mut out = Vec::new();
    let mut buf = vec![0u8; COPY_BUFFER_SIZE];
    loop {
        let n = src.read(&mut buf).await?;
        if n == 0 {
            return Ok(out);
        }
        let room = limit.saturating_sub(out.len());
        out.extend_from_slice(&buf[..n.min(room)]);
    }
}

// =============================================================================
// Terminal
// =============================================================================

/// Pseudo-terminal pair for a tty exec.
#[derive(Debug)]
pub struct Pty {
    /// Controlling side, kept by the daemon.
    pub master: OwnedFd,
    /// Terminal side, handed to the child as its stdio.
    pub slave: std::fs::File,
}

/// Opens a new pseudo-terminal.
pub fn open_pty() -> io::Result<Pty> {
    use std::ffi::{CStr, OsStr};
    use std::os::unix::ffi::OsStrExt;
    use std::os::unix::fs::OpenOptionsExt;

    // SAFETY: posix_openpt(3) returns a new fd or -1.
    let fd = unsafe { libc::posix_openpt(libc::O_RDWR | libc::O_NOCTTY | libc::O_CLOEXEC) };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: fd was just opened and is exclusively owned here.
    let master = unsafe { OwnedFd::from_raw_fd(fd) };
    // SAFETY: fd is a valid pty master for both calls.
    if unsafe { libc::grantpt(fd) } != 0 || unsafe { libc::unlockpt(fd) } != 0 {
        return Err(io::Error::last_os_error());
    }
    let mut name = [0 as libc::c_char; 128];
    // SAFETY: the buffer length is passed along with the buffer.
    let ret = unsafe { libc::ptsname_r(fd, name.as_mut_ptr(), name.len()) };
    if ret != 0 {
        return Err(io::Error::from_raw_os_error(ret));
    }
    // SAFETY: ptsname_r NUL-terminates the buffer on success.
    let path = unsafe { CStr::from_ptr(name.as_ptr()) };
    let slave = std::fs::OpenOptions::new()
        .read(true)
        .write(true)
        .custom_flags(libc::O_NOCTTY)
        .open(OsStr::from_bytes(path.to_bytes()))?;
    Ok(Pty { master, slave })
}

/// Applies `size` to the terminal behind `fd`.
pub fn set_winsize(fd: &impl std::os::fd::AsRawFd, size: TerminalSize) -> io::Result<()> {
    let ws = libc::winsize {
        ws_row: size.height,
        ws_col: size.width,
        ws_xpixel: 0,
        ws_ypixel: 0,
    };
    // SAFETY: TIOCSWINSZ reads exactly one winsize from the pointer.
    if unsafe { libc::ioctl(fd.as_raw_fd(), libc::TIOCSWINSZ, &ws) } != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Copies pty output until the terminal side is closed.
///
/// Reading a master whose slave has gone away fails with `EIO`; that is the
/// pty's end of file.
pub async fn copy_pty_output<R, W>(mut master: R, mut dst: W) -> io::Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; COPY_BUFFER_SIZE];
    let mut total = 0u64;
    loop {
        let n = match master.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.raw_os_error() == Some(libc::EIO) => break,
            Err(e) => return Err(e),
        };
        dst.write_all(&buf[..n]).await?;
        dst.flush().await?;
        total += n as u64;
    }
    Ok(total)
}

// =============================================================================
// Port Forward
// =============================================================================

/// Connects to `127.0.0.1:port` inside the network namespace at `netns_path`.
///
/// `setns` applies to the calling thread only, so the connect runs on a
/// dedicated OS thread that exits right after. The socket keeps the
/// namespace it was created in.
pub async fn connect_in_netns(netns_path: &Path, port: u16) -> Result<tokio::net::TcpStream> {
    let netns_path = netns_path.to_path_buf();
    let (tx, rx) = tokio::sync::oneshot::channel();
    std::thread::Builder::new()
        .name("portforward-netns".into())
        .spawn(move || {
            let result = (|| -> io::Result<std::net::TcpStream> {
                use std::os::fd::AsRawFd;
                let ns = std::fs::File::open(&netns_path)?;
                // SAFETY: setns(2) on a valid namespace fd only affects this thread.
                if unsafe { libc::setns(ns.as_raw_fd(), libc::CLONE_NEWNET) } != 0 {
                    return Err(io::Error::last_os_error());
                }
                std::net::TcpStream::connect(("127.0.0.1", port))
            })();
            let _ = tx.send(result);
        })?;
    let stream = rx
        .await
        .map_err(|_| Error::Internal("port-forward connect thread vanished".to_string()))??;
    stream.set_nonblocking(true)?;
    Ok(tokio::net::TcpStream::from_std(stream)?)
}

/// Copies both ways between `client` and `conn`.
///
/// The first direction to finish decides the outcome: an error or a
/// cancellation ends the forward at once, a clean EOF gives the other
/// direction [`PORT_FORWARD_GRACE`] to drain.
pub async fn forward_bidirectional<S, C>(
    client: S,
    conn: C,
    cancel: &CancellationToken,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
    C: AsyncRead + AsyncWrite + Unpin,
{
    let (mut client_rd, mut client_wr) = tokio::io::split(client);
    let (mut conn_rd, mut conn_wr) = tokio::io::split(conn);

    let to_conn = async {
        let copied = tokio::io::copy(&mut client_rd, &mut conn_wr).await;
        let _ = conn_wr.shutdown().await;
        copied
    };
    let to_client = async {
        let copied = tokio::io::copy(&mut conn_rd, &mut client_wr).await;
        let _ = client_wr.shutdown().await;
        copied
    };
    tokio::pin!(to_conn, to_client);

    tokio::select! {
        res = &mut to_conn => {
            res?;
            let _ = tokio::time::timeout(PORT_FORWARD_GRACE, &mut to_client).await;
        }
        res = &mut to_client => {
            res?;
            let _ = tokio::time::timeout(PORT_FORWARD_GRACE, &mut to_conn).await;
        }
        _ = cancel.cancelled() => {
            return Err(Error::Cancelled("port forward".to_string()));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_copy_detachable_stops_on_keys() {
        let input: &[u8] = b"hello\x10\x11world";
        let mut out = Vec::new();
        let outcome = copy_detachable(input, &mut out, &[16, 17]).await.unwrap();
        assert_eq!(outcome, CopyOutcome::Detached);
        assert_eq!(out, b"hello");
    }

    #[tokio::test]
    async fn test_copy_detachable_forwards_partial_match() {
        let input: &[u8] = b"a\x10b\x10";
        let mut out = Vec::new();
        let outcome = copy_detachable(input, &mut out, &[16, 17]).await.unwrap();
        assert_eq!(outcome, CopyOutcome::Eof(4));
        assert_eq!(out, b"a\x10b\x10");
    }

    #[tokio::test]
    async fn test_pty_copy_treats_eio_as_eof() {
        struct Eio;
        impl AsyncRead for Eio {
            fn poll_read(
                self: std::pin::Pin<&mut Self>,
                _cx: &mut std::task::Context<'_>,
                _buf: &mut tokio::io::ReadBuf<'_>,
            ) -> std::task::Poll<io::Result<()>> {
                std::task::Poll::Ready(Err(io::Error::from_raw_os_error(libc::EIO)))
            }
        }
        let mut out = Vec::new();
        assert_eq!(copy_pty_output(Eio, &mut out).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_read_limited_drains() {
        let input = vec![7u8; 100];
        let out = read_limited(&input[..], 10).await.unwrap();
        assert_eq!(out.len(), 10);
    }

    #[tokio::test]
    async fn test_demux_routes_frames() {
        let (mut tx, rx) = tokio::io::duplex(64);
        // One frame per write; the duplex keeps them apart as long as each
        // is read before the next is written.
        let reader = tokio::spawn(async move {
            let (out_w, mut out_r) = tokio::io::duplex(64);
            let (err_w, mut err_r) = tokio::io::duplex(64);
            let mut stdout: Option<BoxedWriter> = Some(Box::new(out_w));
            let mut stderr: Option<BoxedWriter> = Some(Box::new(err_w));
            demux_attach_output(rx, &mut stdout, &mut stderr)
                .await
                .unwrap();
            drop(stdout);
            drop(stderr);
            let mut o = Vec::new();
            let mut e = Vec::new();
            out_r.read_to_end(&mut o).await.unwrap();
            err_r.read_to_end(&mut e).await.unwrap();
            (o, e)
        });
        tx.write_all(b"\x01out").await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        tx.write_all(b"\x02err").await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        drop(tx);
        let (o, e) = reader.await.unwrap();
        assert_eq!(o, b"out");
        assert_eq!(e, b"err");
    }

    #[tokio::test]
    async fn test_forward_bidirectional_echo() {
        let (client, mut client_peer) = tokio::io::duplex(1024);
        let (conn, mut conn_peer) = tokio::io::duplex(1024);
        let cancel = CancellationToken::new();

        let fwd = tokio::spawn(async move { forward_bidirectional(client, conn, &cancel).await });

        client_peer.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        conn_peer.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
        conn_peer.write_all(b"pong").await.unwrap();
        client_peer.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong");

        drop(client_peer);
        drop(conn_peer);
        fwd.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_forward_cancel() {
        let (client, _client_peer) = tokio::io::duplex(1024);
        let (conn, _conn_peer) = tokio::io::duplex(1024);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = forward_bidirectional(client, conn, &cancel).await.unwrap_err();
        assert!(matches!(err, Error::Cancelled(_)));
    }
}
