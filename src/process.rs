//! Host process inspection and signalling.
//!
//! Liveness is decided from `/proc/<pid>/stat`: the process state letter
//! (field 3) and the start time in clock ticks since boot (field 22). The
//! start time is what makes PID-wrap detection possible, because a reused
//! PID always carries a later start time.

use crate::error::{Error, Result};
use std::path::Path;

/// Index of the state letter after the `)` that closes the command name.
const STATE_FIELD_INDEX: usize = 0;

/// Index of `starttime` after the `)` that closes the command name.
const START_TIME_FIELD_INDEX: usize = 19;

/// Upper bound on bytes read from a stat file.
const MAX_STAT_FILE_SIZE: u64 = 4096;

/// State letter and start time of a process, as reported by the kernel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcStat {
    /// Single-letter state (`R`, `S`, `D`, `Z`, `X`, ...).
    pub state: String,
    /// Start time in clock ticks since boot, kept verbatim.
    pub start_time: String,
}

impl ProcStat {
    /// Zombie (`Z`) and dead (`X`) processes count as exited.
    pub fn is_defunct(&self) -> bool {
        self.state == "Z" || self.state == "X"
    }
}

/// Parses the contents of a `/proc/<pid>/stat` file.
///
/// The command name may itself contain spaces and parentheses, so parsing
/// starts after the last `)`. Malformed content reports [`Error::ProcessNotFound`].
pub fn parse_stat(data: &[u8]) -> Result<ProcStat> {
    let bracket = data
        .iter()
        .rposition(|&b| b == b')')
        .ok_or(Error::ProcessNotFound)?;
    let rest = data.get(bracket + 2..).ok_or(Error::ProcessNotFound)?;
    let text = String::from_utf8_lossy(rest);
    let fields: Vec<&str> = text.split_whitespace().collect();
    if fields.len() < START_TIME_FIELD_INDEX + 1 {
        return Err(Error::ProcessNotFound);
    }
    Ok(ProcStat {
        state: fields[STATE_FIELD_INDEX].to_string(),
        start_time: fields[START_TIME_FIELD_INDEX].to_string(),
    })
}

/// Reads and parses a stat file.
///
/// Any read failure reports [`Error::ProcessNotFound`].
pub fn read_stat_file(path: &Path) -> Result<ProcStat> {
    use std::io::Read;

    let file = std::fs::File::open(path).map_err(|_| Error::ProcessNotFound)?;
    let mut data = Vec::new();
    file.take(MAX_STAT_FILE_SIZE)
        .read_to_end(&mut data)
        .map_err(|_| Error::ProcessNotFound)?;
    parse_stat(&data)
}

/// Reads the stat data of a live process.
pub fn proc_stat(pid: i32) -> Result<ProcStat> {
    read_stat_file(Path::new(&format!("/proc/{}/stat", pid)))
}

/// Returns the kernel start time of a process.
pub fn start_time(pid: i32) -> Result<String> {
    proc_stat(pid).map(|s| s.start_time)
}

/// Sends `signal` to `pid`.
///
/// `ESRCH` maps to [`Error::ProcessNotFound`]. Non-positive PIDs are refused,
/// since they would address process groups, including our own.
pub fn kill(pid: i32, signal: i32) -> Result<()> {
    if pid <= 0 {
        return Err(Error::ProcessNotFound);
    }
    // SAFETY: kill(2) has no memory-safety preconditions.
    let ret = unsafe { libc::kill(pid, signal) };
    if ret == 0 {
        return Ok(());
    }
    let err = std::io::Error::last_os_error();
    if err.raw_os_error() == Some(libc::ESRCH) {
        Err(Error::ProcessNotFound)
    } else {
        Err(Error::Io(err))
    }
}

/// Sends `signal` to the process group led by `pgid`.
pub fn kill_group(pgid: i32, signal: i32) -> Result<()> {
    if pgid <= 1 {
        return Err(Error::ProcessNotFound);
    }
    // SAFETY: killpg(2) has no memory-safety preconditions.
    let ret = unsafe { libc::killpg(pgid, signal) };
    if ret == 0 {
        return Ok(());
    }
    let err = std::io::Error::last_os_error();
    if err.raw_os_error() == Some(libc::ESRCH) {
        Err(Error::ProcessNotFound)
    } else {
        Err(Error::Io(err))
    }
}

/// Returns true if a process with this PID exists (signal 0).
pub fn exists(pid: i32) -> bool {
    kill(pid, 0).is_ok()
}
