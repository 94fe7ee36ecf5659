use std::io;
use std::io::Read;
use std::io::Write;
use std::os::fd::RawFd;
use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Mutex;
use std::thread;
use std::time::Duration;

use portable_pty::native_pty_system;
use portable_pty::Child;
use portable_pty::CommandBuilder;
use portable_pty::MasterPty;
use portable_pty::PtySize;
use tracing::debug;
use tracing::warn;

use termrelay_common::mutex_lock_or_recover;

use crate::error::PtyError;
use crate::process::ReadStatus;
use crate::process::TerminalProcess;
use crate::resolve::resolve_program;

const HANGUP_GRACE: Duration = Duration::from_millis(50);
const WRITE_POLL_SLICE_MS: i32 = 100;
/// A process that stops reading its input for this long fails the write.
const WRITE_STALL_TIMEOUT: Duration = Duration::from_secs(10);

/// Extra knobs for [`PtyHandle::start_with`].
#[derive(Debug, Clone)]
pub struct SpawnOptions {
    pub cols: u16,
    pub rows: u16,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub env: Vec<(String, String)>,
}

impl Default for SpawnOptions {
    fn default() -> Self {
        Self {
            cols: 80,
            rows: 24,
            args: Vec::new(),
            cwd: None,
            env: Vec::new(),
        }
    }
}

impl SpawnOptions {
    pub fn with_size(mut self, cols: u16, rows: u16) -> Self {
        self.cols = cols;
        self.rows = rows;
        self
    }

    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }

    pub fn with_cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }
}

/// A shell attached to a pseudo-terminal.
///
/// The child runs as a session leader, so its pid doubles as the process
/// group id. `close` signals that whole group, reaps the child and releases
/// the master side. Dropping an unclosed handle closes it.
pub struct PtyHandle {
    master: Mutex<Option<Box<dyn MasterPty + Send>>>,
    child: Mutex<Box<dyn Child + Send + Sync>>,
    reader: Mutex<Box<dyn Read + Send>>,
    writer: Mutex<Option<Box<dyn Write + Send>>>,
    master_fd: RawFd,
    pid: Option<u32>,
    program: PathBuf,
    closed: AtomicBool,
}

impl Drop for PtyHandle {
    fn drop(&mut self) {
        if !self.closed.load(Ordering::SeqCst) {
            if let Err(e) = self.close() {
                warn!(pid = ?self.pid, error = %e, "Failed to close PTY on drop");
            }
        }
    }
}

impl PtyHandle {
    /// Spawns the first usable program from `preferred` on an 80x24 terminal.
    pub fn start(preferred: &[String]) -> Result<Self, PtyError> {
        Self::start_with(preferred, &SpawnOptions::default())
    }

    pub fn start_with(preferred: &[String], options: &SpawnOptions) -> Result<Self, PtyError> {
        let program = resolve_program(preferred)?;

        let size = PtySize {
            rows: options.rows,
            cols: options.cols,
            pixel_width: 0,
            pixel_height: 0,
        };

        let pair = native_pty_system()
            .openpty(size)
            .map_err(|e| PtyError::Open(e.to_string()))?;

        let mut cmd = CommandBuilder::new(&program);
        cmd.args(&options.args);
        if let Some(dir) = &options.cwd {
            cmd.cwd(dir);
        }
        cmd.env("TERM", "xterm-256color");
        for (key, value) in &options.env {
            cmd.env(key, value);
        }

        let child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| PtyError::Spawn(e.to_string()))?;
        drop(pair.slave);

        let reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| PtyError::Open(e.to_string()))?;

        let master_fd = pair
            .master
            .as_raw_fd()
            .ok_or_else(|| PtyError::Open("Failed to get master fd".to_string()))?;

        set_non_blocking(master_fd)?;

        let writer = pair
            .master
            .take_writer()
            .map_err(|e| PtyError::Open(e.to_string()))?;

        let pid = child.process_id();
        debug!(program = %program.display(), pid = ?pid, "Spawned PTY process");

        Ok(Self {
            master: Mutex::new(Some(pair.master)),
            child: Mutex::new(child),
            reader: Mutex::new(reader),
            writer: Mutex::new(Some(writer)),
            master_fd,
            pid,
            program,
            closed: AtomicBool::new(false),
        })
    }

    pub fn program(&self) -> &PathBuf {
        &self.program
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn terminate_group(&self, child: &mut Box<dyn Child + Send + Sync>) {
        let Some(pid) = self.pid else {
            if let Err(e) = child.kill() {
                debug!(error = %e, "Kill without pid failed");
            }
            return;
        };

        match signal_group(pid, libc::SIGHUP) {
            Ok(()) => {
                thread::sleep(HANGUP_GRACE);
                if let Err(e) = signal_group(pid, libc::SIGKILL) {
                    if e.raw_os_error() != Some(libc::ESRCH) {
                        debug!(pid, error = %e, "SIGKILL to process group failed");
                    }
                }
            }
            Err(e) if e.raw_os_error() == Some(libc::ESRCH) => {}
            Err(e) => {
                warn!(pid, error = %e, "Process group signal failed, killing child only");
                if let Err(e) = child.kill() {
                    debug!(pid, error = %e, "Child kill failed");
                }
            }
        }
    }
}

impl TerminalProcess for PtyHandle {
    fn read(&self, buf: &mut [u8], timeout: Duration) -> Result<ReadStatus, PtyError> {
        if buf.is_empty() {
            return Ok(ReadStatus::Idle);
        }

        let mut reader = mutex_lock_or_recover(&self.reader);
        if self.is_closed() {
            return Ok(ReadStatus::Eof);
        }

        let timeout_ms = timeout.as_millis().min(i32::MAX as u128) as i32;
        match wait_readable(self.master_fd, timeout_ms)? {
            Readiness::Idle => return Ok(ReadStatus::Idle),
            Readiness::HangUp => return Ok(ReadStatus::Eof),
            Readiness::Ready => {}
        }

        loop {
            match reader.read(buf) {
                Ok(0) => return Ok(ReadStatus::Eof),
                Ok(n) => return Ok(ReadStatus::Data(n)),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(ReadStatus::Idle),
                // Linux reports EIO on the master once the slave side is gone.
                Err(e) if e.raw_os_error() == Some(libc::EIO) => return Ok(ReadStatus::Eof),
                Err(e) => return Err(PtyError::Read(e.to_string())),
            }
        }
    }

    fn write(&self, data: &[u8]) -> Result<usize, PtyError> {
        if data.is_empty() {
            return Ok(0);
        }

        let mut guard = mutex_lock_or_recover(&self.writer);
        let writer = guard.as_mut().ok_or(PtyError::Closed)?;

        let mut offset = 0;
        let mut stalled = Duration::ZERO;
        while offset < data.len() {
            match writer.write(&data[offset..]) {
                Ok(0) => {
                    return Err(PtyError::Write(
                        "write returned 0 bytes, PTY closed".to_string(),
                    ));
                }
                Ok(n) => {
                    offset += n;
                    stalled = Duration::ZERO;
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    if self.is_closed() {
                        return Err(PtyError::Closed);
                    }
                    if stalled >= WRITE_STALL_TIMEOUT {
                        return Err(PtyError::Write(format!(
                            "terminal input not drained for {:?}",
                            WRITE_STALL_TIMEOUT
                        )));
                    }
                    if !wait_writable(self.master_fd, WRITE_POLL_SLICE_MS)? {
                        stalled += Duration::from_millis(WRITE_POLL_SLICE_MS as u64);
                    }
                }
                Err(e) => return Err(PtyError::Write(e.to_string())),
            }
        }
        if let Err(e) = writer.flush() {
            return Err(PtyError::Write(e.to_string()));
        }
        Ok(offset)
    }

    fn resize(&self, cols: u16, rows: u16) -> Result<(), PtyError> {
        let guard = mutex_lock_or_recover(&self.master);
        let master = guard.as_ref().ok_or(PtyError::Closed)?;
        master
            .resize(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| PtyError::Resize(e.to_string()))
    }

    fn close(&self) -> Result<(), PtyError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        // Lock order: reader → child → writer → master. Holding the reader
        // keeps a concurrent poll from touching the fd while it is released.
        let _reader = mutex_lock_or_recover(&self.reader);
        let mut child = mutex_lock_or_recover(&self.child);

        self.terminate_group(&mut child);

        match child.wait() {
            Ok(status) => debug!(pid = ?self.pid, ?status, "Reaped PTY process"),
            Err(e) => debug!(pid = ?self.pid, error = %e, "Wait on PTY process failed"),
        }

        mutex_lock_or_recover(&self.writer).take();
        mutex_lock_or_recover(&self.master).take();
        Ok(())
    }

    fn pid(&self) -> Option<u32> {
        self.pid
    }
}

fn signal_group(pid: u32, signal: libc::c_int) -> io::Result<()> {
    let result = unsafe { libc::killpg(pid as libc::pid_t, signal) };
    if result == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

fn set_non_blocking(fd: RawFd) -> Result<(), PtyError> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags < 0 {
        return Err(PtyError::Open(io::Error::last_os_error().to_string()));
    }

    if flags & libc::O_NONBLOCK != 0 {
        return Ok(());
    }

    let result = unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) };
    if result < 0 {
        return Err(PtyError::Open(io::Error::last_os_error().to_string()));
    }

    Ok(())
}

enum Readiness {
    Ready,
    Idle,
    HangUp,
}

fn wait_readable(fd: RawFd, timeout_ms: i32) -> Result<Readiness, PtyError> {
    let mut pollfd = libc::pollfd {
        fd,
        events: libc::POLLIN,
        revents: 0,
    };

    let result = unsafe { libc::poll(&mut pollfd, 1, timeout_ms) };
    if result < 0 {
        let err = io::Error::last_os_error();
        if err.kind() == io::ErrorKind::Interrupted {
            return Ok(Readiness::Idle);
        }
        return Err(PtyError::Read(err.to_string()));
    }
    if result == 0 {
        return Ok(Readiness::Idle);
    }

    if pollfd.revents & libc::POLLIN != 0 {
        return Ok(Readiness::Ready);
    }

    if pollfd.revents & libc::POLLNVAL != 0 {
        return Err(PtyError::Read("poll error on PTY".to_string()));
    }

    if pollfd.revents & (libc::POLLHUP | libc::POLLERR) != 0 {
        return Ok(Readiness::HangUp);
    }

    Ok(Readiness::Idle)
}

/// Returns `Ok(false)` when the fd did not become writable within the slice.
fn wait_writable(fd: RawFd, timeout_ms: i32) -> Result<bool, PtyError> {
    let mut pollfd = libc::pollfd {
        fd,
        events: libc::POLLOUT,
        revents: 0,
    };

    let result = unsafe { libc::poll(&mut pollfd, 1, timeout_ms) };
    if result < 0 {
        let err = io::Error::last_os_error();
        if err.kind() == io::ErrorKind::Interrupted {
            return Ok(false);
        }
        return Err(PtyError::Write(err.to_string()));
    }
    if result == 0 {
        return Ok(false);
    }

    if pollfd.revents & (libc::POLLERR | libc::POLLHUP | libc::POLLNVAL) != 0 {
        return Err(PtyError::Write("poll error on PTY".to_string()));
    }

    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_spawn_options_builder() {
        let options = SpawnOptions::default()
            .with_size(150, 40)
            .with_args(vec!["-i".into()])
            .with_cwd("/tmp")
            .with_env("LANG", "C");

        assert_eq!((options.cols, options.rows), (150, 40));
        assert_eq!(options.args, vec!["-i".to_string()]);
        assert_eq!(options.cwd, Some(PathBuf::from("/tmp")));
        assert_eq!(options.env, vec![("LANG".to_string(), "C".to_string())]);
    }

    #[test]
    fn test_start_fails_without_shell() {
        let result = PtyHandle::start(&["/no/such/shell".to_string()]);
        assert!(matches!(result, Err(PtyError::NoShellFound { .. })));
    }

    #[test]
    fn test_signal_group_on_missing_group_is_esrch() {
        // pid_max on Linux is at most 2^22, so this group cannot exist.
        let err = signal_group(0x7fff_fff0, 0).unwrap_err();
        assert_eq!(err.raw_os_error(), Some(libc::ESRCH));
    }
}
