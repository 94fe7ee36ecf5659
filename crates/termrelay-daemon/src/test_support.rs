//! Test doubles for the relay and the manager.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use termrelay_common::mutex_lock_or_recover;
use termrelay_protocol::WindowSize;
use termrelay_pty::{PtyError, ReadStatus, TerminalProcess};

use crate::relay::SessionEvents;
use crate::session::{CloseReason, SessionId};

/// A terminal process that replays canned output and records what it is sent.
#[derive(Default)]
pub(crate) struct ScriptedProcess {
    output: Mutex<VecDeque<Vec<u8>>>,
    exit_when_drained: AtomicBool,
    fail_writes: bool,
    fail_resizes: bool,
    write_delay: Option<Duration>,
    writes: Mutex<Vec<Vec<u8>>>,
    resizes: Mutex<Vec<(u16, u16)>>,
    closed: AtomicBool,
    close_calls: AtomicUsize,
}

impl ScriptedProcess {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn with_output(self, chunk: &[u8]) -> Self {
        mutex_lock_or_recover(&self.output).push_back(chunk.to_vec());
        self
    }

    pub(crate) fn exit_after_output(self) -> Self {
        self.exit_when_drained.store(true, Ordering::SeqCst);
        self
    }

    pub(crate) fn fail_writes(mut self) -> Self {
        self.fail_writes = true;
        self
    }

    pub(crate) fn fail_resizes(mut self) -> Self {
        self.fail_resizes = true;
        self
    }

    /// Each write blocks this long, or until the process is closed.
    pub(crate) fn with_write_delay(mut self, delay: Duration) -> Self {
        self.write_delay = Some(delay);
        self
    }

    pub(crate) fn writes(&self) -> Vec<Vec<u8>> {
        mutex_lock_or_recover(&self.writes).clone()
    }

    pub(crate) fn resizes(&self) -> Vec<(u16, u16)> {
        mutex_lock_or_recover(&self.resizes).clone()
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub(crate) fn close_calls(&self) -> usize {
        self.close_calls.load(Ordering::SeqCst)
    }
}

impl TerminalProcess for ScriptedProcess {
    fn read(&self, buf: &mut [u8], timeout: Duration) -> Result<ReadStatus, PtyError> {
        if self.is_closed() {
            return Ok(ReadStatus::Eof);
        }
        let next = mutex_lock_or_recover(&self.output).pop_front();
        match next {
            Some(chunk) => {
                let n = chunk.len().min(buf.len());
                buf[..n].copy_from_slice(&chunk[..n]);
                Ok(ReadStatus::Data(n))
            }
            None if self.exit_when_drained.load(Ordering::SeqCst) => Ok(ReadStatus::Eof),
            None => {
                std::thread::sleep(timeout.min(Duration::from_millis(10)));
                Ok(ReadStatus::Idle)
            }
        }
    }

    fn write(&self, data: &[u8]) -> Result<usize, PtyError> {
        if self.is_closed() {
            return Err(PtyError::Closed);
        }
        if self.fail_writes {
            return Err(PtyError::Write("scripted failure".to_string()));
        }
        if let Some(delay) = self.write_delay {
            let started = Instant::now();
            while started.elapsed() < delay {
                if self.is_closed() {
                    return Err(PtyError::Closed);
                }
                std::thread::sleep(Duration::from_millis(10));
            }
        }
        mutex_lock_or_recover(&self.writes).push(data.to_vec());
        Ok(data.len())
    }

    fn resize(&self, cols: u16, rows: u16) -> Result<(), PtyError> {
        if self.is_closed() {
            return Err(PtyError::Closed);
        }
        if self.fail_resizes {
            return Err(PtyError::Resize("scripted failure".to_string()));
        }
        mutex_lock_or_recover(&self.resizes).push((cols, rows));
        Ok(())
    }

    fn close(&self) -> Result<(), PtyError> {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.close_calls.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }

    fn pid(&self) -> Option<u32> {
        None
    }
}

/// Records every callback a relay makes.
#[derive(Default)]
pub(crate) struct EventLog {
    touches: AtomicUsize,
    resized: Mutex<Vec<WindowSize>>,
    ended: Mutex<Vec<(SessionId, CloseReason)>>,
}

impl EventLog {
    pub(crate) fn touches(&self) -> usize {
        self.touches.load(Ordering::SeqCst)
    }

    pub(crate) fn resized(&self) -> Vec<WindowSize> {
        mutex_lock_or_recover(&self.resized).clone()
    }

    pub(crate) fn ended(&self) -> Vec<(SessionId, CloseReason)> {
        mutex_lock_or_recover(&self.ended).clone()
    }
}

impl SessionEvents for EventLog {
    fn touch(&self, _session_id: &SessionId) {
        self.touches.fetch_add(1, Ordering::SeqCst);
    }

    fn resized(&self, _session_id: &SessionId, size: WindowSize) {
        mutex_lock_or_recover(&self.resized).push(size);
    }

    fn session_ended(&self, session_id: &SessionId, reason: CloseReason) {
        mutex_lock_or_recover(&self.ended).push((session_id.clone(), reason));
    }
}
