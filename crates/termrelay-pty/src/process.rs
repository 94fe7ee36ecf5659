use std::time::Duration;

use crate::error::PtyError;

/// Outcome of a bounded read from a terminal process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadStatus {
    /// `n` bytes were placed at the start of the buffer.
    Data(usize),
    /// Nothing arrived before the timeout elapsed.
    Idle,
    /// The process side of the terminal is gone.
    Eof,
}

/// A PTY-like bidirectional process.
///
/// All methods take `&self` so one direction can read while the other writes.
/// Implementations must make `close` idempotent: every call after the first
/// returns `Ok(())`, later reads report `Eof`, and writes or resizes fail with
/// [`PtyError::Closed`].
pub trait TerminalProcess: Send + Sync + 'static {
    fn read(&self, buf: &mut [u8], timeout: Duration) -> Result<ReadStatus, PtyError>;

    fn write(&self, data: &[u8]) -> Result<usize, PtyError>;

    fn resize(&self, cols: u16, rows: u16) -> Result<(), PtyError>;

    fn close(&self) -> Result<(), PtyError>;

    fn pid(&self) -> Option<u32>;
}
