//! Signal handling for graceful daemon shutdown.
//!
//! SIGINT and SIGTERM cancel the daemon's shutdown token.

use signal_hook::consts::{SIGINT, SIGTERM};
use signal_hook::iterator::{Handle, Signals};
use std::thread::{self, JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::error::DaemonError;

pub struct SignalHandler {
    handle: Handle,
    thread: Option<JoinHandle<()>>,
}

impl SignalHandler {
    /// Starts a thread that cancels `shutdown` on the first SIGINT or SIGTERM.
    pub fn setup(shutdown: CancellationToken) -> Result<Self, DaemonError> {
        let mut signals =
            Signals::new([SIGINT, SIGTERM]).map_err(|e| DaemonError::SignalSetup(e.to_string()))?;
        let handle = signals.handle();

        let thread = thread::Builder::new()
            .name("signal-handler".to_string())
            .spawn(move || {
                if let Some(sig) = signals.forever().next() {
                    info!(signal = sig, "Received signal, initiating graceful shutdown");
                    shutdown.cancel();
                }
            })
            .map_err(|e| DaemonError::SignalSetup(format!("failed to spawn signal handler: {}", e)))?;

        Ok(Self {
            handle,
            thread: Some(thread),
        })
    }
}

impl Drop for SignalHandler {
    fn drop(&mut self) {
        self.handle.close();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}
