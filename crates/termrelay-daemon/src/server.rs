//! Daemon wiring: session manager, relay listener, control socket, idle
//! sweeper and signal handling under one shutdown token.

use std::fs::File;
use std::fs::OpenOptions;
use std::io::Write;
use std::net::SocketAddr;
use std::os::unix::io::AsRawFd;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::RelayConfig;
use crate::control::ControlHandler;
use crate::control::ControlServer;
use crate::error::DaemonError;
use crate::listener::RelayListener;
use crate::manager::SessionManager;
use crate::metrics::RelayMetrics;
use crate::signal_handler::SignalHandler;
use crate::store::JsonFileStore;
use crate::store::SessionStore;
use crate::sweeper::spawn_sweeper;

const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Exclusive pid lock next to the control socket, released on drop.
struct PidLock {
    _file: File,
    path: PathBuf,
}

impl PidLock {
    fn acquire(path: &Path) -> Result<Self, DaemonError> {
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .map_err(|e| DaemonError::Bind {
                what: path.display().to_string(),
                reason: format!("failed to open lock file: {}", e),
            })?;

        // SAFETY: the fd is valid for the lifetime of `file`.
        let result = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
        if result != 0 {
            return Err(DaemonError::AlreadyRunning);
        }

        let mut file = file;
        file.set_len(0)
            .and_then(|()| writeln!(file, "{}", std::process::id()))
            .map_err(|e| DaemonError::Bind {
                what: path.display().to_string(),
                reason: format!("failed to write pid to lock file: {}", e),
            })?;

        Ok(Self {
            _file: file,
            path: path.to_path_buf(),
        })
    }
}

impl Drop for PidLock {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

/// A started daemon. Stop it by cancelling [`RunningDaemon::shutdown_token`]
/// and awaiting [`RunningDaemon::wait`].
pub struct RunningDaemon {
    relay_addr: SocketAddr,
    control_socket: PathBuf,
    manager: Arc<SessionManager>,
    metrics: Arc<RelayMetrics>,
    shutdown: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
    _lock: PidLock,
}

impl RunningDaemon {
    /// Binds both sockets and starts all background tasks.
    pub async fn start(config: RelayConfig) -> Result<Self, DaemonError> {
        let lock = PidLock::acquire(&config.control_socket.with_extension("lock"))?;

        let store: Arc<dyn SessionStore> = Arc::new(JsonFileStore::new(&config.state_file));
        let manager = Arc::new(SessionManager::new(&config, store));
        let metrics = Arc::new(RelayMetrics::new());
        let shutdown = CancellationToken::new();

        let handler = Arc::new(ControlHandler::new(
            Arc::clone(&manager),
            Arc::clone(&metrics),
        ));
        let control = ControlServer::bind(&config.control_socket, handler)?;

        let config = Arc::new(config);
        let listener = RelayListener::bind(
            Arc::clone(&config),
            Arc::clone(&manager),
            Arc::clone(&metrics),
        )
        .await?;
        let relay_addr = listener.local_addr().map_err(|e| DaemonError::Bind {
            what: config.listen_addr.to_string(),
            reason: e.to_string(),
        })?;

        let tasks = vec![
            tokio::spawn(listener.serve(shutdown.clone())),
            tokio::spawn(control.serve(shutdown.clone())),
            spawn_sweeper(Arc::clone(&manager), config.sweep_interval, shutdown.clone()),
        ];

        info!(
            relay = %relay_addr,
            control = %config.control_socket.display(),
            pid = std::process::id(),
            max_sessions = config.max_sessions,
            max_sessions_per_user = config.max_sessions_per_user,
            "termrelay daemon started"
        );

        Ok(Self {
            relay_addr,
            control_socket: config.control_socket.clone(),
            manager,
            metrics,
            shutdown,
            tasks,
            _lock: lock,
        })
    }

    pub fn relay_addr(&self) -> SocketAddr {
        self.relay_addr
    }

    pub fn control_socket(&self) -> &Path {
        &self.control_socket
    }

    pub fn manager(&self) -> &Arc<SessionManager> {
        &self.manager
    }

    pub fn metrics(&self) -> &Arc<RelayMetrics> {
        &self.metrics
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Waits for the shutdown token, then closes every session and stops
    /// the background tasks.
    pub async fn wait(self) {
        self.shutdown.cancelled().await;
        info!("Shutting down daemon");

        for task in self.tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "Background task ended abnormally");
            }
        }

        let manager = Arc::clone(&self.manager);
        if let Err(e) = tokio::task::spawn_blocking(move || manager.shutdown()).await {
            warn!(error = %e, "Session shutdown task failed");
        }

        info!(
            connections = self.metrics.connections(),
            "Daemon shutdown complete"
        );
    }
}

/// Runs the daemon on its own runtime until SIGINT or SIGTERM.
pub fn start_daemon(config: RelayConfig) -> Result<(), DaemonError> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .thread_name("termrelay")
        .build()
        .map_err(|e| DaemonError::Runtime(e.to_string()))?;

    let result = runtime.block_on(async move {
        let daemon = RunningDaemon::start(config).await?;
        let _signals = SignalHandler::setup(daemon.shutdown_token())?;
        daemon.wait().await;
        Ok(())
    });

    // Relay readers poll for cancellation, so blocked PTY reads drain quickly.
    runtime.shutdown_timeout(SHUTDOWN_GRACE);
    result
}
