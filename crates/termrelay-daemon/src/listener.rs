//! TCP relay listener.
//!
//! Each connection announces its session with a preamble, claims the
//! session's lease, gets a fresh PTY at the session's dimensions and is
//! handed to a [`RelayPump`] running in its own task.

use std::net::SocketAddr;
use std::sync::Arc;

use futures_util::StreamExt;
use termrelay_protocol::{preamble, MessageCodec};
use termrelay_pty::{PtyHandle, SpawnOptions, TerminalProcess};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::RelayConfig;
use crate::error::DaemonError;
use crate::manager::SessionManager;
use crate::metrics::RelayMetrics;
use crate::recording::{FileRecorder, RecordingSink};
use crate::relay::{RelayOptions, RelayPump};
use crate::session::CloseReason;

pub struct RelayListener {
    listener: TcpListener,
    manager: Arc<SessionManager>,
    config: Arc<RelayConfig>,
    metrics: Arc<RelayMetrics>,
}

impl RelayListener {
    pub async fn bind(
        config: Arc<RelayConfig>,
        manager: Arc<SessionManager>,
        metrics: Arc<RelayMetrics>,
    ) -> Result<Self, DaemonError> {
        let listener =
            TcpListener::bind(config.listen_addr)
                .await
                .map_err(|e| DaemonError::Bind {
                    what: config.listen_addr.to_string(),
                    reason: e.to_string(),
                })?;
        Ok(Self {
            listener,
            manager,
            config,
            metrics,
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accepts connections until `shutdown` is cancelled.
    pub async fn serve(self, shutdown: CancellationToken) {
        if let Ok(addr) = self.local_addr() {
            info!(%addr, "Relay listener accepting connections");
        }

        loop {
            let accepted = tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = self.listener.accept() => accepted,
            };

            match accepted {
                Ok((stream, peer)) => {
                    self.metrics.record_connection();
                    let manager = Arc::clone(&self.manager);
                    let config = Arc::clone(&self.config);
                    let metrics = Arc::clone(&self.metrics);
                    tokio::spawn(async move {
                        handle_connection(stream, peer, manager, config, metrics).await;
                    });
                }
                Err(e) => {
                    warn!(error = %e, "Accept failed");
                }
            }
        }
        debug!("Relay listener stopped");
    }
}

async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    manager: Arc<SessionManager>,
    config: Arc<RelayConfig>,
    metrics: Arc<RelayMetrics>,
) {
    if let Err(e) = stream.set_nodelay(true) {
        debug!(%peer, error = %e, "Failed to set TCP_NODELAY");
    }
    let mut framed = Framed::new(stream, MessageCodec::new(config.max_frame_bytes));

    let first = match tokio::time::timeout(config.preamble_timeout, framed.next()).await {
        Ok(Some(Ok(message))) => message,
        Ok(Some(Err(e))) => {
            warn!(%peer, error = %e, "Connection failed before preamble");
            metrics.record_rejected();
            return;
        }
        Ok(None) => {
            debug!(%peer, "Connection closed before preamble");
            metrics.record_rejected();
            return;
        }
        Err(_) => {
            warn!(%peer, timeout = ?config.preamble_timeout, "No preamble received");
            metrics.record_rejected();
            return;
        }
    };

    let session_id = match preamble::decode(&first) {
        Ok(id) => id,
        Err(e) => {
            warn!(%peer, error = %e, "Rejecting connection");
            metrics.record_rejected();
            return;
        }
    };

    let lease = match manager.attach(&session_id) {
        Ok(lease) => lease,
        Err(e) => {
            warn!(%peer, session_id = %session_id, error = %e, "Attach refused");
            metrics.record_rejected();
            return;
        }
    };

    let options = SpawnOptions::default()
        .with_size(lease.dimensions.cols, lease.dimensions.rows)
        .with_env("TERMRELAY_SESSION_ID", lease.session_id.as_str());
    let shells = config.shells.clone();
    let spawned = tokio::task::spawn_blocking(move || PtyHandle::start_with(&shells, &options)).await;
    let started = match spawned {
        Ok(Ok(process)) => Ok(Arc::new(process)),
        Ok(Err(e)) => Err(e.to_string()),
        Err(e) => Err(format!("spawn task failed: {}", e)),
    };
    let process = match started {
        Ok(process) => process,
        Err(reason) => {
            error!(session_id = %lease.session_id, error = %reason, "Failed to start terminal process");
            if let Err(e) = manager.close(lease.session_id.as_str(), CloseReason::SpawnFailed(reason)) {
                debug!(session_id = %lease.session_id, error = %e, "Session already gone after failed spawn");
            }
            return;
        }
    };

    info!(
        %peer,
        session_id = %lease.session_id,
        owner_id = %lease.owner_id,
        pid = ?process.pid(),
        "Relay attached"
    );

    let mut pump = RelayPump::new(
        lease.session_id.clone(),
        process,
        Arc::clone(&manager),
        lease.cancel.clone(),
    )
    .with_options(RelayOptions::from_config(&config));

    if let Some(path) = &lease.recording_path {
        match FileRecorder::open(path) {
            Ok(recorder) => {
                pump = pump.with_recorder(Box::new(recorder) as Box<dyn RecordingSink>);
            }
            Err(e) => {
                warn!(session_id = %lease.session_id, path = %path.display(), error = %e, "Recording unavailable");
            }
        }
    }

    let outcome = pump.run(framed).await;
    metrics.record_bytes(outcome.bytes_in, outcome.bytes_out);
    metrics.record_dropped_frames(outcome.frames_dropped);
}
