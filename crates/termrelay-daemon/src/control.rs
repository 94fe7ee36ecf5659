//! Control socket: the admission API over newline-delimited JSON-RPC.
//!
//! One request per line, one response per line, on a Unix socket. Requests
//! on a connection are answered in order; connections are served
//! concurrently.

use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use futures_util::SinkExt;
use futures_util::StreamExt;
use serde::Serialize;
use serde_json::json;
use termrelay_common::error_codes;
use tokio::net::UnixListener;
use tokio::net::UnixStream;
use tokio_util::codec::Framed;
use tokio_util::codec::LinesCodec;
use tokio_util::codec::LinesCodecError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::DaemonError;
use crate::manager::SessionManager;
use crate::metrics::RelayMetrics;
use crate::rpc::RpcRequest;
use crate::rpc::RpcResponse;
use crate::session::CloseReason;
use crate::session::CreateSessionRequest;

/// Longest request line accepted, in bytes.
pub const MAX_REQUEST_BYTES: usize = 1024 * 1024;

/// Dispatches control requests to the session manager.
pub struct ControlHandler {
    manager: Arc<SessionManager>,
    metrics: Arc<RelayMetrics>,
}

impl ControlHandler {
    pub fn new(manager: Arc<SessionManager>, metrics: Arc<RelayMetrics>) -> Self {
        Self { manager, metrics }
    }

    pub fn handle_request(&self, request: RpcRequest) -> RpcResponse {
        debug!(method = %request.method, id = request.id, "Control request");
        match request.method.as_str() {
            "ping" => RpcResponse::success(
                request.id,
                json!({ "pong": true, "version": env!("CARGO_PKG_VERSION") }),
            ),
            "create_session" => self.create_session(&request),
            "close_session" => self.close_session(&request),
            "get_session" => self.get_session(&request),
            "user_sessions" => self.user_sessions(&request),
            "list_sessions" => {
                let sessions = self.manager.list_active();
                to_response(request.id, &json!({ "sessions": sessions }))
            }
            "metrics" => self.metrics(&request),
            "set_max_sessions_per_user" => self.set_max_sessions_per_user(&request),
            "set_max_sessions" => self.set_max_sessions(&request),
            "set_session_timeout" => self.set_session_timeout(&request),
            _ => RpcResponse::error(
                request.id,
                error_codes::METHOD_NOT_FOUND,
                &format!("Method not found: {}", request.method),
            ),
        }
    }

    fn create_session(&self, request: &RpcRequest) -> RpcResponse {
        let create: CreateSessionRequest = match request.params_as() {
            Ok(create) => create,
            Err(resp) => return resp,
        };
        match self.manager.create(create) {
            Ok(session) => to_response(request.id, &session),
            Err(e) => RpcResponse::session_error(request.id, &e),
        }
    }

    fn close_session(&self, request: &RpcRequest) -> RpcResponse {
        let session_id = match request.require_str("session_id") {
            Ok(id) => id,
            Err(resp) => return resp,
        };
        let why = request.param_str("reason").unwrap_or_default().to_string();
        match self.manager.close(session_id, CloseReason::Requested(why)) {
            Ok(session) => to_response(request.id, &session),
            Err(e) => RpcResponse::session_error(request.id, &e),
        }
    }

    fn get_session(&self, request: &RpcRequest) -> RpcResponse {
        let session_id = match request.require_str("session_id") {
            Ok(id) => id,
            Err(resp) => return resp,
        };
        match self.manager.get(session_id) {
            Ok(session) => to_response(request.id, &session),
            Err(e) => RpcResponse::session_error(request.id, &e),
        }
    }

    fn user_sessions(&self, request: &RpcRequest) -> RpcResponse {
        let owner_id = match request.require_str("owner_id") {
            Ok(owner) => owner,
            Err(resp) => return resp,
        };
        let sessions = self.manager.user_sessions(owner_id);
        to_response(
            request.id,
            &json!({ "owner_id": owner_id, "sessions": sessions }),
        )
    }

    fn metrics(&self, request: &RpcRequest) -> RpcResponse {
        let sessions = self.manager.metrics();
        to_response(
            request.id,
            &json!({
                "sessions": sessions,
                "relay": self.metrics.to_json(),
                "limits": self.limits(),
            }),
        )
    }

    fn limits(&self) -> serde_json::Value {
        json!({
            "max_sessions_per_user": self.manager.max_sessions_per_user(),
            "max_sessions": self.manager.max_sessions(),
            "session_timeout_secs": self.manager.session_timeout().as_secs(),
        })
    }

    fn set_max_sessions_per_user(&self, request: &RpcRequest) -> RpcResponse {
        let max = match request.require_u64("max") {
            Ok(max) => max,
            Err(resp) => return resp,
        };
        match self.manager.set_max_sessions_per_user(saturating_usize(max)) {
            Ok(()) => RpcResponse::success(request.id, self.limits()),
            Err(e) => RpcResponse::session_error(request.id, &e),
        }
    }

    fn set_max_sessions(&self, request: &RpcRequest) -> RpcResponse {
        let max = match request.require_u64("max") {
            Ok(max) => max,
            Err(resp) => return resp,
        };
        match self.manager.set_max_sessions(saturating_usize(max)) {
            Ok(()) => RpcResponse::success(request.id, self.limits()),
            Err(e) => RpcResponse::session_error(request.id, &e),
        }
    }

    fn set_session_timeout(&self, request: &RpcRequest) -> RpcResponse {
        let seconds = match request.require_u64("seconds") {
            Ok(seconds) => seconds,
            Err(resp) => return resp,
        };
        match self
            .manager
            .set_session_timeout(Duration::from_secs(seconds))
        {
            Ok(()) => RpcResponse::success(request.id, self.limits()),
            Err(e) => RpcResponse::session_error(request.id, &e),
        }
    }
}

fn saturating_usize(n: u64) -> usize {
    usize::try_from(n).unwrap_or(usize::MAX)
}

fn to_response<T: Serialize>(id: u64, value: &T) -> RpcResponse {
    match serde_json::to_value(value) {
        Ok(result) => RpcResponse::success(id, result),
        Err(e) => RpcResponse::error(
            id,
            error_codes::DAEMON_ERROR,
            &format!("Failed to serialize result: {}", e),
        ),
    }
}

pub struct ControlServer {
    listener: UnixListener,
    path: PathBuf,
    handler: Arc<ControlHandler>,
}

impl ControlServer {
    /// Binds the control socket, replacing a stale socket file.
    ///
    /// Fails with [`DaemonError::AlreadyRunning`] when something still
    /// answers on `path`.
    pub fn bind(path: &Path, handler: Arc<ControlHandler>) -> Result<Self, DaemonError> {
        if path.exists() {
            if std::os::unix::net::UnixStream::connect(path).is_ok() {
                return Err(DaemonError::AlreadyRunning);
            }
            std::fs::remove_file(path).map_err(|e| DaemonError::Bind {
                what: path.display().to_string(),
                reason: format!("failed to remove stale socket: {}", e),
            })?;
        }
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| DaemonError::Bind {
                    what: parent.display().to_string(),
                    reason: e.to_string(),
                })?;
            }
        }

        let listener = UnixListener::bind(path).map_err(|e| DaemonError::Bind {
            what: path.display().to_string(),
            reason: e.to_string(),
        })?;

        Ok(Self {
            listener,
            path: path.to_path_buf(),
            handler,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Serves until `shutdown` is cancelled, then removes the socket file.
    pub async fn serve(self, shutdown: CancellationToken) {
        info!(path = %self.path.display(), "Control socket listening");

        loop {
            let accepted = tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = self.listener.accept() => accepted,
            };
            match accepted {
                Ok((stream, _)) => {
                    let handler = Arc::clone(&self.handler);
                    let shutdown = shutdown.clone();
                    tokio::spawn(async move {
                        handle_client(stream, handler, shutdown).await;
                    });
                }
                Err(e) => warn!(error = %e, "Control accept failed"),
            }
        }

        if let Err(e) = std::fs::remove_file(&self.path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %self.path.display(), error = %e, "Failed to remove control socket");
            }
        }
        debug!("Control socket stopped");
    }
}

async fn handle_client(
    stream: UnixStream,
    handler: Arc<ControlHandler>,
    shutdown: CancellationToken,
) {
    let mut lines = Framed::new(stream, LinesCodec::new_with_max_length(MAX_REQUEST_BYTES));

    loop {
        let next = tokio::select! {
            _ = shutdown.cancelled() => break,
            next = lines.next() => next,
        };

        let (response, keep_going) = match next {
            None => break,
            Some(Ok(line)) if line.trim().is_empty() => continue,
            Some(Ok(line)) => match serde_json::from_str::<RpcRequest>(&line) {
                Ok(request) => (handler.handle_request(request), true),
                Err(e) => (
                    RpcResponse::error(
                        0,
                        error_codes::PARSE_ERROR,
                        &format!("Parse error: {}", e),
                    ),
                    true,
                ),
            },
            Some(Err(LinesCodecError::MaxLineLengthExceeded)) => (
                RpcResponse::error(
                    0,
                    error_codes::PARSE_ERROR,
                    &format!(
                        "Parse error: request size limit exceeded ({}MB max)",
                        MAX_REQUEST_BYTES / 1024 / 1024
                    ),
                ),
                false,
            ),
            Some(Err(LinesCodecError::Io(e))) => {
                debug!(error = %e, "Control client connection error");
                break;
            }
        };

        let line = match serde_json::to_string(&response) {
            Ok(line) => line,
            Err(e) => {
                warn!(error = %e, "Failed to encode control response");
                break;
            }
        };
        if let Err(e) = lines.send(line).await {
            debug!(error = %e, "Control client write failed");
            break;
        }
        if !keep_going {
            break;
        }
    }
}
