//! Blocking client for the daemon's control socket.

use std::io::BufRead;
use std::io::BufReader;
use std::io::Write;
use std::os::unix::net::UnixStream;
use std::path::Path;
use std::path::PathBuf;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::time::Duration;

use serde_json::Value;
use termrelay_common::ErrorCategory;
use termrelay_daemon::rpc::RpcRequest;
use termrelay_daemon::rpc::RpcResponse;

use crate::error::ClientError;

static REQUEST_ID: AtomicU64 = AtomicU64::new(1);

const READ_TIMEOUT: Duration = Duration::from_secs(30);
const WRITE_TIMEOUT: Duration = Duration::from_secs(10);

pub struct ControlClient {
    socket: PathBuf,
}

impl ControlClient {
    /// Fails fast when nothing listens on `socket`.
    pub fn connect(socket: impl Into<PathBuf>) -> Result<Self, ClientError> {
        let socket = socket.into();
        if !socket.exists() {
            return Err(ClientError::DaemonNotRunning(socket));
        }
        UnixStream::connect(&socket)?;
        Ok(Self { socket })
    }

    pub fn socket(&self) -> &Path {
        &self.socket
    }

    /// Sends one request on a fresh connection and returns its result.
    pub fn call(&self, method: &str, params: Option<Value>) -> Result<Value, ClientError> {
        let mut stream = UnixStream::connect(&self.socket)?;
        stream.set_read_timeout(Some(READ_TIMEOUT))?;
        stream.set_write_timeout(Some(WRITE_TIMEOUT))?;

        let request = RpcRequest::new(REQUEST_ID.fetch_add(1, Ordering::SeqCst), method, params);
        let line = serde_json::to_string(&request)?;
        writeln!(stream, "{}", line)?;
        stream.flush()?;

        let mut reader = BufReader::new(&stream);
        let mut response_line = String::new();
        if reader.read_line(&mut response_line)? == 0 {
            return Err(ClientError::InvalidResponse);
        }

        let response: RpcResponse = serde_json::from_str(&response_line)?;
        if response.id != request.id && response.id != 0 {
            return Err(ClientError::InvalidResponse);
        }

        if let Some(error) = response.error {
            return Err(ClientError::Rpc {
                code: error.code,
                category: error
                    .category()
                    .and_then(|c| c.parse::<ErrorCategory>().ok()),
                suggestion: error.suggestion().map(str::to_string),
                retryable: error.is_retryable(),
                message: error.message,
            });
        }

        response.result.ok_or(ClientError::InvalidResponse)
    }
}
