//! Domain errors for session admission, relaying and daemon startup.
//!
//! Each error maps to a semantic code from `termrelay_common::error_codes`
//! and carries structured context so control clients can branch without
//! parsing messages.

use serde_json::{json, Value};
use termrelay_common::error_codes::{self, ErrorCategory};
use termrelay_protocol::ProtocolError;
use termrelay_pty::PtyError;
use thiserror::Error;

use crate::session::CloseReason;

/// Session-level errors with structured context.
#[derive(Error, Debug)]
pub enum SessionError {
    #[error("Session not found: {0}")]
    NotFound(String),
    #[error("Session limit reached for user {owner_id}: maximum {max} sessions allowed")]
    PerUserLimitReached { owner_id: String, max: usize },
    #[error("System at capacity: maximum {max} sessions allowed")]
    GlobalLimitReached { max: usize },
    #[error("Session already exists: {0}")]
    AlreadyExists(String),
    #[error("Session already attached: {0}")]
    AlreadyAttached(String),
    #[error("Invalid session id: {0}")]
    InvalidSessionId(String),
    #[error("Invalid value for {name}: {value}")]
    InvalidSetting { name: &'static str, value: String },
    #[error("PTY error: {0}")]
    Pty(#[from] PtyError),
    #[error("Persistence error during {operation}: {reason}")]
    Persistence { operation: String, reason: String },
}

impl SessionError {
    /// Returns the error code for this error.
    pub fn code(&self) -> i32 {
        match self {
            SessionError::NotFound(_) => error_codes::SESSION_NOT_FOUND,
            SessionError::PerUserLimitReached { .. } => error_codes::PER_USER_LIMIT,
            SessionError::GlobalLimitReached { .. } => error_codes::GLOBAL_LIMIT,
            SessionError::AlreadyExists(_) => error_codes::SESSION_EXISTS,
            SessionError::AlreadyAttached(_) => error_codes::SESSION_ATTACHED,
            SessionError::InvalidSessionId(_) => error_codes::INVALID_SESSION_ID,
            SessionError::InvalidSetting { .. } => error_codes::INVALID_SETTING,
            SessionError::Pty(e) => e.code(),
            SessionError::Persistence { .. } => error_codes::PERSISTENCE_ERROR,
        }
    }

    /// Returns the error category for programmatic handling.
    pub fn category(&self) -> ErrorCategory {
        error_codes::category_for_code(self.code())
    }

    /// True for the two admission denials.
    pub fn is_admission_denied(&self) -> bool {
        matches!(
            self,
            SessionError::PerUserLimitReached { .. } | SessionError::GlobalLimitReached { .. }
        )
    }

    /// Returns structured context about the error for debugging.
    pub fn context(&self) -> Value {
        match self {
            SessionError::NotFound(id)
            | SessionError::AlreadyExists(id)
            | SessionError::AlreadyAttached(id) => json!({ "session_id": id }),
            SessionError::InvalidSessionId(reason) => json!({ "reason": reason }),
            SessionError::PerUserLimitReached { owner_id, max } => {
                json!({ "owner_id": owner_id, "max_sessions_per_user": max })
            }
            SessionError::GlobalLimitReached { max } => json!({ "max_sessions": max }),
            SessionError::InvalidSetting { name, value } => {
                json!({ "setting": name, "value": value })
            }
            SessionError::Pty(pty_err) => pty_err.context(),
            SessionError::Persistence { operation, reason } => {
                json!({ "operation": operation, "reason": reason })
            }
        }
    }

    /// Returns a helpful suggestion for resolving the error.
    pub fn suggestion(&self) -> String {
        match self {
            SessionError::NotFound(_) => {
                "Run 'termrelay list' to see active sessions. Closed sessions cannot be reopened."
                    .to_string()
            }
            SessionError::PerUserLimitReached { .. } => {
                "You have too many open sessions. Close one of your sessions with 'termrelay close <id>'."
                    .to_string()
            }
            SessionError::GlobalLimitReached { .. } => {
                "The relay is at capacity. Wait for other sessions to end and retry.".to_string()
            }
            SessionError::AlreadyExists(_) => {
                "Choose a different session id or omit it to get a generated one.".to_string()
            }
            SessionError::AlreadyAttached(_) => {
                "Another connection is driving this session. Close it before attaching again."
                    .to_string()
            }
            SessionError::InvalidSessionId(_) => {
                "Session ids must contain at least one non-whitespace character.".to_string()
            }
            SessionError::InvalidSetting { .. } => {
                "Limits and timeouts must be greater than zero. The previous value is kept."
                    .to_string()
            }
            SessionError::Pty(pty_err) => pty_err.suggestion(),
            SessionError::Persistence { .. } => {
                "Persistence error is non-fatal. Sessions continue to operate normally.".to_string()
            }
        }
    }

    /// Returns whether this error is potentially transient and may succeed on retry.
    pub fn is_retryable(&self) -> bool {
        match self {
            SessionError::Pty(pty_err) => pty_err.is_retryable(),
            _ => error_codes::is_retryable(self.code()),
        }
    }
}

/// Errors that end a running relay.
#[derive(Error, Debug)]
pub enum RelayError {
    #[error("Stream error: {0}")]
    Stream(String),
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("Process error: {0}")]
    Process(#[from] PtyError),
}

impl RelayError {
    pub fn code(&self) -> i32 {
        match self {
            RelayError::Stream(_) => error_codes::STREAM_ERROR,
            RelayError::Protocol(e) => e.code(),
            RelayError::Process(e) => e.code(),
        }
    }

    pub fn category(&self) -> ErrorCategory {
        error_codes::category_for_code(self.code())
    }
}

impl From<RelayError> for CloseReason {
    fn from(err: RelayError) -> Self {
        match err {
            RelayError::Stream(reason) => CloseReason::StreamError(reason),
            RelayError::Protocol(e) => CloseReason::StreamError(e.to_string()),
            RelayError::Process(_) => CloseReason::ProcessExited,
        }
    }
}

/// Daemon startup and lifecycle errors.
#[derive(Error, Debug)]
pub enum DaemonError {
    #[error("Failed to bind {what}: {reason}")]
    Bind { what: String, reason: String },
    #[error("Another daemon instance is already running")]
    AlreadyRunning,
    #[error("Failed to setup signal handler: {0}")]
    SignalSetup(String),
    #[error("Runtime error: {0}")]
    Runtime(String),
}

impl DaemonError {
    pub fn code(&self) -> i32 {
        error_codes::DAEMON_ERROR
    }

    pub fn category(&self) -> ErrorCategory {
        ErrorCategory::External
    }

    pub fn context(&self) -> Value {
        match self {
            DaemonError::Bind { what, reason } => {
                json!({ "operation": "bind", "target": what, "reason": reason })
            }
            DaemonError::AlreadyRunning => {
                json!({ "operation": "startup", "reason": "another instance running" })
            }
            DaemonError::SignalSetup(reason) => {
                json!({ "operation": "signal_setup", "reason": reason })
            }
            DaemonError::Runtime(reason) => json!({ "operation": "runtime", "reason": reason }),
        }
    }

    pub fn suggestion(&self) -> String {
        match self {
            DaemonError::Bind { .. } => {
                "Check that the address is free and the socket directory is writable.".to_string()
            }
            DaemonError::AlreadyRunning => {
                "Another daemon is running. Use 'termrelay list' to talk to it or stop it first."
                    .to_string()
            }
            DaemonError::SignalSetup(_) => {
                "Signal handler setup failed. Check system signal configuration.".to_string()
            }
            DaemonError::Runtime(_) => {
                "Runtime creation failed. Check system thread limits (ulimit -u).".to_string()
            }
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, DaemonError::Bind { .. })
    }
}
