use std::io;
use std::path::PathBuf;

use serde_json::json;
use serde_json::Value;
use termrelay_common::error_codes;
use termrelay_common::ErrorCategory;
use thiserror::Error;

/// Errors talking to the daemon's control socket.
#[derive(Error, Debug)]
pub enum ClientError {
    #[error("Daemon not running (no control socket at {})", .0.display())]
    DaemonNotRunning(PathBuf),

    #[error("Failed to talk to daemon: {0}")]
    ConnectionFailed(#[from] io::Error),

    #[error("Failed to encode or decode a message: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("{message}")]
    Rpc {
        code: i32,
        message: String,
        category: Option<ErrorCategory>,
        suggestion: Option<String>,
        retryable: bool,
    },

    #[error("Invalid response from daemon")]
    InvalidResponse,
}

impl ClientError {
    pub fn code(&self) -> i32 {
        match self {
            ClientError::Rpc { code, .. } => *code,
            ClientError::DaemonNotRunning(_) | ClientError::ConnectionFailed(_) => {
                error_codes::DAEMON_ERROR
            }
            ClientError::Serialization(_) | ClientError::InvalidResponse => {
                error_codes::PARSE_ERROR
            }
        }
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            ClientError::Rpc {
                category: Some(category),
                ..
            } => *category,
            ClientError::DaemonNotRunning(_) => ErrorCategory::NotFound,
            ClientError::ConnectionFailed(_) => ErrorCategory::External,
            _ => error_codes::category_for_code(self.code()),
        }
    }

    pub fn suggestion(&self) -> Option<String> {
        match self {
            ClientError::Rpc { suggestion, .. } => suggestion.clone(),
            ClientError::DaemonNotRunning(_) => {
                Some("Start the daemon with 'termrelay serve' or point --socket at it.".to_string())
            }
            ClientError::ConnectionFailed(_) => {
                Some("The daemon may have stopped. Check its log and restart it.".to_string())
            }
            ClientError::Serialization(_) | ClientError::InvalidResponse => {
                Some("The daemon and CLI versions may differ. Run 'termrelay ping'.".to_string())
            }
        }
    }

    pub fn is_retryable(&self) -> bool {
        match self {
            ClientError::Rpc { retryable, .. } => *retryable,
            ClientError::ConnectionFailed(_) => true,
            _ => false,
        }
    }

    /// sysexits.h-style exit code.
    pub fn exit_code(&self) -> i32 {
        exit_code_for(self.category())
    }
}

/// Errors from an interactive attach.
#[derive(Error, Debug)]
pub enum AttachError {
    #[error("Terminal error: {0}")]
    Terminal(#[source] io::Error),

    #[error("Failed to connect to relay at {addr}: {reason}")]
    Connect { addr: String, reason: String },

    #[error("Relay stream failed: {0}")]
    Stream(String),

    #[error("Event read failed")]
    EventRead,
}

impl AttachError {
    pub fn code(&self) -> i32 {
        match self {
            AttachError::Connect { .. } | AttachError::Stream(_) => error_codes::STREAM_ERROR,
            AttachError::Terminal(_) | AttachError::EventRead => error_codes::PTY_ERROR,
        }
    }

    pub fn category(&self) -> ErrorCategory {
        ErrorCategory::External
    }

    pub fn context(&self) -> Value {
        match self {
            AttachError::Terminal(e) => json!({ "operation": "terminal", "reason": e.to_string() }),
            AttachError::Connect { addr, reason } => {
                json!({ "operation": "connect", "addr": addr, "reason": reason })
            }
            AttachError::Stream(reason) => json!({ "operation": "stream", "reason": reason }),
            AttachError::EventRead => json!({
                "operation": "event_read",
                "reason": "Failed to read terminal events"
            }),
        }
    }

    pub fn suggestion(&self) -> String {
        match self {
            AttachError::Terminal(_) | AttachError::EventRead => {
                "Terminal mode error. Try restarting your terminal.".to_string()
            }
            AttachError::Connect { .. } => {
                "Check that the daemon is running and --relay points at its listen address."
                    .to_string()
            }
            AttachError::Stream(_) => {
                "The session may have ended. Run 'termrelay get <id>' to check its status."
                    .to_string()
            }
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, AttachError::Connect { .. })
    }

    pub fn exit_code(&self) -> i32 {
        exit_code_for(self.category())
    }
}

/// Maps an error category to a sysexits.h exit code.
pub fn exit_code_for(category: ErrorCategory) -> i32 {
    match category {
        ErrorCategory::InvalidInput => 64, // EX_USAGE
        ErrorCategory::NotFound => 69,     // EX_UNAVAILABLE
        ErrorCategory::Busy => 73,         // EX_CANTCREAT
        ErrorCategory::External => 74,     // EX_IOERR
        ErrorCategory::Internal => 70,     // EX_SOFTWARE
    }
}
