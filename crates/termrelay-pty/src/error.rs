//! PTY errors with structured context.
//!
//! Each variant carries a semantic code, a category and a suggestion so the
//! control socket can report spawn failures without string matching.

use serde_json::{json, Value};
use termrelay_common::error_codes::{self, ErrorCategory};
use thiserror::Error;

/// PTY operation errors with structured context.
#[derive(Error, Debug)]
pub enum PtyError {
    #[error("No usable shell found (tried: {})", tried.join(", "))]
    NoShellFound { tried: Vec<String> },
    #[error("Failed to open PTY: {0}")]
    Open(String),
    #[error("Failed to spawn process: {0}")]
    Spawn(String),
    #[error("Failed to write to PTY: {0}")]
    Write(String),
    #[error("Failed to read from PTY: {0}")]
    Read(String),
    #[error("Failed to resize PTY: {0}")]
    Resize(String),
    #[error("PTY is closed")]
    Closed,
}

impl PtyError {
    pub fn code(&self) -> i32 {
        match self {
            PtyError::NoShellFound { .. } => error_codes::NO_SHELL_FOUND,
            _ => error_codes::PTY_ERROR,
        }
    }

    pub fn category(&self) -> ErrorCategory {
        ErrorCategory::External
    }

    /// Returns structured context about the error for debugging.
    pub fn context(&self) -> Value {
        match self {
            PtyError::NoShellFound { tried } => json!({
                "operation": "spawn",
                "tried": tried
            }),
            PtyError::Closed => json!({
                "operation": self.operation(),
                "reason": "closed"
            }),
            _ => json!({
                "operation": self.operation(),
                "reason": self.reason()
            }),
        }
    }

    /// Returns a helpful suggestion for resolving the error.
    pub fn suggestion(&self) -> String {
        match self {
            PtyError::NoShellFound { .. } => {
                "No shell could be resolved. Set TERMRELAY_SHELLS to a ':'-separated list of executable paths."
                    .to_string()
            }
            PtyError::Open(_) => {
                "PTY allocation failed. Check system resource limits (ulimit -n) or /dev/pts availability."
                    .to_string()
            }
            PtyError::Spawn(reason) => {
                if reason.contains("Permission denied") {
                    "Permission denied. Check file permissions of the configured shell.".to_string()
                } else {
                    "Process spawn failed. Check the configured shell and its environment.".to_string()
                }
            }
            PtyError::Write(_) | PtyError::Read(_) | PtyError::Closed => {
                "The terminal process has ended. Open a new session.".to_string()
            }
            PtyError::Resize(_) => {
                "Resize failed; the session keeps its previous dimensions.".to_string()
            }
        }
    }

    /// Returns whether this error is potentially transient and may succeed on retry.
    pub fn is_retryable(&self) -> bool {
        matches!(self, PtyError::Open(_))
    }

    /// Returns the operation that failed.
    pub fn operation(&self) -> &'static str {
        match self {
            PtyError::NoShellFound { .. } | PtyError::Spawn(_) => "spawn",
            PtyError::Open(_) => "open",
            PtyError::Write(_) => "write",
            PtyError::Read(_) => "read",
            PtyError::Resize(_) => "resize",
            PtyError::Closed => "io",
        }
    }

    /// Returns the underlying reason for the error.
    pub fn reason(&self) -> &str {
        match self {
            PtyError::Open(r)
            | PtyError::Spawn(r)
            | PtyError::Write(r)
            | PtyError::Read(r)
            | PtyError::Resize(r) => r,
            PtyError::NoShellFound { .. } => "no shell found",
            PtyError::Closed => "closed",
        }
    }
}
