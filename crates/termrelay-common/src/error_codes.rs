//! Semantic error codes shared by the control socket and the CLI.
//!
//! Codes live in the JSON-RPC server range (-32000 to -32099) so control
//! clients can treat them like any other JSON-RPC domain error.

// Session-related errors
pub const SESSION_NOT_FOUND: i32 = -32001;
pub const SESSION_EXISTS: i32 = -32002;
pub const SESSION_ATTACHED: i32 = -32003;
pub const PER_USER_LIMIT: i32 = -32004;
pub const GLOBAL_LIMIT: i32 = -32005;
pub const INVALID_SESSION_ID: i32 = -32006;
pub const INVALID_SETTING: i32 = -32007;

// Process errors
pub const PTY_ERROR: i32 = -32008;
pub const NO_SHELL_FOUND: i32 = -32009;

// Wire errors
pub const PROTOCOL_ERROR: i32 = -32010;
pub const STREAM_ERROR: i32 = -32011;

// Daemon errors
pub const DAEMON_ERROR: i32 = -32016;
pub const PERSISTENCE_ERROR: i32 = -32017;

// Request-level errors (JSON-RPC reserved range)
pub const PARSE_ERROR: i32 = -32700;
pub const METHOD_NOT_FOUND: i32 = -32601;
pub const INVALID_PARAMS: i32 = -32602;

/// Coarse class of an error, carried next to the numeric code so clients can
/// react without knowing every code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// No such session (or it already closed).
    NotFound,
    InvalidInput,
    /// A cap is reached or the session is in use.
    Busy,
    Internal,
    /// PTY, process or disk failure.
    External,
}

impl ErrorCategory {
    pub const ALL: [ErrorCategory; 5] = [
        Self::NotFound,
        Self::InvalidInput,
        Self::Busy,
        Self::Internal,
        Self::External,
    ];

    /// Wire name used in error `data.category`.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotFound => "not_found",
            Self::InvalidInput => "invalid_input",
            Self::Busy => "busy",
            Self::Internal => "internal",
            Self::External => "external",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownCategory(pub String);

impl std::fmt::Display for UnknownCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "unknown error category '{}'", self.0)
    }
}

impl std::error::Error for UnknownCategory {}

impl std::str::FromStr for ErrorCategory {
    type Err = UnknownCategory;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|category| category.as_str() == s)
            .ok_or_else(|| UnknownCategory(s.to_string()))
    }
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Returns whether an error code represents a condition that may clear on retry.
///
/// Only the global limit qualifies: the caller can wait for capacity. A
/// per-user limit needs the caller to close one of its own sessions first.
pub fn is_retryable(code: i32) -> bool {
    matches!(code, GLOBAL_LIMIT | PERSISTENCE_ERROR)
}

/// Codes this module does not name fall back to `Internal`.
pub fn category_for_code(code: i32) -> ErrorCategory {
    match code {
        SESSION_NOT_FOUND => ErrorCategory::NotFound,
        INVALID_SESSION_ID | INVALID_SETTING | INVALID_PARAMS | PARSE_ERROR
        | METHOD_NOT_FOUND | PROTOCOL_ERROR => ErrorCategory::InvalidInput,
        SESSION_EXISTS | SESSION_ATTACHED | PER_USER_LIMIT | GLOBAL_LIMIT => ErrorCategory::Busy,
        PTY_ERROR | NO_SHELL_FOUND | STREAM_ERROR | DAEMON_ERROR | PERSISTENCE_ERROR => {
            ErrorCategory::External
        }
        _ => ErrorCategory::Internal,
    }
}
