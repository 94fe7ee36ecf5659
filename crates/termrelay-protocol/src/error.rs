use serde_json::{json, Value};
use termrelay_common::error_codes::{self, ErrorCategory};
use thiserror::Error;

/// Wire-level failures.
///
/// `Malformed` and `UnknownCommand` concern a single message: the message is
/// dropped and the stream continues. The remaining variants leave the stream
/// unusable.
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Malformed frame: {0}")]
    Malformed(String),
    #[error("Unknown command byte 0x{0:02x}")]
    UnknownCommand(u8),
    #[error("Invalid stream preamble: {0}")]
    BadPreamble(String),
    #[error("Frame exceeds {max_bytes} bytes")]
    FrameTooLarge { max_bytes: usize },
    #[error("Stream I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ProtocolError {
    /// Returns true when the connection cannot continue after this error.
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            ProtocolError::Malformed(_) | ProtocolError::UnknownCommand(_)
        )
    }

    pub fn code(&self) -> i32 {
        match self {
            ProtocolError::Io(_) => error_codes::STREAM_ERROR,
            _ => error_codes::PROTOCOL_ERROR,
        }
    }

    pub fn category(&self) -> ErrorCategory {
        error_codes::category_for_code(self.code())
    }

    pub fn context(&self) -> Value {
        match self {
            ProtocolError::Malformed(reason) | ProtocolError::BadPreamble(reason) => {
                json!({ "reason": reason })
            }
            ProtocolError::UnknownCommand(byte) => json!({ "command": byte }),
            ProtocolError::FrameTooLarge { max_bytes } => json!({ "max_bytes": max_bytes }),
            ProtocolError::Io(e) => json!({ "reason": e.to_string() }),
        }
    }
}
