use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

use crate::error::ProtocolError;

/// Command byte for raw keystrokes.
pub const CMD_INPUT: u8 = 0x00;
/// Command byte for a window size change.
pub const CMD_RESIZE: u8 = 0x01;

const RESIZE_PAYLOAD_LEN: usize = 4;

/// Terminal dimensions in character cells.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowSize {
    pub cols: u16,
    pub rows: u16,
}

impl WindowSize {
    pub fn new(cols: u16, rows: u16) -> Self {
        Self { cols, rows }
    }
}

impl Default for WindowSize {
    fn default() -> Self {
        Self { cols: 80, rows: 24 }
    }
}

impl std::fmt::Display for WindowSize {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}x{}", self.cols, self.rows)
    }
}

/// A message sent by the caller to the relay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundFrame {
    /// Zero-length message. Liveness only; never forwarded to the process.
    Keepalive,
    /// Bytes to write verbatim to the terminal process.
    Input(Bytes),
    Resize(WindowSize),
}

impl InboundFrame {
    /// Interprets one transport message.
    ///
    /// Never panics. Empty payloads are keepalives, not input. Unknown
    /// command bytes and short resize payloads return a non-fatal error so
    /// the caller can drop the message and keep reading.
    pub fn decode(message: Bytes) -> Result<Self, ProtocolError> {
        let Some(&command) = message.first() else {
            return Ok(InboundFrame::Keepalive);
        };
        let payload = message.slice(1..);

        match command {
            CMD_INPUT => Ok(InboundFrame::Input(payload)),
            CMD_RESIZE => decode_resize(&payload).map(InboundFrame::Resize),
            other => Err(ProtocolError::UnknownCommand(other)),
        }
    }

    /// Serializes this frame as the body of one transport message.
    pub fn encode(&self) -> Bytes {
        match self {
            InboundFrame::Keepalive => Bytes::new(),
            InboundFrame::Input(data) => {
                let mut buf = BytesMut::with_capacity(1 + data.len());
                buf.put_u8(CMD_INPUT);
                buf.extend_from_slice(data);
                buf.freeze()
            }
            InboundFrame::Resize(size) => {
                let mut buf = BytesMut::with_capacity(1 + RESIZE_PAYLOAD_LEN);
                buf.put_u8(CMD_RESIZE);
                buf.put_u16(size.cols);
                buf.put_u16(size.rows);
                buf.freeze()
            }
        }
    }
}

fn decode_resize(payload: &[u8]) -> Result<WindowSize, ProtocolError> {
    let bytes: [u8; RESIZE_PAYLOAD_LEN] = payload.try_into().map_err(|_| {
        ProtocolError::Malformed(format!(
            "resize payload is {} bytes, expected {}",
            payload.len(),
            RESIZE_PAYLOAD_LEN
        ))
    })?;
    let cols = u16::from_be_bytes([bytes[0], bytes[1]]);
    let rows = u16::from_be_bytes([bytes[2], bytes[3]]);
    if cols == 0 || rows == 0 {
        return Err(ProtocolError::Malformed(format!(
            "resize to {}x{} has a zero dimension",
            cols, rows
        )));
    }
    Ok(WindowSize { cols, rows })
}

/// A message sent by the relay to the caller.
///
/// Output carries no command byte: the body is exactly what the process
/// wrote.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundFrame {
    Keepalive,
    Output(Bytes),
}

impl OutboundFrame {
    pub fn decode(message: Bytes) -> Self {
        if message.is_empty() {
            OutboundFrame::Keepalive
        } else {
            OutboundFrame::Output(message)
        }
    }

    pub fn encode(&self) -> Bytes {
        match self {
            OutboundFrame::Keepalive => Bytes::new(),
            OutboundFrame::Output(data) => data.clone(),
        }
    }
}
