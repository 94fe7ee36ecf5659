#![deny(clippy::all)]

//! Wire format spoken between a relay and the caller that drives a session.
//!
//! A physical connection carries a sequence of length-prefixed messages
//! ([`MessageCodec`]). The first message is a [`preamble`] naming the
//! session; every later message is an [`InboundFrame`] (caller to relay) or
//! an [`OutboundFrame`] (relay to caller).

mod codec;
pub mod error;
mod frame;
pub mod preamble;

pub use codec::MessageCodec;
pub use codec::DEFAULT_MAX_FRAME_BYTES;
pub use error::ProtocolError;
pub use frame::InboundFrame;
pub use frame::OutboundFrame;
pub use frame::WindowSize;
pub use frame::CMD_INPUT;
pub use frame::CMD_RESIZE;
pub use preamble::PREAMBLE_MARKER;

pub type Result<T> = std::result::Result<T, ProtocolError>;
