#![deny(clippy::all)]

pub mod error;
mod process;
mod pty;
mod resolve;

pub use error::PtyError;
pub use process::ReadStatus;
pub use process::TerminalProcess;
pub use pty::PtyHandle;
pub use pty::SpawnOptions;
pub use resolve::default_shells;
pub use resolve::resolve_program;

pub type Result<T> = std::result::Result<T, PtyError>;
