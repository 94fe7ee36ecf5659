#![deny(clippy::all)]

//! Session lifecycle manager and terminal relay.
//!
//! [`SessionManager`] admits and tracks sessions; [`RelayListener`] accepts
//! caller connections and drives each attached session through a
//! [`RelayPump`]; [`ControlServer`] exposes the admission API on a Unix
//! socket. [`start_daemon`] wires all of it together.

mod config;
pub mod control;
mod error;
mod listener;
mod manager;
mod metrics;
mod recording;
pub mod relay;
pub mod rpc;
mod server;
mod session;
mod signal_handler;
mod store;
mod sweeper;

#[cfg(test)]
pub(crate) mod test_support;

pub use config::default_control_socket;
pub use config::RelayConfig;
pub use config::DEFAULT_KEEPALIVE_SECS;
pub use config::DEFAULT_LISTEN_ADDR;
pub use config::DEFAULT_MAX_SESSIONS;
pub use config::DEFAULT_MAX_SESSIONS_PER_USER;
pub use config::DEFAULT_SESSION_TIMEOUT_SECS;
pub use control::ControlHandler;
pub use control::ControlServer;
pub use error::DaemonError;
pub use error::RelayError;
pub use error::SessionError;
pub use listener::RelayListener;
pub use manager::SessionLease;
pub use manager::SessionManager;
pub use metrics::RelayMetrics;
pub use metrics::SessionMetrics;
pub use recording::FileRecorder;
pub use recording::RecordingSink;
pub use relay::RelayOptions;
pub use relay::RelayOutcome;
pub use relay::RelayPump;
pub use relay::SessionEvents;
pub use rpc::RpcRequest;
pub use rpc::RpcResponse;
pub use server::start_daemon;
pub use server::RunningDaemon;
pub use session::CloseReason;
pub use session::CreateSessionRequest;
pub use session::Session;
pub use session::SessionId;
pub use session::SessionStatus;
pub use signal_handler::SignalHandler;
pub use store::JsonFileStore;
pub use store::MemoryStore;
pub use store::SessionStore;
pub use store::StoreWriter;
pub use sweeper::spawn_sweeper;

pub type Result<T> = std::result::Result<T, SessionError>;
