#![deny(clippy::all)]

//! Command-line front end for the termrelay daemon: serving, session
//! admission over the control socket, and interactive attach.

pub mod app;
pub mod attach;
pub mod client;
pub mod commands;
pub mod error;
pub mod output;
pub mod telemetry;

pub use app::run;
pub use client::ControlClient;
pub use commands::Cli;
pub use error::AttachError;
pub use error::ClientError;
