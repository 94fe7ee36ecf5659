#![allow(clippy::print_stdout)]

//! Runs one parsed CLI command.

use std::time::Duration;

use anyhow::Context;
use serde_json::json;
use serde_json::Value;
use termrelay_daemon::start_daemon;
use termrelay_daemon::DaemonError;
use termrelay_daemon::RelayConfig;

use crate::attach;
use crate::attach::AttachOutcome;
use crate::client::ControlClient;
use crate::commands::Cli;
use crate::commands::Commands;
use crate::commands::CreateArgs;
use crate::commands::ServeArgs;
use crate::commands::TuneArgs;
use crate::error::AttachError;
use crate::error::ClientError;
use crate::output;
use crate::telemetry::init_tracing;

const GENERAL_ERROR: i32 = 1;
const IOERR: i32 = 74;
const RETRY_HINT: &str = "(This error may be transient - retry may succeed)";

/// Runs `cli` and returns the process exit code.
pub fn run(cli: Cli) -> i32 {
    match execute(cli) {
        Ok(()) => 0,
        Err(e) => handle_error(e),
    }
}

fn handle_error(e: anyhow::Error) -> i32 {
    if let Some(client_error) = e.downcast_ref::<ClientError>() {
        eprintln!("Error: {}", client_error);
        if let Some(suggestion) = client_error.suggestion() {
            eprintln!("Suggestion: {}", suggestion);
        }
        if client_error.is_retryable() {
            eprintln!("{}", RETRY_HINT);
        }
        client_error.exit_code()
    } else if let Some(attach_error) = e.downcast_ref::<AttachError>() {
        eprintln!("Error: {}", attach_error);
        eprintln!("Suggestion: {}", attach_error.suggestion());
        if attach_error.is_retryable() {
            eprintln!("{}", RETRY_HINT);
        }
        attach_error.exit_code()
    } else if let Some(daemon_error) = e.downcast_ref::<DaemonError>() {
        eprintln!("Error: {}", daemon_error);
        eprintln!("Suggestion: {}", daemon_error.suggestion());
        IOERR
    } else {
        eprintln!("Error: {:#}", e);
        GENERAL_ERROR
    }
}

fn execute(cli: Cli) -> anyhow::Result<()> {
    let Cli {
        command,
        socket,
        json: as_json,
    } = cli;

    if let Commands::Serve(args) = command {
        let _telemetry = init_tracing("info");
        let mut config = serve_config(args);
        if let Some(socket) = socket {
            config = config.with_control_socket(socket);
        }
        start_daemon(config)?;
        return Ok(());
    }

    let _telemetry = init_tracing("warn");
    let socket = socket.unwrap_or_else(termrelay_daemon::default_control_socket);

    if let Commands::Attach { session_id, relay } = command {
        let keepalive = RelayConfig::from_env().keepalive_interval;
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .context("failed to start async runtime")?;
        let outcome = runtime.block_on(attach::attach(relay, &session_id, keepalive))?;
        match outcome {
            AttachOutcome::Detached => eprintln!("\r\nDetached from {}", session_id),
            AttachOutcome::Closed => eprintln!("\r\nSession {} closed", session_id),
        }
        return Ok(());
    }

    let client = ControlClient::connect(socket)?;
    let print = |value: Value, render: fn(&Value) -> String| {
        if as_json {
            println!("{}", serde_json::to_string_pretty(&value).unwrap_or_default());
        } else {
            print!("{}", render(&value));
        }
    };

    match command {
        Commands::Serve(_) | Commands::Attach { .. } => {}
        Commands::Create(args) => {
            print(client.call("create_session", Some(create_params(args)))?, output::render_session)
        }
        Commands::Close { session_id, reason } => print(
            client.call(
                "close_session",
                Some(json!({ "session_id": session_id, "reason": reason })),
            )?,
            output::render_session,
        ),
        Commands::Get { session_id } => print(
            client.call("get_session", Some(json!({ "session_id": session_id })))?,
            output::render_session,
        ),
        Commands::List => print(
            client.call("list_sessions", None)?,
            output::render_session_list,
        ),
        Commands::UserSessions { owner_id } => print(
            client.call("user_sessions", Some(json!({ "owner_id": owner_id })))?,
            output::render_session_list,
        ),
        Commands::Metrics => print(client.call("metrics", None)?, output::render_metrics),
        Commands::Tune(args) => {
            let mut limits = Value::Null;
            for (method, params) in tune_calls(&args) {
                limits = client.call(method, Some(params))?;
            }
            print(limits, output::render_limits);
        }
        Commands::Ping => {
            let result = client.call("ping", None)?;
            if as_json {
                println!("{}", result);
            } else {
                println!(
                    "Daemon is running (version {})",
                    result["version"].as_str().unwrap_or("unknown")
                );
            }
        }
    }
    Ok(())
}

/// Zero limits and intervals keep their configured values.
fn serve_config(args: ServeArgs) -> RelayConfig {
    let mut config = RelayConfig::from_env();
    if let Some(addr) = args.listen {
        config = config.with_listen_addr(addr);
    }
    if let Some(max) = args.max_sessions_per_user.filter(|n| *n > 0) {
        config = config.with_max_sessions_per_user(max);
    }
    if let Some(max) = args.max_sessions.filter(|n| *n > 0) {
        config = config.with_max_sessions(max);
    }
    if let Some(secs) = args.session_timeout.filter(|n| *n > 0) {
        config = config.with_session_timeout(Duration::from_secs(secs));
    }
    if let Some(secs) = args.sweep_interval.filter(|n| *n > 0) {
        config = config.with_sweep_interval(Duration::from_secs(secs));
    }
    if let Some(secs) = args.keepalive.filter(|n| *n > 0) {
        config = config.with_keepalive_interval(Duration::from_secs(secs));
    }
    if let Some(path) = args.state_file {
        config = config.with_state_file(path);
    }
    if let Some(dir) = args.recording_dir {
        config = config.with_recording_dir(dir);
    }
    if !args.shells.is_empty() {
        config = config.with_shells(args.shells);
    }
    config
}

fn create_params(args: CreateArgs) -> Value {
    let mut params = json!({
        "owner_id": args.owner,
        "target_ref": args.target,
        "cols": args.cols,
        "rows": args.rows,
        "recording_enabled": args.record,
    });
    if let Some(id) = args.id {
        params["session_id"] = json!(id);
    }
    if let Some(ip) = args.client_ip {
        params["client_ip"] = json!(ip);
    }
    params
}

fn tune_calls(args: &TuneArgs) -> Vec<(&'static str, Value)> {
    let mut calls = Vec::new();
    if let Some(max) = args.max_sessions_per_user {
        calls.push(("set_max_sessions_per_user", json!({ "max": max })));
    }
    if let Some(max) = args.max_sessions {
        calls.push(("set_max_sessions", json!({ "max": max })));
    }
    if let Some(secs) = args.session_timeout {
        calls.push(("set_session_timeout", json!({ "seconds": secs })));
    }
    calls
}
