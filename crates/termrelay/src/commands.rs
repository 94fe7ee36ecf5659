use std::net::SocketAddr;
use std::path::PathBuf;

use clap::Parser;
use clap::Subcommand;

const LONG_ABOUT: &str = r#"termrelay relays interactive shell sessions over a framed TCP stream.

WORKFLOW:
    1. Start the daemon: it listens for relay connections and serves the
       admission API on a Unix control socket
    2. Admit a session for an owner (per-user and global caps apply)
    3. Attach to it: a shell is started at the session's size and relayed
    4. Close it, or let the idle sweep close it after the timeout

EXAMPLES:
    termrelay serve --listen 0.0.0.0:7681
    termrelay create --owner alice --cols 120 --rows 40
    termrelay attach 3f0c...
    termrelay user-sessions alice
    termrelay tune --max-sessions-per-user 3
    termrelay close 3f0c... --reason "done""#;

#[derive(Parser)]
#[command(name = "termrelay")]
#[command(author, version)]
#[command(about = "Terminal session relay with per-user admission control")]
#[command(long_about = LONG_ABOUT)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Control socket of the daemon
    #[arg(long, global = true, env = "TERMRELAY_CONTROL_SOCKET")]
    pub socket: Option<PathBuf>,

    /// Print raw JSON results
    #[arg(long, global = true)]
    pub json: bool,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the relay daemon in the foreground
    Serve(ServeArgs),

    /// Admit a new session
    Create(CreateArgs),

    /// Close an active session
    Close {
        session_id: String,

        /// Free-form reason stored with the session
        #[arg(long, default_value = "")]
        reason: String,
    },

    /// Show one session, active or recently closed
    Get { session_id: String },

    /// List active sessions
    #[command(alias = "ls")]
    List,

    /// List active sessions of one owner
    UserSessions { owner_id: String },

    /// Show session and relay counters
    Metrics,

    /// Change admission limits at runtime
    Tune(TuneArgs),

    /// Attach this terminal to a session (Ctrl+\ detaches)
    Attach {
        session_id: String,

        /// Relay listen address of the daemon
        #[arg(long, env = "TERMRELAY_RELAY", default_value = termrelay_daemon::DEFAULT_LISTEN_ADDR)]
        relay: SocketAddr,
    },

    /// Check that the daemon answers
    Ping,
}

#[derive(clap::Args, Debug, Default)]
pub struct ServeArgs {
    /// Address for relay connections
    #[arg(long)]
    pub listen: Option<SocketAddr>,

    #[arg(long)]
    pub max_sessions_per_user: Option<usize>,

    #[arg(long)]
    pub max_sessions: Option<usize>,

    /// Idle timeout in seconds
    #[arg(long)]
    pub session_timeout: Option<u64>,

    /// Idle sweep period in seconds
    #[arg(long)]
    pub sweep_interval: Option<u64>,

    /// Keepalive period in seconds
    #[arg(long)]
    pub keepalive: Option<u64>,

    #[arg(long)]
    pub state_file: Option<PathBuf>,

    #[arg(long)]
    pub recording_dir: Option<PathBuf>,

    /// Shell to start, in order of preference (repeatable)
    #[arg(long = "shell")]
    pub shells: Vec<String>,
}

#[derive(clap::Args, Debug)]
pub struct CreateArgs {
    /// Owner the session counts against
    #[arg(long)]
    pub owner: String,

    /// Use this id instead of a generated one
    #[arg(long)]
    pub id: Option<String>,

    /// Opaque target reference stored with the session
    #[arg(long, default_value = "")]
    pub target: String,

    #[arg(long, default_value_t = 80)]
    pub cols: u16,

    #[arg(long, default_value_t = 24)]
    pub rows: u16,

    #[arg(long)]
    pub client_ip: Option<String>,

    /// Record relayed output to the daemon's recording directory
    #[arg(long)]
    pub record: bool,
}

#[derive(clap::Args, Debug)]
#[command(group(
    clap::ArgGroup::new("limits")
        .required(true)
        .multiple(true)
        .args(["max_sessions_per_user", "max_sessions", "session_timeout"])
))]
pub struct TuneArgs {
    #[arg(long)]
    pub max_sessions_per_user: Option<usize>,

    #[arg(long)]
    pub max_sessions: Option<usize>,

    /// Idle timeout in seconds
    #[arg(long)]
    pub session_timeout: Option<u64>,
}
