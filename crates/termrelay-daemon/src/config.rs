use std::env;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use termrelay_protocol::DEFAULT_MAX_FRAME_BYTES;
use termrelay_pty::default_shells;

pub const DEFAULT_LISTEN_ADDR: &str = "127.0.0.1:7681";
pub const DEFAULT_MAX_SESSIONS_PER_USER: usize = 5;
pub const DEFAULT_MAX_SESSIONS: usize = 100;
pub const DEFAULT_SESSION_TIMEOUT_SECS: u64 = 30 * 60;
pub const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 120;
pub const DEFAULT_KEEPALIVE_SECS: u64 = 30;
pub const DEFAULT_READ_CHUNK_SIZE: usize = 8192;
pub const DEFAULT_HISTORY_LIMIT: usize = 256;
const DEFAULT_PREAMBLE_TIMEOUT_SECS: u64 = 10;

const MIN_READ_CHUNK_SIZE: usize = 8 * 1024;
const MAX_READ_CHUNK_SIZE: usize = 64 * 1024;

#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub listen_addr: SocketAddr,
    pub control_socket: PathBuf,
    pub max_sessions_per_user: usize,
    pub max_sessions: usize,
    pub session_timeout: Duration,
    pub sweep_interval: Duration,
    pub keepalive_interval: Duration,
    pub read_chunk_size: usize,
    pub max_frame_bytes: usize,
    pub preamble_timeout: Duration,
    pub history_limit: usize,
    pub recording_dir: PathBuf,
    pub state_file: PathBuf,
    pub shells: Vec<String>,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            control_socket: default_control_socket(),
            max_sessions_per_user: DEFAULT_MAX_SESSIONS_PER_USER,
            max_sessions: DEFAULT_MAX_SESSIONS,
            session_timeout: Duration::from_secs(DEFAULT_SESSION_TIMEOUT_SECS),
            sweep_interval: Duration::from_secs(DEFAULT_SWEEP_INTERVAL_SECS),
            keepalive_interval: Duration::from_secs(DEFAULT_KEEPALIVE_SECS),
            read_chunk_size: DEFAULT_READ_CHUNK_SIZE,
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
            preamble_timeout: Duration::from_secs(DEFAULT_PREAMBLE_TIMEOUT_SECS),
            history_limit: DEFAULT_HISTORY_LIMIT,
            recording_dir: home_dir().join(".termrelay").join("recordings"),
            state_file: home_dir().join(".termrelay").join("sessions.json"),
            shells: default_shells(),
        }
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    env::var(name).ok().and_then(|v| v.trim().parse().ok())
}

fn env_positive<T: std::str::FromStr + PartialOrd + Default>(name: &str) -> Option<T> {
    env_parse(name).filter(|n: &T| *n > T::default())
}

fn home_dir() -> PathBuf {
    env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
}

/// Control socket path, honouring `XDG_RUNTIME_DIR` when set.
pub fn default_control_socket() -> PathBuf {
    env::var("XDG_RUNTIME_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
        .join("termrelay.sock")
}

fn default_listen_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 7681))
}

impl RelayConfig {
    /// Defaults overridden by any `TERMRELAY_*` variables that parse.
    /// Zero counts and durations are ignored.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(addr) = env_parse("TERMRELAY_LISTEN") {
            config.listen_addr = addr;
        }
        if let Ok(path) = env::var("TERMRELAY_CONTROL_SOCKET") {
            config.control_socket = PathBuf::from(path);
        }
        if let Some(max) = env_positive("TERMRELAY_MAX_SESSIONS_PER_USER") {
            config.max_sessions_per_user = max;
        }
        if let Some(max) = env_positive("TERMRELAY_MAX_SESSIONS") {
            config.max_sessions = max;
        }
        if let Some(secs) = env_positive("TERMRELAY_SESSION_TIMEOUT") {
            config.session_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = env_positive("TERMRELAY_SWEEP_INTERVAL") {
            config.sweep_interval = Duration::from_secs(secs);
        }
        if let Some(secs) = env_positive("TERMRELAY_KEEPALIVE") {
            config.keepalive_interval = Duration::from_secs(secs);
        }
        if let Some(chunk) = env_parse("TERMRELAY_READ_CHUNK") {
            config.read_chunk_size = clamp_chunk(chunk);
        }
        if let Some(max) = env_positive("TERMRELAY_MAX_FRAME") {
            config.max_frame_bytes = max;
        }
        if let Ok(dir) = env::var("TERMRELAY_RECORDING_DIR") {
            config.recording_dir = PathBuf::from(dir);
        }
        if let Ok(path) = env::var("TERMRELAY_STATE_FILE") {
            config.state_file = PathBuf::from(path);
        }
        if let Ok(list) = env::var("TERMRELAY_SHELLS") {
            let shells = parse_shell_list(&list);
            if !shells.is_empty() {
                config.shells = shells;
            }
        }
        config
    }

    /// Inbound silence after which the caller is considered gone.
    pub fn idle_read_timeout(&self) -> Duration {
        self.keepalive_interval * 3
    }

    pub fn with_listen_addr(mut self, addr: SocketAddr) -> Self {
        self.listen_addr = addr;
        self
    }

    pub fn with_control_socket(mut self, path: impl Into<PathBuf>) -> Self {
        self.control_socket = path.into();
        self
    }

    pub fn with_max_sessions_per_user(mut self, max: usize) -> Self {
        self.max_sessions_per_user = max;
        self
    }

    pub fn with_max_sessions(mut self, max: usize) -> Self {
        self.max_sessions = max;
        self
    }

    pub fn with_session_timeout(mut self, timeout: Duration) -> Self {
        self.session_timeout = timeout;
        self
    }

    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    pub fn with_keepalive_interval(mut self, interval: Duration) -> Self {
        self.keepalive_interval = interval;
        self
    }

    pub fn with_read_chunk_size(mut self, size: usize) -> Self {
        self.read_chunk_size = clamp_chunk(size);
        self
    }

    pub fn with_max_frame_bytes(mut self, max: usize) -> Self {
        self.max_frame_bytes = max;
        self
    }

    pub fn with_preamble_timeout(mut self, timeout: Duration) -> Self {
        self.preamble_timeout = timeout;
        self
    }

    pub fn with_history_limit(mut self, limit: usize) -> Self {
        self.history_limit = limit;
        self
    }

    pub fn with_recording_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.recording_dir = dir.into();
        self
    }

    pub fn with_state_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.state_file = path.into();
        self
    }

    pub fn with_shells(mut self, shells: Vec<String>) -> Self {
        self.shells = shells;
        self
    }
}

fn clamp_chunk(size: usize) -> usize {
    size.clamp(MIN_READ_CHUNK_SIZE, MAX_READ_CHUNK_SIZE)
}

fn parse_shell_list(value: &str) -> Vec<String> {
    value
        .split(':')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}
