//! Durable mirror of the session table.
//!
//! The in-memory table in [`crate::SessionManager`] is authoritative. Stores
//! only mirror it so an operator can inspect what was live after a crash;
//! every store failure is logged and swallowed.

use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::BufReader;
use std::io::BufWriter;
use std::os::unix::io::AsRawFd;
use std::path::Path;
use std::path::PathBuf;
use std::sync::mpsc;
use std::sync::Arc;
use std::sync::Mutex;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use std::time::Instant;

use termrelay_common::mutex_lock_or_recover;
use tracing::{debug, warn};

use crate::error::SessionError;
use crate::session::Session;

const STORE_LOCK_TIMEOUT: Duration = Duration::from_secs(5);
const FLUSH_TIMEOUT: Duration = Duration::from_secs(5);

pub trait SessionStore: Send + Sync + 'static {
    fn upsert(&self, session: &Session) -> Result<(), SessionError>;

    fn remove(&self, session_id: &str) -> Result<(), SessionError>;

    fn load(&self) -> Vec<Session>;
}

/// JSON array on disk, rewritten atomically under an exclusive `flock`.
pub struct JsonFileStore {
    path: PathBuf,
    lock_path: PathBuf,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let lock_path = path.with_extension("json.lock");
        Self { path, lock_path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn io_to_persistence(operation: &str, e: std::io::Error) -> SessionError {
        SessionError::Persistence {
            operation: operation.to_string(),
            reason: e.to_string(),
        }
    }

    fn ensure_dir(&self) -> Result<(), SessionError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|e| SessionError::Persistence {
                operation: "create_dir".to_string(),
                reason: format!("Failed to create directory '{}': {}", parent.display(), e),
            })?;
        }
        Ok(())
    }

    fn acquire_lock(&self) -> Result<File, SessionError> {
        self.ensure_dir()?;
        let lock_file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(&self.lock_path)
            .map_err(|e| Self::io_to_persistence("open_lock", e))?;

        let fd = lock_file.as_raw_fd();
        let start = Instant::now();
        let mut backoff = Duration::from_millis(1);

        loop {
            let result = unsafe { libc::flock(fd, libc::LOCK_EX | libc::LOCK_NB) };
            if result == 0 {
                return Ok(lock_file);
            }

            let err = std::io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::EWOULDBLOCK)
                && err.raw_os_error() != Some(libc::EAGAIN)
            {
                return Err(Self::io_to_persistence("flock", err));
            }

            if start.elapsed() > STORE_LOCK_TIMEOUT {
                return Err(SessionError::Persistence {
                    operation: "acquire_lock".to_string(),
                    reason: format!(
                        "lock acquisition timed out after {} seconds",
                        STORE_LOCK_TIMEOUT.as_secs()
                    ),
                });
            }

            thread::sleep(backoff);
            backoff = (backoff * 2).min(Duration::from_millis(100));
        }
    }

    fn load_unlocked(&self) -> Vec<Session> {
        if !self.path.exists() {
            return Vec::new();
        }

        match File::open(&self.path) {
            Ok(file) => match serde_json::from_reader(BufReader::new(file)) {
                Ok(sessions) => sessions,
                Err(e) => {
                    warn!(
                        path = %self.path.display(),
                        error = %e,
                        "Session state file corrupted, starting with empty session list"
                    );
                    Vec::new()
                }
            },
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "Failed to open session state file");
                Vec::new()
            }
        }
    }

    fn save_unlocked(&self, sessions: &[Session]) -> Result<(), SessionError> {
        let temp_path = self.path.with_extension("json.tmp");

        let file = File::create(&temp_path).map_err(|e| SessionError::Persistence {
            operation: "create_temp".to_string(),
            reason: format!("Failed to create temp file '{}': {}", temp_path.display(), e),
        })?;
        serde_json::to_writer_pretty(BufWriter::new(file), sessions).map_err(|e| {
            SessionError::Persistence {
                operation: "write_json".to_string(),
                reason: format!("Failed to write sessions to '{}': {}", temp_path.display(), e),
            }
        })?;

        fs::rename(&temp_path, &self.path).map_err(|e| SessionError::Persistence {
            operation: "rename".to_string(),
            reason: format!(
                "Failed to rename '{}' to '{}': {}",
                temp_path.display(),
                self.path.display(),
                e
            ),
        })
    }
}

impl SessionStore for JsonFileStore {
    fn upsert(&self, session: &Session) -> Result<(), SessionError> {
        let _lock = self.acquire_lock()?;
        let mut sessions = self.load_unlocked();
        sessions.retain(|s| s.session_id != session.session_id);
        sessions.push(session.clone());
        self.save_unlocked(&sessions)
    }

    fn remove(&self, session_id: &str) -> Result<(), SessionError> {
        let _lock = self.acquire_lock()?;
        let mut sessions = self.load_unlocked();
        let before = sessions.len();
        sessions.retain(|s| s.session_id.as_str() != session_id);
        if sessions.len() == before {
            return Ok(());
        }
        self.save_unlocked(&sessions)
    }

    fn load(&self) -> Vec<Session> {
        match self.acquire_lock() {
            Ok(_lock) => self.load_unlocked(),
            Err(e) => {
                warn!(error = %e, "Failed to acquire lock for loading sessions");
                self.load_unlocked()
            }
        }
    }
}

/// Store that lives and dies with the process.
#[derive(Default)]
pub struct MemoryStore {
    sessions: Mutex<BTreeMap<String, Session>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        mutex_lock_or_recover(&self.sessions).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, session_id: &str) -> Option<Session> {
        mutex_lock_or_recover(&self.sessions).get(session_id).cloned()
    }
}

impl SessionStore for MemoryStore {
    fn upsert(&self, session: &Session) -> Result<(), SessionError> {
        mutex_lock_or_recover(&self.sessions)
            .insert(session.session_id.to_string(), session.clone());
        Ok(())
    }

    fn remove(&self, session_id: &str) -> Result<(), SessionError> {
        mutex_lock_or_recover(&self.sessions).remove(session_id);
        Ok(())
    }

    fn load(&self) -> Vec<Session> {
        mutex_lock_or_recover(&self.sessions).values().cloned().collect()
    }
}

enum StoreOp {
    Upsert(Box<Session>),
    Remove(String),
    Flush(mpsc::SyncSender<()>),
}

/// Applies store updates on a dedicated thread, in submission order.
///
/// Callers never wait on disk I/O; [`StoreWriter::flush`] blocks until
/// everything queued before it has been applied.
pub struct StoreWriter {
    tx: Mutex<Option<mpsc::Sender<StoreOp>>>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl StoreWriter {
    pub fn spawn(store: Arc<dyn SessionStore>) -> Self {
        let (tx, rx) = mpsc::channel::<StoreOp>();

        let handle = thread::Builder::new()
            .name("session-store".to_string())
            .spawn(move || {
                for op in rx {
                    match op {
                        StoreOp::Upsert(session) => {
                            if let Err(e) = store.upsert(&session) {
                                warn!(session_id = %session.session_id, error = %e, "Failed to persist session");
                            }
                        }
                        StoreOp::Remove(id) => {
                            if let Err(e) = store.remove(&id) {
                                warn!(session_id = %id, error = %e, "Failed to remove persisted session");
                            }
                        }
                        StoreOp::Flush(done) => {
                            let _ = done.send(());
                        }
                    }
                }
                debug!("Session store writer stopped");
            });

        let handle = match handle {
            Ok(handle) => Some(handle),
            Err(e) => {
                warn!(error = %e, "Failed to start session store writer, persistence disabled");
                None
            }
        };
        let tx = handle.as_ref().map(|_| tx);

        Self {
            tx: Mutex::new(tx),
            handle: Mutex::new(handle),
        }
    }

    fn submit(&self, op: StoreOp) {
        if let Some(tx) = mutex_lock_or_recover(&self.tx).as_ref() {
            if tx.send(op).is_err() {
                debug!("Session store writer gone, dropping update");
            }
        }
    }

    pub fn upsert(&self, session: Session) {
        self.submit(StoreOp::Upsert(Box::new(session)));
    }

    pub fn remove(&self, session_id: &str) {
        self.submit(StoreOp::Remove(session_id.to_string()));
    }

    /// Waits until all previously submitted updates are applied.
    pub fn flush(&self) {
        let (done_tx, done_rx) = mpsc::sync_channel(1);
        self.submit(StoreOp::Flush(done_tx));
        if done_rx.recv_timeout(FLUSH_TIMEOUT).is_err() {
            debug!("Session store flush did not complete");
        }
    }

    /// Drains the queue and stops the writer thread. Later updates are dropped.
    pub fn close(&self) {
        mutex_lock_or_recover(&self.tx).take();
        if let Some(handle) = mutex_lock_or_recover(&self.handle).take() {
            if handle.join().is_err() {
                warn!("Session store writer panicked");
            }
        }
    }
}

impl Drop for StoreWriter {
    fn drop(&mut self) {
        mutex_lock_or_recover(&self.tx).take();
    }
}
