//! Session lifecycle manager.
//!
//! Owns the table of active sessions, enforces the per-user and global caps,
//! tracks activity and closes sessions through a single path shared by
//! explicit close, relay teardown, idle sweep and shutdown.
//!
//! # Lock Ordering
//!
//! `table` → entry mutex → `history`. The per-byte path (`update_activity`)
//! takes only the table read lock and one entry mutex.

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::collections::VecDeque;
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::RwLock;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use termrelay_common::{mutex_lock_or_recover, rwlock_read_or_recover, rwlock_write_or_recover};
use termrelay_protocol::WindowSize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::RelayConfig;
use crate::config::{
    DEFAULT_MAX_SESSIONS, DEFAULT_MAX_SESSIONS_PER_USER, DEFAULT_SESSION_TIMEOUT_SECS,
};
use crate::error::SessionError;
use crate::metrics::SessionMetrics;
use crate::relay::SessionEvents;
use crate::session::{CloseReason, CreateSessionRequest, Session, SessionId, SessionStatus};
use crate::store::{SessionStore, StoreWriter};

/// Activity updates are mirrored to the store at most this often per session.
const ACTIVITY_PERSIST_INTERVAL: Duration = Duration::from_secs(5);

struct SessionEntry {
    session: Session,
    cancel: CancellationToken,
    attached: bool,
    persisted_at: Instant,
}

#[derive(Default)]
struct SessionTable {
    sessions: HashMap<SessionId, Arc<Mutex<SessionEntry>>>,
    per_owner: HashMap<String, usize>,
    opened_total: u64,
    closed_total: u64,
    rejected_total: u64,
}

/// Everything the relay listener needs to drive an attached session.
#[derive(Debug, Clone)]
pub struct SessionLease {
    pub session_id: SessionId,
    pub owner_id: String,
    pub dimensions: WindowSize,
    pub recording_path: Option<PathBuf>,
    pub cancel: CancellationToken,
}

pub struct SessionManager {
    table: RwLock<SessionTable>,
    history: Mutex<VecDeque<Session>>,
    history_limit: usize,
    max_sessions_per_user: AtomicUsize,
    max_sessions: AtomicUsize,
    session_timeout_ms: AtomicU64,
    recording_dir: PathBuf,
    root: CancellationToken,
    writer: StoreWriter,
}

impl SessionManager {
    /// Creates the manager and its store writer thread.
    ///
    /// Records left in the store by a previous run cannot be resumed (their
    /// processes died with it) and are cleared.
    pub fn new(config: &RelayConfig, store: Arc<dyn SessionStore>) -> Self {
        let stale = store.load();
        if !stale.is_empty() {
            info!(count = stale.len(), "Clearing sessions left by a previous run");
            for session in &stale {
                if let Err(e) = store.remove(session.session_id.as_str()) {
                    warn!(session_id = %session.session_id, error = %e, "Failed to clear stale session");
                }
            }
        }

        Self {
            table: RwLock::new(SessionTable::default()),
            history: Mutex::new(VecDeque::new()),
            history_limit: config.history_limit,
            max_sessions_per_user: AtomicUsize::new(nonzero_or(
                config.max_sessions_per_user,
                DEFAULT_MAX_SESSIONS_PER_USER,
            )),
            max_sessions: AtomicUsize::new(nonzero_or(config.max_sessions, DEFAULT_MAX_SESSIONS)),
            session_timeout_ms: AtomicU64::new(nonzero_or(
                duration_ms(config.session_timeout),
                DEFAULT_SESSION_TIMEOUT_SECS * 1000,
            )),
            recording_dir: config.recording_dir.clone(),
            root: CancellationToken::new(),
            writer: StoreWriter::spawn(store),
        }
    }

    /// Admits a new session.
    ///
    /// Caps are checked and the record inserted under one write lock, so a
    /// rejected call leaves no trace besides `rejected_total`.
    pub fn create(&self, request: CreateSessionRequest) -> Result<Session, SessionError> {
        let requested = request
            .session_id
            .as_deref()
            .map(SessionId::try_new)
            .transpose()?;
        if request.owner_id.trim().is_empty() {
            return Err(SessionError::InvalidSetting {
                name: "owner_id",
                value: request.owner_id,
            });
        }
        if request.cols == 0 || request.rows == 0 {
            return Err(SessionError::InvalidSetting {
                name: "dimensions",
                value: format!("{}x{}", request.cols, request.rows),
            });
        }

        let session = {
            let mut table = rwlock_write_or_recover(&self.table);

            if let Some(id) = &requested {
                if table.sessions.contains_key(id) {
                    return Err(SessionError::AlreadyExists(id.to_string()));
                }
            }

            let max_sessions = self.max_sessions();
            if table.sessions.len() >= max_sessions {
                table.rejected_total += 1;
                warn!(owner_id = %request.owner_id, max_sessions, "Admission denied: relay at capacity");
                return Err(SessionError::GlobalLimitReached { max: max_sessions });
            }

            let max_per_user = self.max_sessions_per_user();
            let owned = table.per_owner.get(&request.owner_id).copied().unwrap_or(0);
            if owned >= max_per_user {
                table.rejected_total += 1;
                warn!(owner_id = %request.owner_id, max_per_user, "Admission denied: per-user limit");
                return Err(SessionError::PerUserLimitReached {
                    owner_id: request.owner_id,
                    max: max_per_user,
                });
            }

            let id = match requested {
                Some(id) => id,
                None => loop {
                    let id = SessionId::generate();
                    if !table.sessions.contains_key(&id) {
                        break id;
                    }
                },
            };

            let recording_path = if request.recording_enabled {
                Some(recording_file(&self.recording_dir, &id)?)
            } else {
                None
            };
            let now = Utc::now();
            let session = Session {
                session_id: id.clone(),
                owner_id: request.owner_id,
                target_ref: request.target_ref,
                dimensions: WindowSize::new(request.cols, request.rows),
                status: SessionStatus::Active,
                created_at: now,
                last_active_at: now,
                closed_at: None,
                close_reason: None,
                client_ip: request.client_ip,
                recording_enabled: request.recording_enabled,
                recording_path,
            };

            let entry = SessionEntry {
                session: session.clone(),
                cancel: self.root.child_token(),
                attached: false,
                persisted_at: Instant::now(),
            };
            table.sessions.insert(id, Arc::new(Mutex::new(entry)));
            *table.per_owner.entry(session.owner_id.clone()).or_insert(0) += 1;
            table.opened_total += 1;
            self.writer.upsert(session.clone());
            session
        };

        info!(
            session_id = %session.session_id,
            owner_id = %session.owner_id,
            target = %session.target_ref,
            size = %session.dimensions,
            "Session created"
        );
        Ok(session)
    }

    /// Returns an active session, or a recently closed one from history.
    pub fn get(&self, session_id: &str) -> Result<Session, SessionError> {
        let entry = rwlock_read_or_recover(&self.table)
            .sessions
            .get(session_id)
            .cloned();
        if let Some(entry) = entry {
            return Ok(mutex_lock_or_recover(&entry).session.clone());
        }

        mutex_lock_or_recover(&self.history)
            .iter()
            .rev()
            .find(|s| s.session_id.as_str() == session_id)
            .cloned()
            .ok_or_else(|| SessionError::NotFound(session_id.to_string()))
    }

    /// Closes an active session and cancels its relay.
    ///
    /// Unknown and already-closed ids fail with `NotFound`, so a second close
    /// is always visible to the caller.
    pub fn close(&self, session_id: &str, reason: CloseReason) -> Result<Session, SessionError> {
        let closed = {
            let mut table = rwlock_write_or_recover(&self.table);
            let entry = table
                .sessions
                .remove(session_id)
                .ok_or_else(|| SessionError::NotFound(session_id.to_string()))?;

            let mut entry = mutex_lock_or_recover(&entry);
            let owner = entry.session.owner_id.clone();
            if let Some(count) = table.per_owner.get_mut(&owner) {
                *count = count.saturating_sub(1);
                if *count == 0 {
                    table.per_owner.remove(&owner);
                }
            }
            table.closed_total += 1;

            entry.session.mark_closed(reason, Utc::now());
            entry.cancel.cancel();
            self.writer.remove(session_id);
            entry.session.clone()
        };

        {
            let mut history = mutex_lock_or_recover(&self.history);
            if history.len() >= self.history_limit.max(1) {
                history.pop_front();
            }
            history.push_back(closed.clone());
        }

        info!(
            session_id = %closed.session_id,
            owner_id = %closed.owner_id,
            reason = %closed.close_reason.as_ref().map(ToString::to_string).unwrap_or_default(),
            "Session closed"
        );
        Ok(closed)
    }

    /// Records activity now. Unknown or closed ids are logged and ignored.
    pub fn update_activity(&self, session_id: &str) {
        self.update_activity_at(session_id, Utc::now());
    }

    /// Moves `last_active_at` forward to `at`; never backward.
    pub fn update_activity_at(&self, session_id: &str, at: DateTime<Utc>) {
        let entry = rwlock_read_or_recover(&self.table)
            .sessions
            .get(session_id)
            .cloned();
        let Some(entry) = entry else {
            debug!(session_id, "Activity for unknown or closed session ignored");
            return;
        };

        let mut entry = mutex_lock_or_recover(&entry);
        if !entry.session.is_active() {
            return;
        }
        entry.session.touch(at);
        if entry.persisted_at.elapsed() >= ACTIVITY_PERSIST_INTERVAL {
            entry.persisted_at = Instant::now();
            self.writer.upsert(entry.session.clone());
        }
    }

    /// Records dimensions accepted by the session's process.
    pub fn update_dimensions(&self, session_id: &str, size: WindowSize) {
        let entry = rwlock_read_or_recover(&self.table)
            .sessions
            .get(session_id)
            .cloned();
        let Some(entry) = entry else {
            debug!(session_id, "Resize for unknown or closed session ignored");
            return;
        };

        let mut entry = mutex_lock_or_recover(&entry);
        if !entry.session.is_active() {
            debug!(session_id, "Resize for closing session ignored");
            return;
        }
        entry.session.dimensions = size;
        entry.session.touch(Utc::now());
        entry.persisted_at = Instant::now();
        // Submitted under the entry lock so a concurrent close's remove
        // always lands after it.
        self.writer.upsert(entry.session.clone());
        debug!(session_id, %size, "Session resized");
    }

    pub fn user_sessions(&self, owner_id: &str) -> Vec<Session> {
        self.snapshot_where(|s| s.owner_id == owner_id)
    }

    pub fn list_active(&self) -> Vec<Session> {
        self.snapshot_where(|_| true)
    }

    fn snapshot_where<F: Fn(&Session) -> bool>(&self, keep: F) -> Vec<Session> {
        let table = rwlock_read_or_recover(&self.table);
        table
            .sessions
            .values()
            .filter_map(|entry| {
                let entry = mutex_lock_or_recover(entry);
                keep(&entry.session).then(|| entry.session.clone())
            })
            .collect()
    }

    pub fn metrics(&self) -> SessionMetrics {
        let table = rwlock_read_or_recover(&self.table);
        SessionMetrics {
            active_count: table.sessions.len() as u64,
            opened_total: table.opened_total,
            closed_total: table.closed_total,
            rejected_total: table.rejected_total,
            per_owner_counts: table
                .per_owner
                .iter()
                .map(|(owner, count)| (owner.clone(), *count as u64))
                .collect::<BTreeMap<_, _>>(),
        }
    }

    /// Claims an active session for one relay connection.
    pub fn attach(&self, session_id: &str) -> Result<SessionLease, SessionError> {
        let table = rwlock_read_or_recover(&self.table);
        let entry = table
            .sessions
            .get(session_id)
            .ok_or_else(|| SessionError::NotFound(session_id.to_string()))?;

        let mut entry = mutex_lock_or_recover(entry);
        if entry.attached {
            return Err(SessionError::AlreadyAttached(session_id.to_string()));
        }
        entry.attached = true;
        entry.session.touch(Utc::now());

        Ok(SessionLease {
            session_id: entry.session.session_id.clone(),
            owner_id: entry.session.owner_id.clone(),
            dimensions: entry.session.dimensions,
            recording_path: entry.session.recording_path.clone(),
            cancel: entry.cancel.clone(),
        })
    }

    /// Closes every session idle for longer than the timeout as of `now`.
    pub fn sweep_idle(&self, now: DateTime<Utc>) -> Vec<SessionId> {
        let timeout = chrono::Duration::milliseconds(
            i64::try_from(self.session_timeout_ms.load(Ordering::SeqCst)).unwrap_or(i64::MAX),
        );

        let expired: Vec<SessionId> = {
            let table = rwlock_read_or_recover(&self.table);
            table
                .sessions
                .iter()
                .filter(|(_, entry)| {
                    let entry = mutex_lock_or_recover(entry);
                    now.signed_duration_since(entry.session.last_active_at) > timeout
                })
                .map(|(id, _)| id.clone())
                .collect()
        };

        expired
            .into_iter()
            .filter(|id| match self.close(id.as_str(), CloseReason::IdleTimeout) {
                Ok(_) => true,
                Err(e) => {
                    debug!(session_id = %id, error = %e, "Idle session already closed");
                    false
                }
            })
            .collect()
    }

    pub fn set_max_sessions_per_user(&self, max: usize) -> Result<(), SessionError> {
        if max == 0 {
            warn!(value = max, "Rejected max_sessions_per_user");
            return Err(SessionError::InvalidSetting {
                name: "max_sessions_per_user",
                value: max.to_string(),
            });
        }
        let previous = self.max_sessions_per_user.swap(max, Ordering::SeqCst);
        info!(previous, current = max, "Per-user session limit changed");
        Ok(())
    }

    pub fn set_max_sessions(&self, max: usize) -> Result<(), SessionError> {
        if max == 0 {
            warn!(value = max, "Rejected max_sessions");
            return Err(SessionError::InvalidSetting {
                name: "max_sessions",
                value: max.to_string(),
            });
        }
        let previous = self.max_sessions.swap(max, Ordering::SeqCst);
        info!(previous, current = max, "Global session limit changed");
        Ok(())
    }

    pub fn set_session_timeout(&self, timeout: Duration) -> Result<(), SessionError> {
        let ms = duration_ms(timeout);
        if ms == 0 {
            warn!(?timeout, "Rejected session_timeout");
            return Err(SessionError::InvalidSetting {
                name: "session_timeout",
                value: format!("{:?}", timeout),
            });
        }
        let previous = self.session_timeout_ms.swap(ms, Ordering::SeqCst);
        info!(previous_ms = previous, current_ms = ms, "Session timeout changed");
        Ok(())
    }

    pub fn max_sessions_per_user(&self) -> usize {
        self.max_sessions_per_user.load(Ordering::SeqCst)
    }

    pub fn max_sessions(&self) -> usize {
        self.max_sessions.load(Ordering::SeqCst)
    }

    pub fn session_timeout(&self) -> Duration {
        Duration::from_millis(self.session_timeout_ms.load(Ordering::SeqCst))
    }

    /// Parent of every session's cancellation token.
    pub fn root_token(&self) -> CancellationToken {
        self.root.clone()
    }

    /// Closes all active sessions, cancels every relay and flushes the store.
    pub fn shutdown(&self) {
        let ids: Vec<SessionId> = rwlock_read_or_recover(&self.table)
            .sessions
            .keys()
            .cloned()
            .collect();
        let count = ids.len();
        for id in ids {
            if let Err(e) = self.close(id.as_str(), CloseReason::Shutdown) {
                debug!(session_id = %id, error = %e, "Session closed during shutdown");
            }
        }
        self.root.cancel();
        self.writer.flush();
        self.writer.close();
        info!(closed = count, "Session manager shut down");
    }
}

impl SessionEvents for SessionManager {
    fn touch(&self, session_id: &SessionId) {
        self.update_activity(session_id.as_str());
    }

    fn resized(&self, session_id: &SessionId, size: WindowSize) {
        self.update_dimensions(session_id.as_str(), size);
    }

    fn session_ended(&self, session_id: &SessionId, reason: CloseReason) {
        if let Err(e) = self.close(session_id.as_str(), reason) {
            debug!(session_id = %session_id, error = %e, "Relay ended for a session already closed");
        }
    }
}

fn duration_ms(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

fn nonzero_or<T: PartialEq + Default>(value: T, fallback: T) -> T {
    if value == T::default() {
        fallback
    } else {
        value
    }
}

/// Recording file for `id`, which must be a plain file directly under `dir`.
fn recording_file(dir: &Path, id: &SessionId) -> Result<PathBuf, SessionError> {
    let path = dir.join(format!("{}.raw", id));
    let escapes = path
        .strip_prefix(dir)
        .map(|rest| {
            let mut parts = rest.components();
            !matches!((parts.next(), parts.next()), (Some(Component::Normal(_)), None))
        })
        .unwrap_or(true);
    if escapes {
        return Err(SessionError::InvalidSessionId(format!(
            "session id {:?} does not name a file in the recording directory",
            id.as_str()
        )));
    }
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn config() -> RelayConfig {
        RelayConfig::default()
            .with_max_sessions_per_user(5)
            .with_max_sessions(100)
            .with_session_timeout(Duration::from_secs(1800))
            .with_recording_dir("/var/lib/termrelay/recordings")
            .with_history_limit(4)
    }

    fn manager() -> SessionManager {
        SessionManager::new(&config(), Arc::new(MemoryStore::new()))
    }

    #[test]
    fn test_create_and_get() {
        let manager = manager();
        let session = manager
            .create(
                CreateSessionRequest::new("u1")
                    .with_target("node-7")
                    .with_size(120, 40)
                    .with_client_ip("10.1.2.3"),
            )
            .unwrap();

        assert!(session.is_active());
        assert_eq!(session.dimensions, WindowSize::new(120, 40));
        assert_eq!(session.target_ref, "node-7");
        assert_eq!(session.last_active_at, session.created_at);
        assert!(session.recording_path.is_none());

        let fetched = manager.get(session.session_id.as_str()).unwrap();
        assert_eq!(fetched, session);
    }

    #[test]
    fn test_recording_path_reserved_at_creation() {
        let manager = manager();
        let session = manager
            .create(CreateSessionRequest::new("u1").with_recording(true))
            .unwrap();
        let path = session.recording_path.unwrap();
        assert!(path.starts_with("/var/lib/termrelay/recordings"));
        assert!(path.to_string_lossy().contains(session.session_id.as_str()));
    }

    #[test]
    fn test_requested_id_collision_is_rejected() {
        let manager = manager();
        manager
            .create(CreateSessionRequest::new("u1").with_session_id("fixed"))
            .unwrap();
        let err = manager
            .create(CreateSessionRequest::new("u2").with_session_id("fixed"))
            .unwrap_err();
        assert!(matches!(err, SessionError::AlreadyExists(_)));
        assert_eq!(manager.metrics().opened_total, 1);
        assert_eq!(manager.get("fixed").unwrap().owner_id, "u1");
    }

    #[test]
    fn test_blank_requested_id_is_rejected() {
        let manager = manager();
        let err = manager
            .create(CreateSessionRequest::new("u1").with_session_id("   "))
            .unwrap_err();
        assert!(matches!(err, SessionError::InvalidSessionId(_)));
    }

    #[test]
    fn test_path_like_requested_ids_are_rejected() {
        let store = Arc::new(MemoryStore::new());
        let manager = SessionManager::new(&config(), store.clone());
        for id in ["../../../../tmp/escape", "/etc/cron.d/evil", ".."] {
            let err = manager
                .create(
                    CreateSessionRequest::new("u1")
                        .with_session_id(id)
                        .with_recording(true),
                )
                .unwrap_err();
            assert!(matches!(err, SessionError::InvalidSessionId(_)), "{id}");
        }
        manager.writer.flush();
        assert!(store.is_empty());
        assert_eq!(manager.metrics().opened_total, 0);
    }

    #[test]
    fn test_recording_file_stays_in_directory() {
        let dir = Path::new("/var/lib/termrelay/recordings");
        let id = SessionId::try_new("abc").unwrap();
        assert_eq!(recording_file(dir, &id).unwrap(), dir.join("abc.raw"));

        // Deserialization skips validation, as for records loaded from a store.
        let forged: SessionId = serde_json::from_str(r#""../x""#).unwrap();
        assert!(matches!(
            recording_file(dir, &forged),
            Err(SessionError::InvalidSessionId(_))
        ));
    }

    #[test]
    fn test_zero_config_keeps_defaults() {
        let config = config()
            .with_max_sessions_per_user(0)
            .with_max_sessions(0)
            .with_session_timeout(Duration::ZERO);
        let manager = SessionManager::new(&config, Arc::new(MemoryStore::new()));
        assert_eq!(manager.max_sessions_per_user(), DEFAULT_MAX_SESSIONS_PER_USER);
        assert_eq!(manager.max_sessions(), DEFAULT_MAX_SESSIONS);
        assert_eq!(
            manager.session_timeout(),
            Duration::from_secs(DEFAULT_SESSION_TIMEOUT_SECS)
        );
    }

    #[test]
    fn test_zero_dimensions_are_rejected() {
        let manager = manager();
        let err = manager
            .create(CreateSessionRequest::new("u1").with_size(0, 24))
            .unwrap_err();
        assert!(matches!(err, SessionError::InvalidSetting { .. }));
        assert_eq!(manager.metrics().opened_total, 0);
    }

    #[test]
    fn test_reuse_of_closed_id_starts_fresh() {
        let manager = manager();
        let first = manager
            .create(CreateSessionRequest::new("u1").with_session_id("again").with_size(100, 30))
            .unwrap();
        manager.close("again", CloseReason::Requested(String::new())).unwrap();

        let second = manager
            .create(CreateSessionRequest::new("u2").with_session_id("again"))
            .unwrap();
        assert_eq!(second.owner_id, "u2");
        assert_eq!(second.dimensions, WindowSize::new(80, 24));
        assert!(second.created_at >= first.created_at);
        assert!(manager.get("again").unwrap().is_active());
    }

    #[test]
    fn test_double_close_is_not_found() {
        let manager = manager();
        let id = manager.create(CreateSessionRequest::new("u1")).unwrap().session_id;

        let closed = manager
            .close(id.as_str(), CloseReason::Requested("done".into()))
            .unwrap();
        assert_eq!(closed.status, SessionStatus::Closed);
        assert!(closed.closed_at.is_some());

        let err = manager
            .close(id.as_str(), CloseReason::Requested("again".into()))
            .unwrap_err();
        assert!(matches!(err, SessionError::NotFound(_)));
        assert_eq!(manager.metrics().closed_total, 1);
    }

    #[test]
    fn test_close_unknown_is_not_found() {
        let manager = manager();
        assert!(matches!(
            manager.close("nope", CloseReason::Shutdown),
            Err(SessionError::NotFound(_))
        ));
        assert!(matches!(manager.get("nope"), Err(SessionError::NotFound(_))));
    }

    #[test]
    fn test_closed_session_visible_in_history() {
        let manager = manager();
        let id = manager.create(CreateSessionRequest::new("u1")).unwrap().session_id;
        manager.close(id.as_str(), CloseReason::ProcessExited).unwrap();

        let session = manager.get(id.as_str()).unwrap();
        assert_eq!(session.status, SessionStatus::Closed);
        assert_eq!(session.close_reason, Some(CloseReason::ProcessExited));
        assert!(manager.list_active().is_empty());
    }

    #[test]
    fn test_history_is_bounded() {
        let manager = manager();
        let mut ids = Vec::new();
        for _ in 0..6 {
            let id = manager.create(CreateSessionRequest::new("u1")).unwrap().session_id;
            manager.close(id.as_str(), CloseReason::ProcessExited).unwrap();
            ids.push(id);
        }
        assert!(manager.get(ids[0].as_str()).is_err());
        assert!(manager.get(ids[1].as_str()).is_err());
        assert!(manager.get(ids[5].as_str()).is_ok());
    }

    #[test]
    fn test_close_cancels_lease_token() {
        let manager = manager();
        let id = manager.create(CreateSessionRequest::new("u1")).unwrap().session_id;
        let lease = manager.attach(id.as_str()).unwrap();
        assert!(!lease.cancel.is_cancelled());

        manager.close(id.as_str(), CloseReason::Requested(String::new())).unwrap();
        assert!(lease.cancel.is_cancelled());
    }

    #[test]
    fn test_attach_twice_is_rejected() {
        let manager = manager();
        let id = manager.create(CreateSessionRequest::new("u1")).unwrap().session_id;
        manager.attach(id.as_str()).unwrap();
        assert!(matches!(
            manager.attach(id.as_str()),
            Err(SessionError::AlreadyAttached(_))
        ));
        assert!(matches!(
            manager.attach("missing"),
            Err(SessionError::NotFound(_))
        ));
    }

    #[test]
    fn test_update_activity_is_monotonic() {
        let manager = manager();
        let session = manager.create(CreateSessionRequest::new("u1")).unwrap();
        let id = session.session_id.as_str();

        let later = session.created_at + chrono::Duration::seconds(10);
        manager.update_activity_at(id, later);
        manager.update_activity_at(id, session.created_at - chrono::Duration::seconds(10));

        assert_eq!(manager.get(id).unwrap().last_active_at, later);
    }

    #[test]
    fn test_update_activity_never_resurrects() {
        let manager = manager();
        let id = manager.create(CreateSessionRequest::new("u1")).unwrap().session_id;
        manager.close(id.as_str(), CloseReason::ProcessExited).unwrap();

        manager.update_activity(id.as_str());
        manager.update_activity("never-existed");

        assert_eq!(manager.get(id.as_str()).unwrap().status, SessionStatus::Closed);
        assert!(manager.list_active().is_empty());
        assert_eq!(manager.metrics().active_count, 0);
    }

    #[test]
    fn test_user_sessions_and_list_active() {
        let manager = manager();
        manager.create(CreateSessionRequest::new("u1")).unwrap();
        manager.create(CreateSessionRequest::new("u1")).unwrap();
        manager.create(CreateSessionRequest::new("u2")).unwrap();

        assert_eq!(manager.user_sessions("u1").len(), 2);
        assert_eq!(manager.user_sessions("u2").len(), 1);
        assert!(manager.user_sessions("u3").is_empty());
        assert_eq!(manager.list_active().len(), 3);

        let metrics = manager.metrics();
        assert_eq!(metrics.per_owner_counts.get("u1"), Some(&2));
        assert_eq!(metrics.per_owner_counts.get("u2"), Some(&1));
    }

    #[test]
    fn test_global_cap_checked() {
        let manager = manager();
        manager.set_max_sessions(2).unwrap();
        manager.create(CreateSessionRequest::new("a")).unwrap();
        manager.create(CreateSessionRequest::new("b")).unwrap();

        let err = manager.create(CreateSessionRequest::new("c")).unwrap_err();
        assert!(matches!(err, SessionError::GlobalLimitReached { max: 2 }));
        assert_eq!(manager.metrics().rejected_total, 1);
        assert!(manager.user_sessions("c").is_empty());
    }

    #[test]
    fn test_global_cap_reported_before_per_user_cap() {
        let manager = manager();
        manager.set_max_sessions(1).unwrap();
        manager.set_max_sessions_per_user(1).unwrap();
        manager.create(CreateSessionRequest::new("u1")).unwrap();

        let err = manager.create(CreateSessionRequest::new("u1")).unwrap_err();
        assert!(matches!(err, SessionError::GlobalLimitReached { .. }));
    }

    #[test]
    fn test_lowering_cap_keeps_existing_sessions() {
        let manager = manager();
        for _ in 0..3 {
            manager.create(CreateSessionRequest::new("u1")).unwrap();
        }
        manager.set_max_sessions_per_user(1).unwrap();
        assert_eq!(manager.user_sessions("u1").len(), 3);
        assert!(matches!(
            manager.create(CreateSessionRequest::new("u1")),
            Err(SessionError::PerUserLimitReached { max: 1, .. })
        ));
    }

    #[test]
    fn test_zero_settings_are_rejected() {
        let manager = manager();
        assert!(manager.set_max_sessions_per_user(0).is_err());
        assert!(manager.set_max_sessions(0).is_err());
        assert!(manager.set_session_timeout(Duration::ZERO).is_err());

        assert_eq!(manager.max_sessions_per_user(), 5);
        assert_eq!(manager.max_sessions(), 100);
        assert_eq!(manager.session_timeout(), Duration::from_secs(1800));

        manager.set_session_timeout(Duration::from_secs(60)).unwrap();
        assert_eq!(manager.session_timeout(), Duration::from_secs(60));
    }

    #[test]
    fn test_sweep_closes_only_idle_sessions() {
        let manager = manager();
        manager.set_session_timeout(Duration::from_secs(60)).unwrap();
        let idle = manager.create(CreateSessionRequest::new("u1")).unwrap();
        let busy = manager.create(CreateSessionRequest::new("u1")).unwrap();

        let now = idle.created_at + chrono::Duration::seconds(90);
        manager.update_activity_at(busy.session_id.as_str(), now - chrono::Duration::seconds(5));

        let swept = manager.sweep_idle(now);
        assert_eq!(swept, vec![idle.session_id.clone()]);

        let closed = manager.get(idle.session_id.as_str()).unwrap();
        assert_eq!(closed.close_reason, Some(CloseReason::IdleTimeout));
        assert!(manager.get(busy.session_id.as_str()).unwrap().is_active());

        let metrics = manager.metrics();
        assert_eq!(metrics.closed_total, 1);
        assert_eq!(metrics.active_count, metrics.opened_total - metrics.closed_total);
    }

    #[test]
    fn test_session_events_close_once() {
        let manager = manager();
        let id = manager.create(CreateSessionRequest::new("u1")).unwrap().session_id;

        manager.resized(&id, WindowSize::new(150, 40));
        assert_eq!(manager.get(id.as_str()).unwrap().dimensions, WindowSize::new(150, 40));

        manager.session_ended(&id, CloseReason::ProcessExited);
        manager.session_ended(&id, CloseReason::ClientDisconnected);

        let session = manager.get(id.as_str()).unwrap();
        assert_eq!(session.close_reason, Some(CloseReason::ProcessExited));
        assert_eq!(manager.metrics().closed_total, 1);
    }

    #[test]
    fn test_store_mirrors_table() {
        let store = Arc::new(MemoryStore::new());
        let manager = SessionManager::new(&config(), store.clone());

        let a = manager.create(CreateSessionRequest::new("u1")).unwrap().session_id;
        let b = manager.create(CreateSessionRequest::new("u1")).unwrap().session_id;
        manager.close(a.as_str(), CloseReason::ProcessExited).unwrap();
        manager.shutdown();

        assert!(store.get(a.as_str()).is_none());
        assert!(store.get(b.as_str()).is_none());
        assert!(store.is_empty());
    }

    #[test]
    fn test_resize_racing_close_leaves_no_record() {
        let store = Arc::new(MemoryStore::new());
        let manager = Arc::new(SessionManager::new(
            &config().with_max_sessions_per_user(100),
            store.clone(),
        ));

        for _ in 0..50 {
            let id = manager.create(CreateSessionRequest::new("u1")).unwrap().session_id;
            let resizer = {
                let manager = manager.clone();
                let id = id.clone();
                std::thread::spawn(move || {
                    for cols in 1..=200u16 {
                        manager.update_dimensions(id.as_str(), WindowSize::new(cols, 24));
                        manager.update_activity(id.as_str());
                    }
                })
            };
            manager.close(id.as_str(), CloseReason::Requested("done".into())).unwrap();
            resizer.join().unwrap();
            manager.writer.flush();
            assert!(store.get(id.as_str()).is_none(), "{id} resurrected in store");
        }
        assert!(store.is_empty());
    }

    #[test]
    fn test_stale_records_cleared_on_start() {
        let store = Arc::new(MemoryStore::new());
        {
            let first = SessionManager::new(&config(), store.clone());
            first.create(CreateSessionRequest::new("u1")).unwrap();
            first.writer.flush();
        }
        assert_eq!(store.len(), 1);

        let _second = SessionManager::new(&config(), store.clone());
        assert!(store.is_empty());
    }

    #[test]
    fn test_shutdown_closes_everything() {
        let manager = manager();
        let lease_id = manager.create(CreateSessionRequest::new("u1")).unwrap().session_id;
        manager.create(CreateSessionRequest::new("u2")).unwrap();
        let lease = manager.attach(lease_id.as_str()).unwrap();

        manager.shutdown();

        assert!(manager.list_active().is_empty());
        assert!(lease.cancel.is_cancelled());
        assert!(manager.root_token().is_cancelled());
        assert_eq!(
            manager.get(lease_id.as_str()).unwrap().close_reason,
            Some(CloseReason::Shutdown)
        );
        let metrics = manager.metrics();
        assert_eq!(metrics.opened_total, 2);
        assert_eq!(metrics.closed_total, 2);
    }
}
