//! Session records owned by the lifecycle manager.

use std::fmt;
use std::path::PathBuf;

use chrono::DateTime;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;
use termrelay_protocol::WindowSize;
use uuid::Uuid;

use crate::error::SessionError;

/// Unique identifier for a session.
///
/// # Invariants
/// - Never empty or whitespace-only
/// - Usable as a single file name: no `/`, `\`, NUL or control
///   characters, and not `.` or `..`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    /// Validates an externally supplied id.
    pub fn try_new(id: impl Into<String>) -> Result<Self, SessionError> {
        let id = id.into();
        if id.trim().is_empty() {
            return Err(SessionError::InvalidSessionId(
                "session id cannot be empty or whitespace-only".to_string(),
            ));
        }
        if id == "." || id == ".." {
            return Err(SessionError::InvalidSessionId(format!(
                "session id cannot be {:?}",
                id
            )));
        }
        if let Some(c) = id
            .chars()
            .find(|c| matches!(c, '/' | '\\') || c.is_control())
        {
            return Err(SessionError::InvalidSessionId(format!(
                "session id cannot contain {:?}",
                c
            )));
        }
        Ok(Self(id))
    }

    /// A fresh random id (UUIDv4, 122 bits of entropy).
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for SessionId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl std::borrow::Borrow<str> for SessionId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Active,
    Closed,
}

/// Why a session left the `active` state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum CloseReason {
    Requested(String),
    ProcessExited,
    StreamError(String),
    ClientDisconnected,
    IdleTimeout,
    Shutdown,
    SpawnFailed(String),
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloseReason::Requested(why) if why.is_empty() => write!(f, "closed by request"),
            CloseReason::Requested(why) => write!(f, "closed by request: {}", why),
            CloseReason::ProcessExited => write!(f, "process exited"),
            CloseReason::StreamError(why) => write!(f, "stream error: {}", why),
            CloseReason::ClientDisconnected => write!(f, "client disconnected"),
            CloseReason::IdleTimeout => write!(f, "idle timeout"),
            CloseReason::Shutdown => write!(f, "relay shutdown"),
            CloseReason::SpawnFailed(why) => write!(f, "spawn failed: {}", why),
        }
    }
}

/// Snapshot of one session as seen by callers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub session_id: SessionId,
    pub owner_id: String,
    /// Opaque reference to the connection target, passed through unmodified.
    pub target_ref: String,
    pub dimensions: WindowSize,
    pub status: SessionStatus,
    pub created_at: DateTime<Utc>,
    pub last_active_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
    pub close_reason: Option<CloseReason>,
    pub client_ip: Option<String>,
    pub recording_enabled: bool,
    pub recording_path: Option<PathBuf>,
}

impl Session {
    pub fn is_active(&self) -> bool {
        self.status == SessionStatus::Active
    }

    /// Moves `last_active_at` forward; earlier instants are ignored.
    pub(crate) fn touch(&mut self, now: DateTime<Utc>) {
        if now > self.last_active_at {
            self.last_active_at = now;
        }
    }

    pub(crate) fn mark_closed(&mut self, reason: CloseReason, now: DateTime<Utc>) {
        self.status = SessionStatus::Closed;
        self.closed_at = Some(now.max(self.last_active_at));
        self.close_reason = Some(reason);
    }
}

fn default_cols() -> u16 {
    WindowSize::default().cols
}

fn default_rows() -> u16 {
    WindowSize::default().rows
}

/// Parameters for admitting a new session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateSessionRequest {
    #[serde(default)]
    pub session_id: Option<String>,
    pub owner_id: String,
    #[serde(default)]
    pub target_ref: String,
    #[serde(default = "default_cols")]
    pub cols: u16,
    #[serde(default = "default_rows")]
    pub rows: u16,
    #[serde(default)]
    pub client_ip: Option<String>,
    #[serde(default)]
    pub recording_enabled: bool,
}

impl CreateSessionRequest {
    pub fn new(owner_id: impl Into<String>) -> Self {
        Self {
            session_id: None,
            owner_id: owner_id.into(),
            target_ref: String::new(),
            cols: default_cols(),
            rows: default_rows(),
            client_ip: None,
            recording_enabled: false,
        }
    }

    pub fn with_session_id(mut self, id: impl Into<String>) -> Self {
        self.session_id = Some(id.into());
        self
    }

    pub fn with_target(mut self, target_ref: impl Into<String>) -> Self {
        self.target_ref = target_ref.into();
        self
    }

    pub fn with_size(mut self, cols: u16, rows: u16) -> Self {
        self.cols = cols;
        self.rows = rows;
        self
    }

    pub fn with_client_ip(mut self, ip: impl Into<String>) -> Self {
        self.client_ip = Some(ip.into());
        self
    }

    pub fn with_recording(mut self, enabled: bool) -> Self {
        self.recording_enabled = enabled;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn sample() -> Session {
        let now = Utc::now();
        Session {
            session_id: SessionId::generate(),
            owner_id: "u1".into(),
            target_ref: "host-1".into(),
            dimensions: WindowSize::default(),
            status: SessionStatus::Active,
            created_at: now,
            last_active_at: now,
            closed_at: None,
            close_reason: None,
            client_ip: None,
            recording_enabled: false,
            recording_path: None,
        }
    }

    #[test]
    fn test_session_id_rejects_blank() {
        assert!(SessionId::try_new("").is_err());
        assert!(SessionId::try_new("  \t").is_err());
        assert_eq!(SessionId::try_new("abc").unwrap().as_str(), "abc");
    }

    #[test]
    fn test_session_id_rejects_path_like_ids() {
        for id in [
            "../../../../tmp/escape",
            "/etc/cron.d/evil",
            "a/b",
            "..",
            ".",
            "dir\\file",
            "nul\0byte",
            "line\nbreak",
        ] {
            assert!(
                matches!(SessionId::try_new(id), Err(SessionError::InvalidSessionId(_))),
                "{:?} should be rejected",
                id
            );
        }
        assert!(SessionId::try_new("..hidden").is_ok());
        assert!(SessionId::try_new("build-42.v2").is_ok());
    }

    #[test]
    fn test_generated_ids_are_full_uuids() {
        let a = SessionId::generate();
        let b = SessionId::generate();
        assert_ne!(a, b);
        assert!(Uuid::parse_str(a.as_str()).is_ok());
    }

    #[test]
    fn test_touch_never_moves_backward() {
        let mut session = sample();
        let start = session.last_active_at;
        session.touch(start - Duration::seconds(30));
        assert_eq!(session.last_active_at, start);
        session.touch(start + Duration::seconds(5));
        assert_eq!(session.last_active_at, start + Duration::seconds(5));
    }

    #[test]
    fn test_mark_closed() {
        let mut session = sample();
        session.mark_closed(CloseReason::IdleTimeout, Utc::now());
        assert_eq!(session.status, SessionStatus::Closed);
        assert!(!session.is_active());
        assert!(session.closed_at.unwrap() >= session.created_at);
        assert_eq!(session.close_reason, Some(CloseReason::IdleTimeout));
    }

    #[test]
    fn test_close_reason_serialization() {
        let json = serde_json::to_value(CloseReason::StreamError("reset".into())).unwrap();
        assert_eq!(json["kind"], "stream_error");
        assert_eq!(json["detail"], "reset");

        let json = serde_json::to_value(CloseReason::IdleTimeout).unwrap();
        assert_eq!(json["kind"], "idle_timeout");
    }

    #[test]
    fn test_create_request_defaults() {
        let req: CreateSessionRequest = serde_json::from_str(r#"{"owner_id":"u1"}"#).unwrap();
        assert_eq!(req, CreateSessionRequest::new("u1"));
        assert_eq!((req.cols, req.rows), (80, 24));
    }

    #[test]
    fn test_session_serializes_status_lowercase() {
        let json = serde_json::to_value(sample()).unwrap();
        assert_eq!(json["status"], "active");
        assert_eq!(json["dimensions"]["cols"], 80);
    }
}
