//! Human-readable rendering of control socket results.

use std::fmt::Write;

use serde_json::Value;

fn str_field<'a>(value: &'a Value, key: &str) -> &'a str {
    value.get(key).and_then(Value::as_str).unwrap_or("-")
}

fn close_reason(session: &Value) -> Option<String> {
    let reason = session.get("close_reason")?;
    let kind = reason.get("kind")?.as_str()?;
    match reason.get("detail").and_then(Value::as_str) {
        Some(detail) if !detail.is_empty() => Some(format!("{} ({})", kind, detail)),
        _ => Some(kind.to_string()),
    }
}

pub fn render_session(session: &Value) -> String {
    let mut out = String::new();
    let dims = &session["dimensions"];
    let _ = writeln!(out, "Session {}", str_field(session, "session_id"));
    let _ = writeln!(out, "  owner:       {}", str_field(session, "owner_id"));
    let _ = writeln!(out, "  status:      {}", str_field(session, "status"));
    let _ = writeln!(out, "  size:        {}x{}", dims["cols"], dims["rows"]);
    let _ = writeln!(out, "  created:     {}", str_field(session, "created_at"));
    let _ = writeln!(out, "  last active: {}", str_field(session, "last_active_at"));
    let target = str_field(session, "target_ref");
    if !target.is_empty() && target != "-" {
        let _ = writeln!(out, "  target:      {}", target);
    }
    if let Some(path) = session.get("recording_path").and_then(Value::as_str) {
        let _ = writeln!(out, "  recording:   {}", path);
    }
    if let Some(reason) = close_reason(session) {
        let _ = writeln!(out, "  closed:      {}", str_field(session, "closed_at"));
        let _ = writeln!(out, "  reason:      {}", reason);
    }
    out
}

pub fn render_session_list(result: &Value) -> String {
    let sessions = result
        .get("sessions")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();
    if sessions.is_empty() {
        return "No active sessions\n".to_string();
    }

    let mut out = String::new();
    let _ = writeln!(
        out,
        "{:<38} {:<16} {:>9} {}",
        "SESSION", "OWNER", "SIZE", "LAST ACTIVE"
    );
    for session in &sessions {
        let dims = &session["dimensions"];
        let _ = writeln!(
            out,
            "{:<38} {:<16} {:>9} {}",
            str_field(session, "session_id"),
            str_field(session, "owner_id"),
            format!("{}x{}", dims["cols"], dims["rows"]),
            str_field(session, "last_active_at"),
        );
    }
    out
}

pub fn render_metrics(result: &Value) -> String {
    let sessions = &result["sessions"];
    let relay = &result["relay"];
    let limits = &result["limits"];

    let mut out = String::new();
    let _ = writeln!(out, "Sessions");
    let _ = writeln!(out, "  active:   {}", sessions["active_count"]);
    let _ = writeln!(out, "  opened:   {}", sessions["opened_total"]);
    let _ = writeln!(out, "  closed:   {}", sessions["closed_total"]);
    let _ = writeln!(out, "  rejected: {}", sessions["rejected_total"]);
    if let Some(owners) = sessions["per_owner_counts"].as_object() {
        for (owner, count) in owners {
            let _ = writeln!(out, "    {}: {}", owner, count);
        }
    }
    let _ = writeln!(out, "Relay");
    let _ = writeln!(out, "  connections: {}", relay["connections_total"]);
    let _ = writeln!(out, "  rejected:    {}", relay["connections_rejected"]);
    let _ = writeln!(out, "  bytes in:    {}", relay["bytes_in"]);
    let _ = writeln!(out, "  bytes out:   {}", relay["bytes_out"]);
    let _ = writeln!(out, "  dropped:     {}", relay["frames_dropped"]);
    out.push_str(&render_limits(limits));
    out
}

pub fn render_limits(limits: &Value) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "Limits");
    let _ = writeln!(out, "  per user:  {}", limits["max_sessions_per_user"]);
    let _ = writeln!(out, "  global:    {}", limits["max_sessions"]);
    let _ = writeln!(out, "  timeout:   {}s", limits["session_timeout_secs"]);
    out
}
