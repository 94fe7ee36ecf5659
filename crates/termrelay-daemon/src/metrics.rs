use std::collections::BTreeMap;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::time::Instant;

use serde::Deserialize;
use serde::Serialize;

/// Point-in-time view of session accounting.
///
/// Read under the table lock, so `active_count == opened_total - closed_total`
/// in every snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionMetrics {
    pub active_count: u64,
    pub opened_total: u64,
    pub closed_total: u64,
    pub rejected_total: u64,
    pub per_owner_counts: BTreeMap<String, u64>,
}

/// Counters for traffic through relay connections.
pub struct RelayMetrics {
    pub connections_total: AtomicU64,
    pub connections_rejected: AtomicU64,
    pub bytes_in: AtomicU64,
    pub bytes_out: AtomicU64,
    pub frames_dropped: AtomicU64,
    start_time: Instant,
}

impl Default for RelayMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl RelayMetrics {
    pub fn new() -> Self {
        Self {
            connections_total: AtomicU64::new(0),
            connections_rejected: AtomicU64::new(0),
            bytes_in: AtomicU64::new(0),
            bytes_out: AtomicU64::new(0),
            frames_dropped: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    pub fn record_connection(&self) {
        self.connections_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rejected(&self) {
        self.connections_rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_bytes(&self, bytes_in: u64, bytes_out: u64) {
        self.bytes_in.fetch_add(bytes_in, Ordering::Relaxed);
        self.bytes_out.fetch_add(bytes_out, Ordering::Relaxed);
    }

    pub fn record_dropped_frames(&self, count: u64) {
        self.frames_dropped.fetch_add(count, Ordering::Relaxed);
    }

    pub fn connections(&self) -> u64 {
        self.connections_total.load(Ordering::Relaxed)
    }

    pub fn rejected(&self) -> u64 {
        self.connections_rejected.load(Ordering::Relaxed)
    }

    pub fn dropped_frames(&self) -> u64 {
        self.frames_dropped.load(Ordering::Relaxed)
    }

    pub fn uptime_ms(&self) -> u64 {
        self.start_time.elapsed().as_millis() as u64
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "connections_total": self.connections(),
            "connections_rejected": self.rejected(),
            "bytes_in": self.bytes_in.load(Ordering::Relaxed),
            "bytes_out": self.bytes_out.load(Ordering::Relaxed),
            "frames_dropped": self.dropped_frames(),
            "uptime_ms": self.uptime_ms(),
            "lock_poison_recoveries": termrelay_common::poison_recovery_count(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_initial_values() {
        let metrics = RelayMetrics::new();
        assert_eq!(metrics.connections(), 0);
        assert_eq!(metrics.rejected(), 0);
        assert_eq!(metrics.dropped_frames(), 0);
    }

    #[test]
    fn test_metrics_increment() {
        let metrics = RelayMetrics::new();
        metrics.record_connection();
        metrics.record_connection();
        metrics.record_rejected();
        metrics.record_bytes(10, 2048);
        metrics.record_dropped_frames(1);

        let json = metrics.to_json();
        assert_eq!(json["connections_total"], 2);
        assert_eq!(json["connections_rejected"], 1);
        assert_eq!(json["bytes_in"], 10);
        assert_eq!(json["bytes_out"], 2048);
        assert_eq!(json["frames_dropped"], 1);
    }

    #[test]
    fn test_session_metrics_serialize() {
        let mut metrics = SessionMetrics {
            active_count: 1,
            opened_total: 3,
            closed_total: 2,
            ..Default::default()
        };
        metrics.per_owner_counts.insert("u1".into(), 1);
        let json = serde_json::to_value(&metrics).unwrap();
        assert_eq!(json["per_owner_counts"]["u1"], 1);
    }
}
