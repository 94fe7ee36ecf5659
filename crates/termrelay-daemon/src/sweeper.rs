use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::manager::SessionManager;

/// Periodically closes sessions that have been idle past the timeout.
pub fn spawn_sweeper(
    manager: Arc<SessionManager>,
    interval: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let closed = manager.sweep_idle(Utc::now());
                    if closed.is_empty() {
                        debug!("Idle sweep found nothing to close");
                    } else {
                        info!(count = closed.len(), "Idle sweep closed sessions");
                    }
                }
            }
        }
        debug!("Idle sweeper stopped");
    })
}
