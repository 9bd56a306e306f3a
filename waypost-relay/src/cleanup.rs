//! Background cleanup task.
//!
//! Periodically asks the coordinator to sweep stale registrations and
//! expired buffered messages. The sweep itself runs inside the coordinator
//! so it never races normal traffic.

use crate::config::CleanupConfig;
use crate::proxy::RelayEvent;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::interval;

/// Spawn a background cleanup task.
///
/// Returns a handle that can be used to abort the task. The task ends on
/// its own once the coordinator is gone.
pub fn spawn_cleanup_task(
    events: mpsc::UnboundedSender<RelayEvent>,
    config: CleanupConfig,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        if !config.enabled {
            tracing::info!("Cleanup task disabled");
            return;
        }

        let interval_secs = config.interval_secs;
        tracing::info!("Cleanup task started (interval: {}s)", interval_secs);

        let mut timer = interval(Duration::from_secs(interval_secs));
        // The first tick completes immediately
        timer.tick().await;

        loop {
            timer.tick().await;

            if events.send(RelayEvent::Cleanup).is_err() {
                tracing::debug!("Cleanup: coordinator gone, stopping");
                return;
            }
        }
    })
}
