//! Poll channel: scans the inbox on a fixed interval.
//!
//! Push notifications arriving through the webhook and these scans feed the
//! same router, so a message seen by both is still handled once.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use super::router::InboundRouter;
use crate::error::RouterError;

/// Spawn a background task that scans the inbox every `interval`.
///
/// Returns a `JoinHandle` and a shutdown flag. Set the flag to stop polling.
pub fn spawn_inbox_poller(
    router: Arc<InboundRouter>,
    interval: Duration,
) -> (JoinHandle<()>, Arc<AtomicBool>) {
    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_flag = Arc::clone(&shutdown);

    let handle = tokio::spawn(async move {
        info!(interval_secs = interval.as_secs(), "Inbox poller started");

        let mut tick = tokio::time::interval(interval);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tick.tick().await;

            if shutdown.load(Ordering::Relaxed) {
                info!("Inbox poller shutting down");
                return;
            }

            match router.scan().await {
                Ok(report) => debug!(listed = report.listed, handled = report.handled, "Inbox polled"),
                Err(RouterError::ScanInProgress) => debug!("Scan already running, skipping tick"),
                Err(e) => error!(error = %e, "Inbox poll failed"),
            }
        }
    });

    (handle, shutdown_flag)
}
