//! Stuck-lock watchdog
//!
//! Periodically runs [`SequentialQueue::recover`]: a lock held past the
//! maximum job duration is force-released (recorded under the `watchdog`
//! operator) and the next job started; an idle queue with waiting jobs is
//! kicked.

use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::SequentialQueue;

pub fn spawn_lock_watchdog(
    queue: SequentialQueue,
    interval: Duration,
    cancel_token: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!(queue = queue.name(), interval_secs = interval.as_secs(), "Queue watchdog started");
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel_token.cancelled() => {
                    info!(queue = queue.name(), "Queue watchdog stopped");
                    break;
                }
                _ = ticker.tick() => {
                    match queue.recover().await {
                        Ok(Some(outcome)) => info!(queue = queue.name(), ?outcome, "Watchdog recovery attempt"),
                        Ok(None) => {}
                        Err(e) => warn!(queue = queue.name(), error = %e, "Watchdog check failed"),
                    }
                }
            }
        }
    })
}
