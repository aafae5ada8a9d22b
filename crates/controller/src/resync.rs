use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use courier_engine::store::NotificationStore;
use courier_engine::worker::WorkQueue;

/// Periodically re-enqueues every unfinished notification.
///
/// This is the level trigger: objects created by a separate API process, or
/// dropped from a full work queue, are picked up on the next pass.
pub struct Resyncer {
    store: Arc<dyn NotificationStore>,
    queue: WorkQueue,
    interval: Duration,
}

impl Resyncer {
    pub fn new(store: Arc<dyn NotificationStore>, queue: WorkQueue, interval_ms: u64) -> Self {
        Self {
            store,
            queue,
            interval: Duration::from_millis(interval_ms.max(1)),
        }
    }

    /// Run until cancelled. The first pass happens immediately.
    pub async fn run(self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        tracing::info!(
            interval_ms = self.interval.as_millis() as u64,
            "Resync loop started"
        );

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.resync_once().await {
                        // Store might be briefly unavailable; try again next tick
                        tracing::warn!(error = %e, "Resync failed");
                    }
                }
            }
        }
        tracing::info!("Resync loop stopped");
    }

    /// Enqueue every unfinished notification once. Returns how many were enqueued.
    pub async fn resync_once(&self) -> anyhow::Result<usize> {
        let ids = self.store.list_unfinished().await?;
        let total = ids.len();

        let mut enqueued = 0;
        for id in ids {
            if !self.queue.enqueue(id) {
                break;
            }
            enqueued += 1;
        }

        if total > 0 {
            tracing::debug!(unfinished = total, enqueued, "Resync pass");
        }
        Ok(enqueued)
    }
}
