//! Bounded worker pool driving reconcile invocations.
//!
//! Work items are notification ids. A dispatcher pulls ids off a bounded
//! queue and runs each under a semaphore permit. `RequeueAfter` and errors
//! schedule a timer that puts the id back on the queue; per notification only
//! the earliest pending timer survives.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::sync::Semaphore;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::reconciler::{Reconcile, ReconcileOutcome};

pub const DEFAULT_WORKERS: usize = 8;
pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;
pub const DEFAULT_ERROR_REQUEUE: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy)]
pub struct WorkerConfig {
    pub workers: usize,
    pub queue_capacity: usize,
    /// Delay before retrying an invocation that returned an error.
    pub error_requeue: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            workers: DEFAULT_WORKERS,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            error_requeue: DEFAULT_ERROR_REQUEUE,
        }
    }
}

/// Producer handle for the pool's queue.
#[derive(Clone)]
pub struct WorkQueue {
    tx: mpsc::Sender<Uuid>,
}

impl WorkQueue {
    /// Enqueue without waiting. A full queue drops the id; the next resync
    /// picks it up again.
    pub fn enqueue(&self, id: Uuid) -> bool {
        match self.tx.try_send(id) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                tracing::warn!(notification_id = %id, "Work queue full, leaving to resync");
                false
            }
            Err(TrySendError::Closed(_)) => {
                tracing::debug!(notification_id = %id, "Work queue closed");
                false
            }
        }
    }

    /// Enqueue, waiting for room.
    pub async fn send(&self, id: Uuid) -> bool {
        self.tx.send(id).await.is_ok()
    }
}

#[derive(Debug, Clone, Copy)]
struct PendingTimer {
    due: Instant,
    generation: u64,
}

#[derive(Clone)]
struct Requeuer {
    timers: Arc<DashMap<Uuid, PendingTimer>>,
    generation: Arc<AtomicU64>,
    queue: WorkQueue,
    cancel: CancellationToken,
}

impl Requeuer {
    /// Returns false when an earlier-or-equal timer is already pending.
    fn schedule(&self, id: Uuid, delay: Duration) -> bool {
        let due = Instant::now() + delay;
        let generation = self.generation.fetch_add(1, Ordering::Relaxed);

        match self.timers.entry(id) {
            Entry::Occupied(existing) if existing.get().due <= due => return false,
            Entry::Occupied(mut existing) => {
                existing.insert(PendingTimer { due, generation });
            }
            Entry::Vacant(slot) => {
                slot.insert(PendingTimer { due, generation });
            }
        }

        let this = self.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = this.cancel.cancelled() => {}
                _ = tokio::time::sleep_until(due) => {
                    let current = this
                        .timers
                        .remove_if(&id, |_, timer| timer.generation == generation);
                    if current.is_some() {
                        this.queue.enqueue(id);
                    }
                }
            }
        });
        true
    }

    fn pending(&self) -> usize {
        self.timers.len()
    }
}

pub struct WorkerPool<R: Reconcile> {
    reconciler: Arc<R>,
    config: WorkerConfig,
    rx: mpsc::Receiver<Uuid>,
    requeuer: Requeuer,
}

impl<R: Reconcile> WorkerPool<R> {
    pub fn new(reconciler: Arc<R>, config: WorkerConfig) -> (Self, WorkQueue) {
        let (tx, rx) = mpsc::channel(config.queue_capacity.max(1));
        let queue = WorkQueue { tx };
        let requeuer = Requeuer {
            timers: Arc::new(DashMap::new()),
            generation: Arc::new(AtomicU64::new(0)),
            queue: queue.clone(),
            cancel: CancellationToken::new(),
        };

        let pool = Self {
            reconciler,
            config,
            rx,
            requeuer,
        };
        (pool, queue)
    }

    /// Number of notifications waiting on a requeue timer.
    pub fn pending_timers(&self) -> usize {
        self.requeuer.pending()
    }

    /// Process work until `cancel` fires, then wait for in-flight invocations.
    pub async fn run(mut self, cancel: CancellationToken) {
        let semaphore = Arc::new(Semaphore::new(self.config.workers.max(1)));
        let mut tasks = JoinSet::new();

        tracing::info!(workers = self.config.workers, "Worker pool started");

        loop {
            let id = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                next = self.rx.recv() => match next {
                    Some(id) => id,
                    None => break,
                },
            };

            let permit = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                permit = semaphore.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            while let Some(finished) = tasks.try_join_next() {
                if let Err(e) = finished {
                    tracing::error!(error = %e, "Reconcile task panicked");
                }
            }

            let reconciler = self.reconciler.clone();
            let requeuer = self.requeuer.clone();
            let error_requeue = self.config.error_requeue;
            tasks.spawn(async move {
                let _permit = permit;
                match reconciler.reconcile(id).await {
                    Ok(ReconcileOutcome::Done) => {}
                    Ok(ReconcileOutcome::RequeueAfter(delay)) => {
                        requeuer.schedule(id, delay);
                    }
                    Err(e) => {
                        tracing::warn!(notification_id = %id, error = %e, "Reconcile failed, requeueing");
                        requeuer.schedule(id, error_requeue);
                    }
                }
            });
        }

        self.requeuer.cancel.cancel();
        tracing::info!(in_flight = tasks.len(), "Worker pool stopping, waiting for in-flight work");
        while let Some(finished) = tasks.join_next().await {
            if let Err(e) = finished {
                tracing::error!(error = %e, "Reconcile task panicked");
            }
        }
        tracing::info!("Worker pool stopped");
    }
}
