//! Fire-and-forget audit trail.
//!
//! `AuditEmitter::emit` only ever enqueues into a bounded buffer; a background
//! flusher writes batches to the sink. The producer never blocks and never
//! sees an error:
//! - buffer full: the event is diverted to the overflow queue in the background
//! - sink failure: the whole batch goes to the overflow queue
//! - after a successful flush (and on idle ticks) overflow batches are replayed
//! - shutdown grace expired: the in-flight write is abandoned and everything
//!   still buffered is moved to the overflow queue

mod overflow;
mod sink;

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use courier_common::config::AppConfig;

use crate::telemetry;

pub use overflow::{MemoryOverflowQueue, OverflowQueue, RedisOverflowQueue};
pub use sink::{AuditSink, HttpAuditSink, LogAuditSink};

pub mod event_types {
    pub const DELIVERY_STARTED: &str = "notification.delivery.started";
    pub const MESSAGE_SENT: &str = "notification.message.sent";
    pub const MESSAGE_RETRYING: &str = "notification.message.retrying";
    pub const MESSAGE_FAILED: &str = "notification.message.failed";
    pub const REQUEST_COMPLETED: &str = "notification.request.completed";
    pub const REQUEST_CREATED: &str = "notification.request.created";
    pub const SANITIZATION_DEGRADED: &str = "notification.sanitization.degraded";
    pub const CIRCUIT_OPENED: &str = "notification.circuit.opened";
    pub const CIRCUIT_CLOSED: &str = "notification.circuit.closed";
}

pub const DEFAULT_ACTOR: &str = "courier-controller";
pub const DEFAULT_RETENTION_DAYS: u32 = 365;

/// How long shutdown waits for the buffer to move to overflow once the grace
/// period is over.
const OVERFLOW_DIVERT_TIMEOUT: Duration = Duration::from_secs(2);

const SINK_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum AuditError {
    #[error("audit sink rejected batch: {0}")]
    Sink(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditResource {
    pub kind: String,
    pub id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEvent {
    pub event_id: Uuid,
    pub correlation_id: String,
    /// `<domain>.<category>.<action>`
    pub event_type: String,
    pub actor: String,
    pub resource: AuditResource,
    pub timestamp: DateTime<Utc>,
    pub retention_days: u32,
    pub payload: serde_json::Value,
}

impl AuditEvent {
    pub fn new(
        event_type: &str,
        correlation_id: impl Into<String>,
        resource: AuditResource,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            correlation_id: correlation_id.into(),
            event_type: event_type.to_string(),
            actor: DEFAULT_ACTOR.to_string(),
            resource,
            timestamp: Utc::now(),
            retention_days: DEFAULT_RETENTION_DAYS,
            payload,
        }
    }

    pub fn for_notification(
        event_type: &str,
        notification_id: Uuid,
        correlation_id: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self::new(
            event_type,
            correlation_id,
            AuditResource {
                kind: "NotificationRequest".to_string(),
                id: notification_id.to_string(),
            },
            payload,
        )
    }

    pub fn for_channel(event_type: &str, channel: &str, payload: serde_json::Value) -> Self {
        Self::new(
            event_type,
            format!("channel:{}", channel),
            AuditResource {
                kind: "DeliveryChannel".to_string(),
                id: channel.to_string(),
            },
            payload,
        )
    }

    pub fn with_actor(mut self, actor: impl Into<String>) -> Self {
        self.actor = actor.into();
        self
    }
}

#[derive(Debug, Clone, Copy)]
pub struct AuditConfig {
    pub buffer_size: usize,
    pub batch_size: usize,
    pub flush_interval: Duration,
    /// Overflow batches replayed after each successful flush.
    pub replay_batches: usize,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            buffer_size: 1024,
            batch_size: 100,
            flush_interval: Duration::from_secs(1),
            replay_batches: 10,
        }
    }
}

/// Start an emitter from process configuration: HTTP sink when
/// `AUDIT_SINK_URL` is set (log otherwise), Redis overflow when `REDIS_URL`
/// is set (bounded memory otherwise).
pub async fn start_from_config(config: &AppConfig) -> Result<AuditEmitter, AuditError> {
    let sink: Arc<dyn AuditSink> = match &config.audit_sink_url {
        Some(url) => Arc::new(HttpAuditSink::new(url.clone(), SINK_TIMEOUT)?),
        None => {
            tracing::info!("AUDIT_SINK_URL not set, audit events go to the log");
            Arc::new(LogAuditSink)
        }
    };

    let overflow: Arc<dyn OverflowQueue> = match &config.redis_url {
        Some(url) => Arc::new(
            RedisOverflowQueue::connect(
                url,
                config.audit_overflow_key.clone(),
                config.audit_overflow_capacity,
            )
            .await?,
        ),
        None => Arc::new(MemoryOverflowQueue::new(config.audit_overflow_capacity)),
    };

    Ok(AuditEmitter::start(
        AuditConfig {
            buffer_size: config.audit_buffer_size,
            batch_size: config.audit_batch_size,
            flush_interval: Duration::from_millis(config.audit_flush_interval_ms),
            ..Default::default()
        },
        sink,
        overflow,
    ))
}

/// Cheap to clone; all clones feed the same flusher.
#[derive(Clone)]
pub struct AuditEmitter {
    tx: mpsc::Sender<AuditEvent>,
    overflow: Arc<dyn OverflowQueue>,
    cancel: CancellationToken,
    hard_stop: CancellationToken,
    flusher: Arc<tokio::sync::Mutex<Option<JoinHandle<()>>>>,
}

impl AuditEmitter {
    /// Start the background flusher. Must be called inside a Tokio runtime.
    pub fn start(
        config: AuditConfig,
        sink: Arc<dyn AuditSink>,
        overflow: Arc<dyn OverflowQueue>,
    ) -> Self {
        let (tx, rx) = mpsc::channel(config.buffer_size.max(1));
        let cancel = CancellationToken::new();
        let hard_stop = CancellationToken::new();

        let flusher = Flusher {
            config,
            sink,
            overflow: overflow.clone(),
            buffer: Vec::with_capacity(config.batch_size),
            hard_stop: hard_stop.clone(),
        };
        let handle = tokio::spawn(flusher.run(rx, cancel.clone()));

        Self {
            tx,
            overflow,
            cancel,
            hard_stop,
            flusher: Arc::new(tokio::sync::Mutex::new(Some(handle))),
        }
    }

    /// Enqueue an event. Never blocks, never fails.
    pub fn emit(&self, event: AuditEvent) {
        let event = match self.tx.try_send(event) {
            Ok(()) => return,
            Err(TrySendError::Full(event)) => {
                tracing::warn!(event_type = %event.event_type, "Audit buffer full, diverting to overflow");
                event
            }
            Err(TrySendError::Closed(event)) => {
                tracing::warn!(event_type = %event.event_type, "Audit emitter stopped, diverting to overflow");
                event
            }
        };

        telemetry::record_audit("overflowed", 1);
        let overflow = self.overflow.clone();
        tokio::spawn(async move {
            if let Err(e) = overflow.push(vec![event]).await {
                tracing::error!(error = %e, "Audit event lost");
                telemetry::record_audit("dropped", 1);
            }
        });
    }

    /// Stop intake and flush what is buffered, waiting at most `grace`.
    /// Returns whether the final flush reached the sink in time. When it did
    /// not, the remaining events are moved to the overflow queue.
    pub async fn shutdown(&self, grace: Duration) -> bool {
        self.cancel.cancel();
        let Some(mut handle) = self.flusher.lock().await.take() else {
            return true;
        };
        if tokio::time::timeout(grace, &mut handle).await.is_ok() {
            tracing::info!("Audit emitter flushed");
            return true;
        }

        tracing::warn!(
            grace_ms = grace.as_millis() as u64,
            "Audit flush did not finish within grace period, moving remaining events to overflow"
        );
        self.hard_stop.cancel();
        if tokio::time::timeout(OVERFLOW_DIVERT_TIMEOUT, &mut handle)
            .await
            .is_err()
        {
            tracing::error!("Audit overflow unavailable at shutdown, remaining events lost");
            handle.abort();
        }
        false
    }
}

struct Flusher {
    config: AuditConfig,
    sink: Arc<dyn AuditSink>,
    overflow: Arc<dyn OverflowQueue>,
    buffer: Vec<AuditEvent>,
    /// Fired when the shutdown grace is over; sink writes are abandoned.
    hard_stop: CancellationToken,
}

impl Flusher {
    async fn run(mut self, mut rx: mpsc::Receiver<AuditEvent>, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.config.flush_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                received = rx.recv() => match received {
                    Some(event) => {
                        self.buffer.push(event);
                        if self.buffer.len() >= self.config.batch_size {
                            self.flush().await;
                        }
                    }
                    None => break,
                },
                _ = ticker.tick() => {
                    if self.buffer.is_empty() {
                        self.replay().await;
                    } else {
                        self.flush().await;
                    }
                }
            }
        }

        // Drain whatever producers managed to enqueue
        rx.close();
        while let Some(event) = rx.recv().await {
            self.buffer.push(event);
            if self.buffer.len() >= self.config.batch_size {
                self.flush().await;
            }
        }
        if !self.buffer.is_empty() {
            self.flush().await;
        }
        tracing::debug!("Audit flusher stopped");
    }

    async fn flush(&mut self) {
        let batch = std::mem::take(&mut self.buffer);
        let count = batch.len();

        match self.write(&batch).await {
            Ok(()) => {
                telemetry::record_audit("flushed", count);
                self.replay().await;
            }
            Err(e) => {
                tracing::warn!(error = %e, events = count, "Audit sink unavailable, moving batch to overflow");
                telemetry::record_audit("overflowed", count);
                if let Err(e) = self.overflow.push(batch).await {
                    tracing::error!(error = %e, events = count, "Audit batch lost");
                    telemetry::record_audit("dropped", count);
                }
            }
        }
    }

    async fn write(&self, batch: &[AuditEvent]) -> Result<(), AuditError> {
        tokio::select! {
            biased;
            _ = self.hard_stop.cancelled() => {
                Err(AuditError::Sink("shutdown grace period expired".to_string()))
            }
            result = self.sink.write_batch(batch) => result,
        }
    }

    async fn replay(&mut self) {
        for _ in 0..self.config.replay_batches {
            if self.hard_stop.is_cancelled() {
                return;
            }
            let batch = match self.overflow.pop().await {
                Ok(Some(batch)) => batch,
                Ok(None) => return,
                Err(e) => {
                    tracing::warn!(error = %e, "Failed to read audit overflow");
                    return;
                }
            };

            let count = batch.len();
            if let Err(e) = self.write(&batch).await {
                tracing::debug!(error = %e, "Audit replay failed, keeping batch");
                if let Err(e) = self.overflow.requeue(batch).await {
                    tracing::error!(error = %e, events = count, "Audit batch lost");
                    telemetry::record_audit("dropped", count);
                }
                return;
            }
            telemetry::record_audit("replayed", count);
        }
    }
}
