//! Secondary queues holding audit batches the sink did not accept.

use std::collections::VecDeque;
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use redis::AsyncCommands;
use redis::aio::ConnectionManager;

use super::{AuditError, AuditEvent};
use crate::telemetry;

#[async_trait]
pub trait OverflowQueue: Send + Sync {
    /// Append a batch at the back.
    async fn push(&self, batch: Vec<AuditEvent>) -> Result<(), AuditError>;

    /// Take the oldest batch.
    async fn pop(&self) -> Result<Option<Vec<AuditEvent>>, AuditError>;

    /// Put a batch back at the front after a failed replay.
    async fn requeue(&self, batch: Vec<AuditEvent>) -> Result<(), AuditError>;

    async fn len(&self) -> Result<usize, AuditError>;
}

/// Bounded in-process overflow. When full, the oldest batch is evicted.
pub struct MemoryOverflowQueue {
    capacity: usize,
    batches: Mutex<VecDeque<Vec<AuditEvent>>>,
}

impl MemoryOverflowQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            batches: Mutex::new(VecDeque::new()),
        }
    }

    fn evict_to_capacity(&self, batches: &mut VecDeque<Vec<AuditEvent>>) {
        while batches.len() > self.capacity {
            if let Some(evicted) = batches.pop_front() {
                tracing::error!(
                    events = evicted.len(),
                    capacity = self.capacity,
                    "Audit overflow full, dropping oldest batch"
                );
                telemetry::record_audit("dropped", evicted.len());
            }
        }
    }
}

#[async_trait]
impl OverflowQueue for MemoryOverflowQueue {
    async fn push(&self, batch: Vec<AuditEvent>) -> Result<(), AuditError> {
        let mut batches = self.batches.lock().unwrap_or_else(PoisonError::into_inner);
        batches.push_back(batch);
        self.evict_to_capacity(&mut batches);
        Ok(())
    }

    async fn pop(&self) -> Result<Option<Vec<AuditEvent>>, AuditError> {
        Ok(self
            .batches
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front())
    }

    async fn requeue(&self, batch: Vec<AuditEvent>) -> Result<(), AuditError> {
        let mut batches = self.batches.lock().unwrap_or_else(PoisonError::into_inner);
        batches.push_front(batch);
        // Evict from the back so the requeued batch survives
        while batches.len() > self.capacity {
            if let Some(evicted) = batches.pop_back() {
                telemetry::record_audit("dropped", evicted.len());
            }
        }
        Ok(())
    }

    async fn len(&self) -> Result<usize, AuditError> {
        Ok(self
            .batches
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len())
    }
}

/// Redis list of JSON-encoded batches, trimmed to the newest `capacity`.
#[derive(Clone)]
pub struct RedisOverflowQueue {
    conn: ConnectionManager,
    key: String,
    capacity: usize,
}

impl RedisOverflowQueue {
    pub async fn connect(
        redis_url: &str,
        key: impl Into<String>,
        capacity: usize,
    ) -> Result<Self, AuditError> {
        let client = redis::Client::open(redis_url)?;
        let conn = ConnectionManager::new(client).await?;
        tracing::info!("Connected to Redis for audit overflow");
        Ok(Self::new(conn, key, capacity))
    }

    pub fn new(conn: ConnectionManager, key: impl Into<String>, capacity: usize) -> Self {
        Self {
            conn,
            key: key.into(),
            capacity: capacity.max(1),
        }
    }
}

#[async_trait]
impl OverflowQueue for RedisOverflowQueue {
    async fn push(&self, batch: Vec<AuditEvent>) -> Result<(), AuditError> {
        let payload = serde_json::to_string(&batch)?;
        let mut conn = self.conn.clone();
        conn.rpush::<_, _, ()>(&self.key, payload).await?;
        let capacity = isize::try_from(self.capacity).unwrap_or(isize::MAX);
        conn.ltrim::<_, ()>(&self.key, -capacity, -1).await?;
        Ok(())
    }

    async fn pop(&self) -> Result<Option<Vec<AuditEvent>>, AuditError> {
        let mut conn = self.conn.clone();
        let payload: Option<String> = conn.lpop(&self.key, None).await?;
        match payload {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    async fn requeue(&self, batch: Vec<AuditEvent>) -> Result<(), AuditError> {
        let payload = serde_json::to_string(&batch)?;
        let mut conn = self.conn.clone();
        conn.lpush::<_, _, ()>(&self.key, payload).await?;
        Ok(())
    }

    async fn len(&self) -> Result<usize, AuditError> {
        let mut conn = self.conn.clone();
        let len: usize = conn.llen(&self.key).await?;
        Ok(len)
    }
}
