use std::str::FromStr;

use serde::Deserialize;

/// Global application configuration loaded from environment variables.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// PostgreSQL connection string. Without it the controller keeps
    /// notifications in memory.
    pub database_url: Option<String>,

    /// Maximum number of PostgreSQL connections in the pool (default: 20)
    pub db_max_connections: u32,

    /// Redis connection string for the audit overflow queue
    pub redis_url: Option<String>,

    /// Address to serve the HTTP API on (e.g. `0.0.0.0:3000`)
    pub api_bind_addr: Option<String>,

    /// Maximum concurrent reconcile invocations (default: 8)
    pub worker_count: usize,

    /// Capacity of the reconcile work queue (default: 1024)
    pub work_queue_capacity: usize,

    /// Interval between full resyncs of unfinished notifications in milliseconds (default: 30000)
    pub resync_interval_ms: u64,

    /// Requeue delay after a failed reconcile invocation in milliseconds (default: 5000)
    pub error_requeue_ms: u64,

    /// Per-call delivery timeout in seconds (default: 10)
    pub delivery_timeout_secs: u64,

    /// Consecutive failures that open a channel's circuit (default: 5)
    pub circuit_failure_threshold: u32,

    /// How long an open circuit rejects dispatches, in seconds (default: 60)
    pub circuit_cooldown_secs: u64,

    /// Re-read-and-retry budget for conflicting status writes (default: 3)
    pub status_conflict_retries: u32,

    /// Fraction of random jitter applied to retry delays (default: 0.1)
    pub retry_jitter: f64,

    /// Channels used when a notification names none (default: "console")
    pub fallback_channels: Vec<String>,

    /// Inputs larger than this skip the pattern catalog and use coarse redaction
    pub sanitizer_max_scan_bytes: usize,

    /// Audit sink endpoint. Without it audit events are written to the log.
    pub audit_sink_url: Option<String>,

    /// Bounded audit buffer size (default: 1024)
    pub audit_buffer_size: usize,

    /// Events per audit batch (default: 100)
    pub audit_batch_size: usize,

    /// Audit flush interval in milliseconds (default: 1000)
    pub audit_flush_interval_ms: u64,

    /// Grace period for the final audit flush on shutdown, in seconds (default: 10)
    pub audit_shutdown_grace_secs: u64,

    /// Redis list holding audit batches the sink did not accept
    pub audit_overflow_key: String,

    /// Batches kept by the in-memory overflow queue (default: 1000)
    pub audit_overflow_capacity: usize,

    /// Inline JSON channel configuration
    pub channels_json: Option<String>,

    /// Path to a JSON channel configuration file
    pub channels_file: Option<String>,
}

impl AppConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> anyhow::Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let or_default =
            |key: &str, default: &str| lookup(key).unwrap_or_else(|| default.to_string());

        Ok(Self {
            database_url: lookup("DATABASE_URL"),
            db_max_connections: parse(&lookup, "DB_MAX_CONNECTIONS", 20)?,
            redis_url: lookup("REDIS_URL"),
            api_bind_addr: lookup("API_BIND_ADDR"),
            worker_count: parse(&lookup, "WORKER_COUNT", 8)?,
            work_queue_capacity: parse(&lookup, "WORK_QUEUE_CAPACITY", 1024)?,
            resync_interval_ms: parse(&lookup, "RESYNC_INTERVAL_MS", 30_000)?,
            error_requeue_ms: parse(&lookup, "ERROR_REQUEUE_MS", 5_000)?,
            delivery_timeout_secs: parse(&lookup, "DELIVERY_TIMEOUT_SECS", 10)?,
            circuit_failure_threshold: parse(&lookup, "CIRCUIT_FAILURE_THRESHOLD", 5)?,
            circuit_cooldown_secs: parse(&lookup, "CIRCUIT_COOLDOWN_SECS", 60)?,
            status_conflict_retries: parse(&lookup, "STATUS_CONFLICT_RETRIES", 3)?,
            retry_jitter: parse(&lookup, "RETRY_JITTER", 0.1)?,
            fallback_channels: or_default("FALLBACK_CHANNELS", "console")
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect(),
            sanitizer_max_scan_bytes: parse(&lookup, "SANITIZER_MAX_SCAN_BYTES", 1024 * 1024)?,
            audit_sink_url: lookup("AUDIT_SINK_URL"),
            audit_buffer_size: parse(&lookup, "AUDIT_BUFFER_SIZE", 1024)?,
            audit_batch_size: parse(&lookup, "AUDIT_BATCH_SIZE", 100)?,
            audit_flush_interval_ms: parse(&lookup, "AUDIT_FLUSH_INTERVAL_MS", 1_000)?,
            audit_shutdown_grace_secs: parse(&lookup, "AUDIT_SHUTDOWN_GRACE_SECS", 10)?,
            audit_overflow_key: or_default("AUDIT_OVERFLOW_KEY", "courier:audit:overflow"),
            audit_overflow_capacity: parse(&lookup, "AUDIT_OVERFLOW_CAPACITY", 1000)?,
            channels_json: lookup("COURIER_CHANNELS"),
            channels_file: lookup("COURIER_CHANNELS_FILE"),
        })
    }
}

fn parse<T, F>(lookup: &F, key: &str, default: T) -> anyhow::Result<T>
where
    T: FromStr,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|_| anyhow::anyhow!("{} must be a valid {}", key, std::any::type_name::<T>())),
        None => Ok(default),
    }
}
