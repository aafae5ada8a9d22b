//! Courier controller: wires the store, channels, audit emitter and
//! reconciler into a worker pool, with a periodic resync and an optional
//! embedded HTTP API.

pub mod channels;
pub mod resync;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;

use courier_api::routes::create_router;
use courier_api::state::AppState;
use courier_common::config::AppConfig;
use courier_common::db::connect_and_migrate;
use courier_engine::audit::{AuditEmitter, start_from_config};
use courier_engine::circuit_breaker::{CircuitBreakerConfig, CircuitBreakers};
use courier_engine::clock::{Clock, SystemClock};
use courier_engine::reconciler::{Reconciler, ReconcilerConfig};
use courier_engine::sanitizer::Sanitizer;
use courier_engine::status::StatusManager;
use courier_engine::store::{MemoryStore, NotificationStore, PgNotificationStore};
use courier_engine::worker::{WorkQueue, WorkerConfig, WorkerPool};
use courier_notifier::ChannelRegistry;

use crate::channels::load_channel_configs;
use crate::resync::Resyncer;

/// A fully wired controller, ready to run.
pub struct Controller {
    store: Arc<dyn NotificationStore>,
    queue: WorkQueue,
    pool: WorkerPool<Reconciler>,
    resync: Resyncer,
    audit: AuditEmitter,
    api_addr: Option<SocketAddr>,
    audit_grace: Duration,
}

impl Controller {
    pub async fn build(config: &AppConfig) -> anyhow::Result<Self> {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);

        let store: Arc<dyn NotificationStore> = match &config.database_url {
            Some(url) => {
                let pool = connect_and_migrate(url, config.db_max_connections).await?;
                Arc::new(PgNotificationStore::new(pool))
            }
            None => {
                tracing::warn!("DATABASE_URL not set, notifications are kept in memory");
                Arc::new(MemoryStore::new())
            }
        };

        let channels = ChannelRegistry::from_configs(&load_channel_configs(config)?)?;
        tracing::info!(channels = ?channels.names(), "Delivery channels ready");

        let audit = start_from_config(config).await?;

        let reconciler = Reconciler::new(
            StatusManager::new(store.clone(), clock.clone(), config.status_conflict_retries),
            channels,
            Arc::new(CircuitBreakers::new(
                CircuitBreakerConfig {
                    failure_threshold: config.circuit_failure_threshold,
                    cooldown: Duration::from_secs(config.circuit_cooldown_secs),
                },
                clock.clone(),
            )),
            Sanitizer::new(config.sanitizer_max_scan_bytes),
            audit.clone(),
            clock,
            ReconcilerConfig {
                delivery_timeout: Duration::from_secs(config.delivery_timeout_secs),
                fallback_channels: config.fallback_channels.clone(),
                retry_jitter: config.retry_jitter,
                ..Default::default()
            },
        );

        let (pool, queue) = WorkerPool::new(
            Arc::new(reconciler),
            WorkerConfig {
                workers: config.worker_count,
                queue_capacity: config.work_queue_capacity,
                error_requeue: Duration::from_millis(config.error_requeue_ms),
            },
        );
        let resync = Resyncer::new(store.clone(), queue.clone(), config.resync_interval_ms);

        let api_addr = config
            .api_bind_addr
            .as_deref()
            .map(str::parse::<SocketAddr>)
            .transpose()?;

        Ok(Self {
            store,
            queue,
            pool,
            resync,
            audit,
            api_addr,
            audit_grace: Duration::from_secs(config.audit_shutdown_grace_secs),
        })
    }

    pub fn store(&self) -> Arc<dyn NotificationStore> {
        self.store.clone()
    }

    pub fn queue(&self) -> WorkQueue {
        self.queue.clone()
    }

    /// Run until `cancel` fires, then drain in-flight work and flush audit.
    pub async fn run(self, cancel: CancellationToken) -> anyhow::Result<()> {
        let workers = tokio::spawn(self.pool.run(cancel.child_token()));
        let resync = tokio::spawn(self.resync.run(cancel.child_token()));

        let api = match self.api_addr {
            Some(addr) => {
                let state = AppState::new(self.store.clone())
                    .with_queue(self.queue.clone())
                    .with_audit(self.audit.clone());
                let app = create_router(state).layer(TraceLayer::new_for_http());
                let listener = tokio::net::TcpListener::bind(addr).await?;
                tracing::info!("API server listening on {}", addr);

                let shutdown = cancel.clone();
                Some(tokio::spawn(async move {
                    axum::serve(listener, app)
                        .with_graceful_shutdown(async move { shutdown.cancelled().await })
                        .await
                }))
            }
            None => None,
        };

        cancel.cancelled().await;
        tracing::info!("Controller stopping...");

        if let Some(api) = api {
            if let Err(e) = api.await? {
                tracing::error!(error = %e, "API server exited with error");
            }
        }
        resync.await?;
        workers.await?;

        if !self.audit.shutdown(self.audit_grace).await {
            tracing::warn!("Some audit events may not have been delivered");
        }
        Ok(())
    }
}
