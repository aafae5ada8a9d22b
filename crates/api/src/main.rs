//! Courier API server binary entrypoint.
//!
//! Admits notifications into Postgres. Reconciliation happens in
//! `courier-controller`, which picks new objects up on its next resync.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

use courier_common::config::AppConfig;
use courier_common::db::connect_and_migrate;
use courier_engine::audit::start_from_config;
use courier_engine::store::PgNotificationStore;

use courier_api::routes::create_router;
use courier_api::state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new("courier_api=debug,courier_engine=info,tower_http=debug")
        }))
        .init();

    tracing::info!("Starting Courier API server...");

    // Load configuration
    let config = AppConfig::from_env()?;
    let database_url = config
        .database_url
        .as_deref()
        .ok_or_else(|| anyhow::anyhow!("DATABASE_URL is required for the standalone API"))?;

    let pool = connect_and_migrate(database_url, config.db_max_connections).await?;
    let store = Arc::new(PgNotificationStore::new(pool));

    let audit = start_from_config(&config).await?;

    let state = AppState::new(store).with_audit(audit.clone());

    // Build router
    let app = create_router(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive());

    // Start server
    let addr: SocketAddr = config
        .api_bind_addr
        .as_deref()
        .unwrap_or("0.0.0.0:3000")
        .parse()?;
    tracing::info!("API server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("Received shutdown signal, stopping gracefully...");
        })
        .await?;

    audit
        .shutdown(Duration::from_secs(config.audit_shutdown_grace_secs))
        .await;
    tracing::info!("Courier API server stopped.");
    Ok(())
}
