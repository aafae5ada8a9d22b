use tokio_util::sync::CancellationToken;

use courier_common::config::AppConfig;
use courier_controller::Controller;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "courier_controller=info,courier_engine=info,courier_notifier=info".into()),
        )
        .json()
        .init();

    tracing::info!("Courier controller starting...");

    // Load configuration
    let config = AppConfig::from_env()?;
    courier_engine::telemetry::describe();

    let controller = Controller::build(&config).await?;

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for shutdown signal");
        }
        tracing::info!("Received shutdown signal, stopping gracefully...");
        on_signal.cancel();
    });

    controller.run(cancel).await?;

    tracing::info!("Courier controller stopped.");
    Ok(())
}
