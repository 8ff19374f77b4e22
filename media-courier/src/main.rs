use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tracing::{error, info, warn};

use media_courier::bot::BotRunner;
use media_courier::config::AppConfig;
use media_courier::logging;
use media_courier::services::ServiceContainer;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = AppConfig::from_env().context("loading configuration")?;

    let (logging_config, _log_guard) =
        logging::init_logging(config.log_filter.as_deref(), config.log_dir.as_deref())
            .context("initializing logging")?;

    let container = ServiceContainer::new(&config).context("building services")?;
    container.start().await.context("starting services")?;
    logging_config.start_retention_cleanup(container.cancellation_token());
    #[cfg(unix)]
    logging_config.start_filter_reload(container.cancellation_token(), AppConfig::reload_log_filter);

    let bot = Arc::new(BotRunner::new(
        Arc::clone(&container.telegram),
        Arc::clone(&container.courier),
        Duration::from_secs(config.telegram.poll_timeout_secs),
    ));
    let polling = tokio::spawn(bot.run(container.cancellation_token()));
    info!(
        workers = config.queue.workers,
        queue_capacity = config.queue.capacity,
        "media-courier started"
    );

    shutdown_signal().await;

    container.shutdown().await;
    if let Err(e) = polling.await {
        error!(error = %e, "Polling task failed");
    }
    info!("media-courier stopped");
    Ok(())
}

/// Wait for Ctrl+C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C signal"),
        _ = terminate => info!("Received terminate signal"),
    }
}
