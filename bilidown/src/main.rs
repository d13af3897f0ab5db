use std::sync::Arc;

use anyhow::Context;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use bilidown::config::AppConfig;
use bilidown::logging::init_logging;
use bilidown::services::ServiceContainer;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    let config = AppConfig::from_env().context("invalid configuration")?;

    // Initialize logging
    let (logging, _guard) = init_logging(&config.log_dir).context("failed to initialize logging")?;
    let background = CancellationToken::new();
    logging.start_retention_cleanup(background.clone());

    info!(
        version = env!("CARGO_PKG_VERSION"),
        workers = config.workers,
        log_dir = %logging.log_dir().display(),
        "Starting bilidown"
    );

    let container = match ServiceContainer::bootstrap(&config).await {
        Ok(container) => Arc::new(container),
        Err(e) => {
            error!(error = %e, "Startup failed");
            return Err(e.into());
        }
    };

    let server = container.api_server(Some(logging));
    let shutdown = server.cancel_token();
    tokio::spawn(async move {
        shutdown_signal().await;
        shutdown.cancel();
    });

    let served = server.run().await;

    container.shutdown().await;
    background.cancel();

    served?;
    info!("bilidown stopped");
    Ok(())
}

/// Resolve on SIGINT, or SIGTERM on Unix.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl-C");
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
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => info!("Received SIGINT, shutting down"),
        () = terminate => info!("Received SIGTERM, shutting down"),
    }
}
