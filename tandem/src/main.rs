use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use tandem::config::DaemonConfig;
use tandem::logging::init_logging;
use tandem::services::ServiceContainer;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    let config = DaemonConfig::from_env_or_default();

    // Keep the guard alive for the file writer.
    let (logging, _guard) = init_logging(&config.log_dir)?;
    let retention_token = CancellationToken::new();
    logging.start_retention_cleanup(retention_token.clone());

    info!(version = env!("CARGO_PKG_VERSION"), "Starting tandem");

    let container = ServiceContainer::new(&config).await?;
    let listener = TcpListener::bind(config.socket_addr()?).await?;

    let shutdown = container.cancellation_token();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Received Ctrl-C"),
            Err(e) => error!(error = %e, "Failed to listen for Ctrl-C"),
        }
        shutdown.cancel();
    });

    if let Err(e) = container.serve(listener).await {
        error!(error = %e, "Server stopped with an error");
    }

    container.shutdown().await?;
    retention_token.cancel();
    info!("tandem stopped");
    Ok(())
}
