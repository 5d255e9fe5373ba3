use anyhow::Result;
use throttler_cluster::config::Config;
use throttler_cluster::server::{shutdown_signal, Server, ServerDeps};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables from .env file
    dotenv::dotenv().ok();

    let config = Config::from_env();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                format!("throttler_cluster={},tower_http=debug", config.log_level).into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    config
        .validate_all()
        .map_err(|e| anyhow::anyhow!("Invalid configuration: {}", e))?;

    tracing::info!(
        listen_address = %config.listen_address,
        peers = ?config.peers,
        max_batch_size = config.max_batch_size,
        "Starting throttler cluster node"
    );

    let deps = ServerDeps::from_config(&config);
    let mut server = Server::bind(config, deps)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to create server: {}", e))?;

    if let Err(e) = server.start().await {
        server.stop().await;
        return Err(anyhow::anyhow!("Failed to start server: {}", e));
    }

    shutdown_signal().await;
    server.stop().await;

    tracing::info!("Throttler cluster node stopped");
    Ok(())
}
