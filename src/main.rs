//! robotrpc - Reference robot host
//!
//! Serves the robot RPC protocol over HTTP from an in-memory host.

use robotrpc_server::config::CONFIG_ENV;
use robotrpc_server::{Config, Server};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // Load configuration (from file if ROBOTRPC_CONFIG is set, then env overrides)
    let config_path = std::env::var(CONFIG_ENV).ok();
    let config = match Config::load() {
        Ok(c) => {
            if let Some(ref path) = config_path {
                tracing::info!("Loaded config from {}", path);
            }
            c
        }
        Err(e) => {
            // If a config file was explicitly specified, fail on error
            if config_path.is_some() {
                tracing::error!("Failed to load config: {}", e);
                return Err(e.into());
            }
            tracing::info!("Using default configuration");
            Config::default()
        }
    };

    tracing::info!("Starting robotrpc host");
    tracing::info!("  Bind address: {}", config.network.bind_addr);
    tracing::info!(
        "  Robot: {} on {}",
        config.bot.name,
        config.bot.protocol
    );
    tracing::info!(
        "  Tasks: {}, static callers: {}",
        config.tasks.len(),
        config.callers.len()
    );
    tracing::info!(
        "  Lock timeout: {}ms, reply timeout: {}s, pipeline idle timeout: {}s",
        config.brain.lock_timeout_ms,
        config.prompt.reply_timeout_secs,
        config.pipeline.idle_timeout_secs
    );
    if config.metrics.enabled {
        tracing::info!("  Metrics: enabled at /metrics");
    } else {
        tracing::info!("  Metrics: disabled");
    }

    let server = Arc::new(Server::from_config(&config)?);

    // Spawn shutdown signal handler
    let shutdown_server = server.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        tracing::info!("Received shutdown signal, stopping server...");
        shutdown_server.shutdown();
    });

    // Run server (blocks until shutdown)
    server.run().await?;

    tracing::info!("Server stopped");
    Ok(())
}
