//! # Game server connection engine
//!
//! Starts one server role: loads configuration from the environment,
//! connects the shared store, listens for clients and drains them on
//! Ctrl+C.
//!
//! ## Dependencies
//! - `tokio` for asynchronous runtime
//! - `dotenv` for environment configuration
//! - `tracing` for logging
//! - `redis` for the shared population store

use penguin_engine::{
    config::ServerConfig,
    server::{health, EngineBuilder},
    store::{MemoryStore, RedisStore, StateStore},
    utils,
};
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info, warn};

/// Entry point for the server.
///
/// # Errors
/// Returns an error if configuration validation fails or if the server fails to bind to a port.
#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    let _ = dotenv::dotenv();

    let config = ServerConfig::from_env()?;
    utils::init_tracing(&config.log_filter);
    config.validate()?;

    let store: Arc<dyn StateStore> = match &config.redis_url {
        Some(url) => {
            let store = RedisStore::open(url)?;
            store.connect_in_background();
            store as Arc<dyn StateStore>
        }
        None => {
            warn!("No redis_url configured, population is only kept in memory");
            Arc::new(MemoryStore::ready())
        }
    };

    let engine = EngineBuilder::from_config(&config).store(store).build()?;

    if let Some(port) = config.metrics_port {
        let metrics = engine.metrics().clone();
        tokio::spawn(async move {
            if let Err(e) = health::serve_metrics_http(metrics, port).await {
                error!("Metrics server stopped: {}", e);
            }
        });
    }

    engine.run(&config.address, config.port).await?;

    shutdown_signal().await;
    info!("Shutting down gracefully");

    engine.stop_listening();
    engine.connection_lost("shutdown signal received").await;

    Ok(())
}

/// Waits for Ctrl+C.
async fn shutdown_signal() {
    if let Err(e) = signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {}", e);
    }
}
