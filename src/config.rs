use config::Config;
use serde::Deserialize;

use crate::server::engine::{ServerKind, ServerProtocol};
use crate::utils::error::EngineError;

/// Configuration settings for one server role.
#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// Identity under which the population is published.
    pub server_id: u32,
    /// Role of this server.
    pub server_type: ServerKind,
    /// Display name used in logs.
    pub name: String,
    /// Number of users the server holds at once.
    pub max_users: usize,
    /// Address advertised in logs, and bound when `bind_address` is set.
    pub address: String,
    /// The port on which the server will listen.
    pub port: u16,
    /// Whether to bind `address` instead of all interfaces.
    pub bind_address: bool,
    /// Client protocol generation.
    pub protocol: ServerProtocol,
    /// Redis URL for the shared store. The in-memory store is used when absent.
    pub redis_url: Option<String>,
    /// Port for the Prometheus `/metrics` endpoint. Disabled when absent.
    pub metrics_port: Option<u16>,
    /// Per-subscriber buffer of the event bus.
    pub event_capacity: usize,
    /// Default tracing filter, overridden by `RUST_LOG`.
    pub log_filter: String,
}

impl ServerConfig {
    /// Loads the server configuration from environment variables.
    ///
    /// Environment variables should be prefixed with `ENGINE_`, e.g.
    /// `ENGINE_SERVER_ID=100`.
    ///
    /// # Errors
    /// Returns a `EngineError::ConfigurationError` if the configuration cannot be loaded.
    pub fn from_env() -> Result<Self, EngineError> {
        Self::builder()
            .and_then(|b| {
                b.add_source(config::Environment::with_prefix("ENGINE"))
                    .build()
            })
            .map_err(|e| EngineError::ConfigurationError(e.to_string()))?
            .try_deserialize()
            .map_err(|e| EngineError::ConfigurationError(e.to_string()))
    }

    fn builder() -> Result<config::ConfigBuilder<config::builder::DefaultState>, config::ConfigError> {
        Config::builder()
            .set_default("server_type", "world")?
            .set_default("name", "World Server 1")?
            .set_default("max_users", 300)?
            .set_default("address", "0.0.0.0")?
            .set_default("port", 6112)?
            .set_default("bind_address", false)?
            .set_default("protocol", "as3")?
            .set_default("event_capacity", 1024)?
            .set_default("log_filter", "info")
    }

    /// Validates the configuration settings.
    ///
    /// # Errors
    /// Returns a `EngineError::ConfigurationError` if validation fails.
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.max_users == 0 {
            return Err(EngineError::ConfigurationError(
                "max_users must be greater than 0".into(),
            ));
        }

        if self.name.trim().is_empty() {
            return Err(EngineError::ConfigurationError(
                "name must not be empty".into(),
            ));
        }

        if self.event_capacity == 0 {
            return Err(EngineError::ConfigurationError(
                "event_capacity must be greater than 0".into(),
            ));
        }

        Ok(())
    }
}
