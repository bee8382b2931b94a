//! External shared state store.
//!
//! The engine only needs two things from the store: a "set multiple hash
//! fields" write used to publish the population counter, and a one-time
//! readiness signal. Both are expressed by [`StateStore`].

pub mod memory;
pub mod publisher;
pub mod redis;

pub use self::memory::MemoryStore;
pub use self::publisher::PopulationPublisher;
pub use self::redis::RedisStore;

use async_trait::async_trait;
use thiserror::Error;

/// Hash field holding the live connection count.
pub const POPULATION_FIELD: &str = "population";

/// Returns the store key under which a server publishes its state.
pub fn server_key(server_id: u32) -> String {
    format!("server:{}", server_id)
}

/// Errors reported by a [`StateStore`] implementation.
#[derive(Error, Debug)]
pub enum StoreError {
    /// The store connection has not been established yet.
    #[error("Store connection is not ready")]
    NotReady,

    /// The store went away and will never become ready.
    #[error("Store connection closed")]
    Closed,

    /// The store refused the operation.
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    #[error("Redis error: {0}")]
    Redis(#[from] ::redis::RedisError),
}

/// Async key/value store the engine publishes its population to.
#[async_trait]
pub trait StateStore: Send + Sync + 'static {
    /// Sets several fields of the hash stored at `key`.
    async fn set_fields(&self, key: &str, fields: &[(&str, String)]) -> Result<(), StoreError>;

    /// Resolves once the store connection is usable.
    ///
    /// Resolves immediately if the store is already ready.
    async fn wait_ready(&self) -> Result<(), StoreError>;
}
