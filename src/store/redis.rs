use std::{sync::Arc, time::Duration};

use ::redis::{aio::ConnectionManager, AsyncCommands, Client};
use async_trait::async_trait;
use tokio::sync::{watch, OnceCell};
use tracing::{info, warn};

use super::{StateStore, StoreError};

/// Delay between attempts to establish the initial connection.
const RECONNECT_DELAY: Duration = Duration::from_secs(2);

/// Redis-backed [`StateStore`].
///
/// The connection is established in the background; until it is, writes
/// fail with [`StoreError::NotReady`] and `wait_ready` keeps waiting.
pub struct RedisStore {
    client: Client,
    connection: OnceCell<ConnectionManager>,
    ready: watch::Sender<bool>,
}

impl RedisStore {
    /// Parses `url` and returns an unconnected store.
    pub fn open(url: &str) -> Result<Arc<Self>, StoreError> {
        let client = Client::open(url)?;
        let (ready, _) = watch::channel(false);
        Ok(Arc::new(Self {
            client,
            connection: OnceCell::new(),
            ready,
        }))
    }

    /// Spawns a task that connects, retrying until it succeeds, then
    /// fires the readiness signal.
    pub fn connect_in_background(self: &Arc<Self>) {
        let store = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                match store.client.get_connection_manager().await {
                    Ok(connection) => {
                        let _ = store.connection.set(connection);
                        store.ready.send_replace(true);
                        info!("Redis connection established");
                        break;
                    }
                    Err(e) => {
                        warn!("Redis connection failed, retrying: {}", e);
                        tokio::time::sleep(RECONNECT_DELAY).await;
                    }
                }
            }
        });
    }
}

#[async_trait]
impl StateStore for RedisStore {
    async fn set_fields(&self, key: &str, fields: &[(&str, String)]) -> Result<(), StoreError> {
        let mut connection = self
            .connection
            .get()
            .cloned()
            .ok_or(StoreError::NotReady)?;

        connection.hset_multiple::<_, _, _, ()>(key, fields).await?;
        Ok(())
    }

    async fn wait_ready(&self) -> Result<(), StoreError> {
        let mut ready = self.ready.subscribe();
        while !*ready.borrow_and_update() {
            if ready.changed().await.is_err() {
                return Err(StoreError::Closed);
            }
        }
        Ok(())
    }
}
