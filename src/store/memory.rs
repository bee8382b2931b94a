use std::{
    collections::HashMap,
    sync::Mutex,
};

use async_trait::async_trait;
use tokio::sync::watch;

use super::{StateStore, StoreError, POPULATION_FIELD};

/// A single recorded `set_fields` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreWrite {
    pub key: String,
    pub fields: Vec<(String, String)>,
}

/// In-process store used when no Redis URL is configured, and by tests.
///
/// Every write is kept in order so callers can inspect the exact sequence
/// of values the engine published.
#[derive(Debug)]
pub struct MemoryStore {
    hashes: Mutex<HashMap<String, HashMap<String, String>>>,
    writes: Mutex<Vec<StoreWrite>>,
    ready: watch::Sender<bool>,
}

impl MemoryStore {
    /// Creates a store that is ready immediately.
    pub fn ready() -> Self {
        let store = Self::pending();
        store.mark_ready();
        store
    }

    /// Creates a store whose readiness signal fires only after [`mark_ready`](Self::mark_ready).
    pub fn pending() -> Self {
        let (ready, _) = watch::channel(false);
        Self {
            hashes: Mutex::new(HashMap::new()),
            writes: Mutex::new(Vec::new()),
            ready,
        }
    }

    /// Signals readiness to every current and future waiter.
    pub fn mark_ready(&self) {
        self.ready.send_replace(true);
    }

    /// Returns the current value of `field` in the hash at `key`.
    pub fn get_field(&self, key: &str, field: &str) -> Option<String> {
        let hashes = self.hashes.lock().unwrap_or_else(|e| e.into_inner());
        hashes.get(key).and_then(|hash| hash.get(field).cloned())
    }

    /// Returns every write recorded so far, oldest first.
    pub fn writes(&self) -> Vec<StoreWrite> {
        self.writes.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Returns the population values written under `key`, oldest first.
    pub fn population_history(&self, key: &str) -> Vec<usize> {
        self.writes()
            .into_iter()
            .filter(|write| write.key == key)
            .filter_map(|write| {
                write
                    .fields
                    .into_iter()
                    .find(|(field, _)| field == POPULATION_FIELD)
                    .and_then(|(_, value)| value.parse().ok())
            })
            .collect()
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::ready()
    }
}

#[async_trait]
impl StateStore for MemoryStore {
    async fn set_fields(&self, key: &str, fields: &[(&str, String)]) -> Result<(), StoreError> {
        {
            let mut hashes = self.hashes.lock().unwrap_or_else(|e| e.into_inner());
            let hash = hashes.entry(key.to_string()).or_default();
            for (field, value) in fields {
                hash.insert(field.to_string(), value.clone());
            }
        }

        self.writes
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(StoreWrite {
                key: key.to_string(),
                fields: fields
                    .iter()
                    .map(|(field, value)| (field.to_string(), value.clone()))
                    .collect(),
            });
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

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn records_writes_in_order() {
        let store = MemoryStore::ready();
        store.set_fields("server:1", &[(POPULATION_FIELD, "1".into())]).await.unwrap();
        store.set_fields("server:2", &[(POPULATION_FIELD, "7".into())]).await.unwrap();
        store.set_fields("server:1", &[(POPULATION_FIELD, "0".into())]).await.unwrap();

        assert_eq!(store.population_history("server:1"), vec![1, 0]);
        assert_eq!(store.get_field("server:2", POPULATION_FIELD).as_deref(), Some("7"));
        assert_eq!(store.writes().len(), 3);
    }

    #[tokio::test]
    async fn pending_store_resolves_after_mark_ready() {
        let store = std::sync::Arc::new(MemoryStore::pending());

        let waiter = {
            let store = store.clone();
            tokio::spawn(async move { store.wait_ready().await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        store.mark_ready();
        let result = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter should finish")
            .unwrap();
        assert!(result.is_ok());
    }
}
