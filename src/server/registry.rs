use std::{
    collections::VecDeque,
    sync::{Arc, Mutex, MutexGuard},
};
use thiserror::Error;
use uuid::Uuid;

use crate::server::client::Client;

/// Reasons an admission can be refused by the registry.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum RegistryError {
    #[error("Registry full ({occupancy} connections, maximum {maximum})")]
    Full { occupancy: usize, maximum: usize },
    #[error("Client {0} is already registered")]
    Duplicate(Uuid),
}

/// Ordered set of live clients, in admission order.
///
/// The lock is only ever held for synchronous work and never across an
/// `.await`. Mutations hand the new size to a callback while still holding
/// the lock, so whatever the callback records is ordered exactly like the
/// mutations themselves.
#[derive(Debug)]
pub struct Registry {
    clients: Mutex<VecDeque<Arc<Client>>>,
    maximum: usize,
}

impl Registry {
    pub fn new(maximum: usize) -> Self {
        Self {
            clients: Mutex::new(VecDeque::new()),
            maximum,
        }
    }

    pub fn maximum(&self) -> usize {
        self.maximum
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<Arc<Client>>> {
        self.clients.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Builds and appends a client unless occupancy already exceeds the maximum.
    ///
    /// Rejection happens only once `len > maximum`, so `maximum + 1`
    /// clients fit. `make` only runs once capacity is confirmed. On success
    /// `on_change` receives the size after the append.
    pub fn admit(
        &self,
        make: impl FnOnce() -> Arc<Client>,
        on_change: impl FnOnce(usize),
    ) -> Result<(Arc<Client>, usize), RegistryError> {
        let mut clients = self.lock();

        if clients.len() > self.maximum {
            return Err(RegistryError::Full {
                occupancy: clients.len(),
                maximum: self.maximum,
            });
        }

        let client = make();
        if clients.iter().any(|c| c.id() == client.id()) {
            return Err(RegistryError::Duplicate(client.id()));
        }

        clients.push_back(client.clone());
        let population = clients.len();
        on_change(population);
        Ok((client, population))
    }

    /// Removes the client with `id`. `on_change` only runs when something was removed.
    pub fn remove(&self, id: Uuid, on_change: impl FnOnce(usize)) -> Option<Arc<Client>> {
        let mut clients = self.lock();

        let index = clients.iter().position(|c| c.id() == id)?;
        let removed = clients.remove(index);
        on_change(clients.len());
        removed
    }

    pub fn contains(&self, id: Uuid) -> bool {
        self.lock().iter().any(|c| c.id() == id)
    }

    /// Point-in-time copy of the registered clients, in admission order.
    pub fn snapshot(&self) -> Vec<Arc<Client>> {
        self.lock().iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}
