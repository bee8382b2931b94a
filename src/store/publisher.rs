use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use super::{StateStore, POPULATION_FIELD};

enum PublishRequest {
    Population(usize, Option<oneshot::Sender<()>>),
    Flush(oneshot::Sender<()>),
}

/// Fire-and-forget population writer.
///
/// A single background task owns the store writes, so values reach the
/// store in the order they were published. Callers never wait on the
/// store, and store failures are only logged.
#[derive(Clone)]
pub struct PopulationPublisher {
    tx: mpsc::UnboundedSender<PublishRequest>,
}

impl PopulationPublisher {
    /// Spawns the writer task. Must be called from within a tokio runtime.
    ///
    /// The task exits once every publisher clone has been dropped.
    pub fn spawn(store: Arc<dyn StateStore>, key: String) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            while let Some(request) = rx.recv().await {
                match request {
                    PublishRequest::Population(population, ack) => {
                        let fields = [(POPULATION_FIELD, population.to_string())];
                        match store.set_fields(&key, &fields).await {
                            Ok(()) => debug!(key = %key, population, "Population published"),
                            Err(e) => warn!(key = %key, population, "Population write failed: {}", e),
                        }
                        if let Some(ack) = ack {
                            let _ = ack.send(());
                        }
                    }
                    PublishRequest::Flush(ack) => {
                        let _ = ack.send(());
                    }
                }
            }
        });

        Self { tx }
    }

    /// Queues a population write without waiting for it.
    pub fn publish(&self, population: usize) {
        if self.tx.send(PublishRequest::Population(population, None)).is_err() {
            warn!(population, "Population publisher has stopped");
        }
    }

    /// Queues a population write and waits until the store call returned.
    ///
    /// A failed store write still counts as completed.
    pub async fn publish_and_wait(&self, population: usize) {
        let (ack, done) = oneshot::channel();
        if self
            .tx
            .send(PublishRequest::Population(population, Some(ack)))
            .is_ok()
        {
            let _ = done.await;
        }
    }

    /// Waits until every previously queued write has been attempted.
    pub async fn flush(&self) {
        let (ack, done) = oneshot::channel();
        if self.tx.send(PublishRequest::Flush(ack)).is_ok() {
            let _ = done.await;
        }
    }
}
