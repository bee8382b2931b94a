//! Fire-and-forget lifecycle notifications.
//!
//! Room and feature subsystems subscribe here instead of being called by
//! the engine directly. Emitting never waits on subscribers; a subscriber
//! that falls too far behind misses events and sees `RecvError::Lagged`.

use tokio::sync::broadcast;
use tracing::trace;
use uuid::Uuid;

use crate::server::client::{ClientRef, PenguinId};
use crate::server::engine::EngineRef;

/// Events published by the engine.
#[derive(Debug, Clone)]
pub enum EngineEvent {
    /// The store signalled initial connectivity. Emitted once per engine.
    EngineReady { server_id: u32, engine: EngineRef },
    /// `Engine::disconnect` was called for this client.
    ///
    /// Emitted before removal is attempted, whether or not the client was
    /// still registered.
    ClientRemoved {
        connection_id: Uuid,
        penguin_id: Option<PenguinId>,
        client: ClientRef,
    },
}

impl EngineEvent {
    /// Stable event name, as used in log lines.
    pub fn name(&self) -> &'static str {
        match self {
            EngineEvent::EngineReady { .. } => "onEngine",
            EngineEvent::ClientRemoved { .. } => "onClientRemove",
        }
    }
}

/// Broadcast channel carrying [`EngineEvent`]s.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<EngineEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.tx.subscribe()
    }

    /// Publishes `event`. Having no subscribers is not an error.
    pub fn emit(&self, event: EngineEvent) {
        trace!(event = event.name(), "Emitting event");
        let _ = self.tx.send(event);
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::client::Client;

    #[tokio::test]
    async fn delivers_in_emit_order() {
        let bus = EventBus::new(8);
        let mut rx = bus.subscribe();
        assert_eq!(bus.subscriber_count(), 1);

        let a = Client::new("127.0.0.1:1".parse().unwrap(), EngineRef::detached());
        let b = Client::new("127.0.0.1:2".parse().unwrap(), EngineRef::detached());
        for client in [&a, &b] {
            bus.emit(EngineEvent::ClientRemoved {
                connection_id: client.id(),
                penguin_id: None,
                client: client.reference(),
            });
        }

        for expected in [a.id(), b.id()] {
            match rx.recv().await.unwrap() {
                EngineEvent::ClientRemoved { connection_id, .. } => assert_eq!(connection_id, expected),
                other => panic!("unexpected event {:?}", other),
            }
        }
    }

    #[test]
    fn emit_without_subscribers_is_harmless() {
        let bus = EventBus::default();
        bus.emit(EngineEvent::EngineReady {
            server_id: 1,
            engine: EngineRef::detached(),
        });
    }
}
