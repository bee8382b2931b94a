use std::{
    fmt,
    net::SocketAddr,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, Weak,
    },
};
use serde::Deserialize;
use tokio::{net::TcpListener, task::JoinHandle};
use tracing::{debug, error, info, warn};

use crate::{
    config::ServerConfig,
    server::{
        capability::Capabilities,
        client::{Client, ClientRef, IntoPenguinId},
        events::{EngineEvent, EventBus},
        handler::{self, DiscardProtocol, ProtocolHandler},
        health::EngineMetrics,
        registry::{Registry, RegistryError},
    },
    store::{server_key, MemoryStore, PopulationPublisher, StateStore},
    utils::EngineError,
};

/// Role a server plays in the cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerKind {
    World,
    Login,
}

impl fmt::Display for ServerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServerKind::World => f.write_str("world"),
            ServerKind::Login => f.write_str("login"),
        }
    }
}

/// Client protocol generation spoken by the connections of this server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerProtocol {
    As2,
    #[default]
    As3,
}

impl fmt::Display for ServerProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServerProtocol::As2 => f.write_str("AS2"),
            ServerProtocol::As3 => f.write_str("AS3"),
        }
    }
}

/// Severities accepted by [`Engine::log`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Info,
    Warn,
    Error,
    Debug,
}

/// Non-owning reference to an [`Engine`].
///
/// Callbacks and background tasks hold this instead of an `Arc<Engine>`,
/// so they never keep a torn-down engine alive.
#[derive(Clone)]
pub struct EngineRef(Weak<Engine>);

impl EngineRef {
    /// Resolves to the live engine.
    ///
    /// # Errors
    ///
    /// Returns `EngineError::EngineGone` once the engine has been dropped.
    pub fn upgrade(&self) -> Result<Arc<Engine>, EngineError> {
        self.0.upgrade().ok_or(EngineError::EngineGone)
    }

    pub fn is_alive(&self) -> bool {
        self.0.strong_count() > 0
    }

    /// A reference that never resolves, for handles created outside an engine.
    #[cfg(test)]
    pub(crate) fn detached() -> Self {
        EngineRef(Weak::new())
    }
}

impl fmt::Debug for EngineRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EngineRef").field("alive", &self.is_alive()).finish()
    }
}

struct ListenerState {
    local_addr: SocketAddr,
    task: JoinHandle<()>,
}

/// Builder for [`Engine`].
pub struct EngineBuilder {
    id: u32,
    kind: ServerKind,
    name: String,
    protocol: ServerProtocol,
    maximum: usize,
    bind_interface: bool,
    event_capacity: usize,
    store: Option<Arc<dyn StateStore>>,
    handler: Option<Arc<dyn ProtocolHandler>>,
    capabilities: Capabilities,
}

impl EngineBuilder {
    pub fn new(id: u32, kind: ServerKind) -> Self {
        Self {
            id,
            kind,
            name: "World Server 1".to_string(),
            protocol: ServerProtocol::default(),
            maximum: 299,
            bind_interface: false,
            event_capacity: 1024,
            store: None,
            handler: None,
            capabilities: Capabilities::new(),
        }
    }

    /// Seeds a builder from loaded configuration.
    pub fn from_config(config: &ServerConfig) -> Self {
        Self::new(config.server_id, config.server_type)
            .name(config.name.clone())
            .protocol(config.protocol)
            .max_users(config.max_users)
            .bind_interface(config.bind_address)
            .event_capacity(config.event_capacity)
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn protocol(mut self, protocol: ServerProtocol) -> Self {
        self.protocol = protocol;
        self
    }

    /// Sets the number of users the server should hold.
    ///
    /// The engine's maximum becomes `max_users - 1`; since rejection only
    /// starts once occupancy exceeds the maximum, exactly `max_users` fit.
    pub fn max_users(mut self, max_users: usize) -> Self {
        self.maximum = max_users.saturating_sub(1);
        self
    }

    /// Sets the admission maximum directly. `maximum + 1` clients fit.
    pub fn maximum(mut self, maximum: usize) -> Self {
        self.maximum = maximum;
        self
    }

    /// Binds the listener to the address given to `run` instead of all interfaces.
    pub fn bind_interface(mut self, bind: bool) -> Self {
        self.bind_interface = bind;
        self
    }

    pub fn event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity;
        self
    }

    pub fn store(mut self, store: Arc<dyn StateStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn handler(mut self, handler: Arc<dyn ProtocolHandler>) -> Self {
        self.handler = Some(handler);
        self
    }

    /// Attaches a feature handler reachable through [`Engine::capability`].
    pub fn capability<T>(mut self, name: impl Into<String>, handler: Arc<T>) -> Self
    where
        T: std::any::Any + Send + Sync,
    {
        self.capabilities.insert(name, handler);
        self
    }

    /// Builds the engine and starts its background tasks.
    ///
    /// Must be called from within a tokio runtime.
    pub fn build(self) -> Result<Arc<Engine>, EngineError> {
        let store = self
            .store
            .unwrap_or_else(|| Arc::new(MemoryStore::ready()));
        let handler = self.handler.unwrap_or_else(|| Arc::new(DiscardProtocol));
        let metrics = EngineMetrics::new()?;
        let publisher = PopulationPublisher::spawn(store.clone(), server_key(self.id));

        let engine = Arc::new_cyclic(|weak| Engine {
            id: self.id,
            kind: self.kind,
            name: self.name,
            protocol: self.protocol,
            bind_interface: self.bind_interface,
            registry: Registry::new(self.maximum),
            store,
            publisher,
            events: EventBus::new(self.event_capacity),
            metrics,
            handler,
            capabilities: self.capabilities,
            listening: AtomicBool::new(false),
            listener: Mutex::new(None),
            self_ref: EngineRef(weak.clone()),
        });

        engine.log(LogLevel::Info, "Engine started!");
        engine.log(LogLevel::Info, format_args!("Running: {}", engine.name));
        engine.log(LogLevel::Info, format_args!("Maximum users: {}", engine.maximum()));

        engine.spawn_ready_watch();
        Ok(engine)
    }
}

/// Connection-accepting core of a game server.
///
/// Owns the listener and the registry of admitted clients, publishes the
/// population to the shared store, and drains every client on shutdown.
pub struct Engine {
    id: u32,
    kind: ServerKind,
    name: String,
    protocol: ServerProtocol,
    bind_interface: bool,
    registry: Registry,
    store: Arc<dyn StateStore>,
    publisher: PopulationPublisher,
    events: EventBus,
    metrics: EngineMetrics,
    handler: Arc<dyn ProtocolHandler>,
    capabilities: Capabilities,
    listening: AtomicBool,
    listener: Mutex<Option<ListenerState>>,
    self_ref: EngineRef,
}

impl Engine {
    pub fn builder(id: u32, kind: ServerKind) -> EngineBuilder {
        EngineBuilder::new(id, kind)
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn kind(&self) -> ServerKind {
        self.kind
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn protocol(&self) -> ServerProtocol {
        self.protocol
    }

    /// Admission maximum. One more client than this is admitted.
    pub fn maximum(&self) -> usize {
        self.registry.maximum()
    }

    /// Number of clients currently registered.
    pub fn population(&self) -> usize {
        self.registry.len()
    }

    /// Snapshot of the registered clients, in admission order.
    pub fn clients(&self) -> Vec<Arc<Client>> {
        self.registry.snapshot()
    }

    pub fn reference(&self) -> EngineRef {
        self.self_ref.clone()
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }

    pub fn metrics(&self) -> &EngineMetrics {
        &self.metrics
    }

    pub fn store(&self) -> &Arc<dyn StateStore> {
        &self.store
    }

    pub fn handler(&self) -> Arc<dyn ProtocolHandler> {
        self.handler.clone()
    }

    pub fn capabilities(&self) -> &Capabilities {
        &self.capabilities
    }

    /// Returns the feature handler registered under `name` if it is a `T`.
    pub fn capability<T>(&self, name: &str) -> Option<Arc<T>>
    where
        T: std::any::Any + Send + Sync,
    {
        self.capabilities.get(name)
    }

    pub fn is_listening(&self) -> bool {
        self.listening.load(Ordering::Acquire)
    }

    /// Address the listener is bound to, while it is running.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.listener
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .map(|l| l.local_addr)
    }

    /// Logs `message` tagged with this server's kind and name.
    pub fn log(&self, level: LogLevel, message: impl fmt::Display) {
        let message = format!("[{}:{}] {}", self.kind, self.name, message);
        match level {
            LogLevel::Info => info!(server = %self.name, kind = %self.kind, "{}", message),
            LogLevel::Warn => warn!(server = %self.name, kind = %self.kind, "{}", message),
            LogLevel::Error => error!(server = %self.name, kind = %self.kind, "{}", message),
            LogLevel::Debug => debug!(server = %self.name, kind = %self.kind, "{}", message),
        }
    }

    fn spawn_ready_watch(&self) {
        let store = self.store.clone();
        let engine_ref = self.reference();
        let server_id = self.id;

        tokio::spawn(async move {
            match store.wait_ready().await {
                Ok(()) => {
                    if let Ok(engine) = engine_ref.upgrade() {
                        engine.log(LogLevel::Debug, "Store ready");
                        engine.events.emit(EngineEvent::EngineReady {
                            server_id,
                            engine: engine_ref.clone(),
                        });
                    }
                }
                Err(e) => warn!(server_id, "Store never became ready: {}", e),
            }
        });
    }

    fn record_population(&self, population: usize) {
        self.publisher.publish(population);
        self.metrics.population.set(population as i64);
    }

    /// Admits a new raw connection from `addr`.
    ///
    /// Returns `None` when the engine is full; the caller is expected to
    /// discard the connection.
    pub fn build_protocol(&self, addr: SocketAddr) -> Option<Arc<Client>> {
        match self.registry.admit(
            || Client::new(addr, self.reference()),
            |population| self.record_population(population),
        ) {
            Ok((client, population)) => {
                self.metrics.admitted.inc();
                self.log(
                    LogLevel::Info,
                    format_args!("Built new protocol for user#{} ({})", population - 1, addr),
                );
                Some(client)
            }
            Err(RegistryError::Full { .. }) => {
                self.metrics.rejected.inc();
                self.log(LogLevel::Warn, "Client count overload, disposing it!");
                None
            }
            Err(e @ RegistryError::Duplicate(_)) => {
                self.log(LogLevel::Error, e);
                None
            }
        }
    }

    /// Removes `client` from the registry.
    ///
    /// A `ClientRemoved` event is emitted first, even when the client is not
    /// registered. Returns whether the client was registered.
    pub fn disconnect(&self, client: &Client) -> bool {
        self.events.emit(EngineEvent::ClientRemoved {
            connection_id: client.id(),
            penguin_id: client.penguin_id(),
            client: client.reference(),
        });

        let removed = self
            .registry
            .remove(client.id(), |population| self.record_population(population));

        match removed {
            Some(_) => {
                self.metrics.removed.inc();
                self.log(LogLevel::Debug, format_args!("Removed client {}", client.id()));
                true
            }
            None => false,
        }
    }

    /// Finds the client whose penguin id equals `id`.
    ///
    /// # Errors
    ///
    /// Returns `EngineError::InvalidIdentity` if `id` is not numeric.
    pub fn get_penguin_by_id(&self, id: impl IntoPenguinId) -> Result<Option<ClientRef>, EngineError> {
        let id = id.into_penguin_id()?;

        Ok(self
            .registry
            .snapshot()
            .into_iter()
            .find(|client| client.penguin_id() == Some(id))
            .map(|client| client.reference()))
    }

    /// Starts listening on `port`.
    ///
    /// Unless the engine was built with `bind_interface`, the listener binds
    /// all interfaces and `address` is only used for the logged URL.
    ///
    /// # Errors
    ///
    /// Returns `EngineError::AlreadyListening` if this engine has listened
    /// before. This is not retryable.
    pub async fn run(&self, address: &str, port: u16) -> Result<(), EngineError> {
        if self
            .listening
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            let bound = self
                .local_addr()
                .map(|a| a.to_string())
                .unwrap_or_else(|| format!("{}:{}", address, port));
            return Err(EngineError::AlreadyListening {
                name: self.to_string(),
                address: bound,
            });
        }

        let host = if self.bind_interface { address } else { "0.0.0.0" };
        let listener = match TcpListener::bind((host, port)).await {
            Ok(listener) => listener,
            Err(e) => {
                self.listening.store(false, Ordering::Release);
                return Err(e.into());
            }
        };
        let local_addr = match listener.local_addr() {
            Ok(addr) => addr,
            Err(e) => {
                self.listening.store(false, Ordering::Release);
                return Err(e.into());
            }
        };

        let task = tokio::spawn(handler::accept_connections(listener, self.reference()));
        *self.listener.lock().unwrap_or_else(|e| e.into_inner()) = Some(ListenerState { local_addr, task });

        self.log(
            LogLevel::Info,
            format_args!("{} listening on ws://{}:{}/", self.name, address, local_addr.port()),
        );
        Ok(())
    }

    /// Stops accepting new connections. Registered clients are untouched.
    ///
    /// The engine stays in the listening state and cannot `run` again.
    /// Returns false if no listener was active.
    pub fn stop_listening(&self) -> bool {
        let listener = self.listener.lock().unwrap_or_else(|e| e.into_inner()).take();
        match listener {
            Some(listener) => {
                listener.task.abort();
                self.log(LogLevel::Info, format_args!("Stopped listening on {}", listener.local_addr));
                true
            }
            None => false,
        }
    }

    /// Drains every registered client, then publishes a population of zero.
    ///
    /// Clients are torn down one at a time in admission order; the next one
    /// is only signalled after the previous one reported completion. A client
    /// that never completes stalls the drain. The listener is left open; call
    /// [`stop_listening`](Self::stop_listening) to close it.
    pub async fn connection_lost(&self, reason: impl fmt::Display) {
        self.log(LogLevel::Warn, format_args!("Server exiting! reason: {}", reason));

        for client in self.registry.snapshot() {
            let removed = self.registry.remove(client.id(), |population| {
                self.metrics.population.set(population as i64)
            });
            if removed.is_none() {
                continue;
            }
            self.metrics.removed.inc();

            client.set_can_receive(false);
            client.set_enabled(false);
            client.disconnect();
            client.closed().await;
        }

        self.publisher.publish_and_wait(0).await;
        self.log(LogLevel::Info, "All clients drained");
    }

    /// Waits until every queued population write has been attempted.
    pub async fn flush_population(&self) {
        self.publisher.flush().await;
    }
}

impl fmt::Display for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}<{}:{}#{}>",
            self.name,
            self.protocol,
            self.id,
            self.registry.len()
        )
    }
}

impl fmt::Debug for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Engine")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("name", &self.name)
            .field("maximum", &self.maximum())
            .field("population", &self.population())
            .field("listening", &self.is_listening())
            .finish()
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        if let Some(listener) = self.listener.get_mut().ok().and_then(Option::take) {
            listener.task.abort();
        }
    }
}
