use std::{
    any::Any,
    fmt,
    net::SocketAddr,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Mutex, Weak,
    },
    time::Instant,
};
use tokio::sync::{mpsc, watch};
use tracing::{debug, error};
use uuid::Uuid;

use crate::server::engine::EngineRef;
use crate::utils::EngineError;

/// Numeric identity a penguin is known by once logged in.
pub type PenguinId = u32;

/// Sentinel stored while no penguin has been assigned; outside the `PenguinId` range.
const UNASSIGNED: u64 = u64::MAX;

/// Items queued for the client's writer task.
#[derive(Debug)]
pub(crate) enum Outbound {
    Data(Vec<u8>),
    Close,
}

/// An admitted client connection.
///
/// A `Client` lives in the engine's registry from admission until removal.
/// The protocol layer drives it during normal operation; the engine flips
/// its liveness flags and signals it to disconnect on shutdown.
pub struct Client {
    /// Unique identifier for the connection.
    id: Uuid,
    /// Socket address of the client.
    addr: SocketAddr,
    /// Penguin assigned by the protocol layer, `UNASSIGNED` until login.
    penguin_id: AtomicU64,
    /// Whether inbound packets may still be processed.
    can_receive: AtomicBool,
    /// Whether packet handling is enabled for this client.
    enabled: AtomicBool,
    /// Timestamp of the client's last inbound activity.
    last_activity: Mutex<Instant>,
    /// Channel sender for bytes going to the client.
    sender: mpsc::UnboundedSender<Outbound>,
    /// Receiving half, taken once by the writer task.
    receiver: Mutex<Option<mpsc::UnboundedReceiver<Outbound>>>,
    /// Set when the engine asks the client to disconnect.
    disconnect_tx: watch::Sender<bool>,
    /// Set once the connection has finished tearing down.
    closed_tx: watch::Sender<bool>,
    /// Opaque per-protocol state owned by the surrounding subsystem.
    payload: Mutex<Option<Box<dyn Any + Send>>>,
    /// Non-owning reference to the engine that admitted this client.
    engine: EngineRef,
    /// Weak self-reference handed out to subscribers and lookups.
    self_ref: Weak<Client>,
}

impl Client {
    /// Creates a new handle bound to `engine`.
    pub(crate) fn new(addr: SocketAddr, engine: EngineRef) -> Arc<Self> {
        let (sender, receiver) = mpsc::unbounded_channel();
        let (disconnect_tx, _) = watch::channel(false);
        let (closed_tx, _) = watch::channel(false);

        Arc::new_cyclic(|self_ref| Client {
            id: Uuid::new_v4(),
            addr,
            penguin_id: AtomicU64::new(UNASSIGNED),
            can_receive: AtomicBool::new(true),
            enabled: AtomicBool::new(true),
            last_activity: Mutex::new(Instant::now()),
            sender,
            receiver: Mutex::new(Some(receiver)),
            disconnect_tx,
            closed_tx,
            payload: Mutex::new(None),
            engine,
            self_ref: self_ref.clone(),
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Returns the engine this client was admitted by.
    pub fn engine(&self) -> &EngineRef {
        &self.engine
    }

    /// Returns a non-owning reference usable for external lookup.
    pub fn reference(&self) -> ClientRef {
        ClientRef {
            id: self.id,
            inner: self.self_ref.clone(),
        }
    }

    /// Returns the penguin bound to this connection, if any.
    pub fn penguin_id(&self) -> Option<PenguinId> {
        match self.penguin_id.load(Ordering::Acquire) {
            UNASSIGNED => None,
            id => PenguinId::try_from(id).ok(),
        }
    }

    /// Binds a penguin to this connection once the protocol layer has logged it in.
    pub fn set_penguin_id(&self, id: PenguinId) {
        self.penguin_id.store(u64::from(id), Ordering::Release);
    }

    pub fn can_receive(&self) -> bool {
        self.can_receive.load(Ordering::Acquire)
    }

    pub fn set_can_receive(&self, value: bool) {
        self.can_receive.store(value, Ordering::Release);
    }

    pub fn enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    pub fn set_enabled(&self, value: bool) {
        self.enabled.store(value, Ordering::Release);
    }

    /// True while both liveness flags allow inbound packets.
    pub fn accepts_input(&self) -> bool {
        self.can_receive() && self.enabled()
    }

    /// Records inbound activity.
    pub fn touch(&self) {
        let mut last_activity = self.last_activity.lock().unwrap_or_else(|e| e.into_inner());
        *last_activity = Instant::now();
    }

    pub fn last_activity(&self) -> Instant {
        *self.last_activity.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Queues raw bytes for the client.
    ///
    /// # Errors
    ///
    /// Returns `ClientError::SendFailed` once the writer has gone away.
    pub fn send(&self, data: impl Into<Vec<u8>>) -> Result<(), ClientError> {
        self.sender.send(Outbound::Data(data.into())).map_err(|_| {
            error!(client = %self.id, "Failed to queue message");
            ClientError::SendFailed
        })
    }

    /// Asks the writer to flush what is queued and close the socket.
    pub(crate) fn close(&self) -> Result<(), EngineError> {
        self.sender
            .send(Outbound::Close)
            .map_err(|_| ClientError::SendFailed.into())
    }

    pub(crate) fn take_outbound(&self) -> Option<mpsc::UnboundedReceiver<Outbound>> {
        self.receiver.lock().unwrap_or_else(|e| e.into_inner()).take()
    }

    /// Signals the connection to stop and tear itself down.
    pub fn disconnect(&self) {
        debug!(client = %self.id, "Disconnect requested");
        self.disconnect_tx.send_replace(true);
    }

    pub fn disconnect_requested(&self) -> bool {
        *self.disconnect_tx.borrow()
    }

    /// Resolves once [`disconnect`](Self::disconnect) has been called.
    pub async fn disconnect_signal(&self) {
        let mut rx = self.disconnect_tx.subscribe();
        while !*rx.borrow_and_update() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Fires the teardown-completion signal.
    pub fn mark_closed(&self) {
        self.closed_tx.send_replace(true);
    }

    pub fn is_closed(&self) -> bool {
        *self.closed_tx.borrow()
    }

    /// Resolves once the connection has finished closing.
    pub async fn closed(&self) {
        let mut rx = self.closed_tx.subscribe();
        while !*rx.borrow_and_update() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Stores the protocol layer's per-connection state.
    pub fn set_payload<T: Any + Send>(&self, payload: T) {
        *self.payload.lock().unwrap_or_else(|e| e.into_inner()) = Some(Box::new(payload));
    }

    /// Runs `f` against the payload if one of type `T` is stored.
    pub fn with_payload<T: Any + Send, R>(&self, f: impl FnOnce(&mut T) -> R) -> Option<R> {
        let mut payload = self.payload.lock().unwrap_or_else(|e| e.into_inner());
        payload.as_mut().and_then(|p| p.downcast_mut::<T>()).map(f)
    }
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("id", &self.id)
            .field("addr", &self.addr)
            .field("penguin_id", &self.penguin_id())
            .field("can_receive", &self.can_receive())
            .field("enabled", &self.enabled())
            .finish()
    }
}

/// Weak handle to a [`Client`], handed out by lookups and removal events.
#[derive(Debug, Clone)]
pub struct ClientRef {
    id: Uuid,
    inner: Weak<Client>,
}

impl ClientRef {
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Resolves to the live client, or `None` once it has been dropped.
    pub fn upgrade(&self) -> Option<Arc<Client>> {
        self.inner.upgrade()
    }
}

impl PartialEq for ClientRef {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for ClientRef {}

/// Coerces lookup input into a [`PenguinId`].
pub trait IntoPenguinId {
    fn into_penguin_id(self) -> Result<PenguinId, EngineError>;
}

impl IntoPenguinId for PenguinId {
    fn into_penguin_id(self) -> Result<PenguinId, EngineError> {
        Ok(self)
    }
}

macro_rules! impl_into_penguin_id {
    ($($ty:ty),*) => {
        $(
            impl IntoPenguinId for $ty {
                fn into_penguin_id(self) -> Result<PenguinId, EngineError> {
                    PenguinId::try_from(self)
                        .map_err(|_| EngineError::InvalidIdentity(self.to_string()))
                }
            }
        )*
    };
}

impl_into_penguin_id!(i32, i64, u64, usize);

impl IntoPenguinId for &str {
    fn into_penguin_id(self) -> Result<PenguinId, EngineError> {
        self.trim()
            .parse()
            .map_err(|_| EngineError::InvalidIdentity(self.to_string()))
    }
}

impl IntoPenguinId for String {
    fn into_penguin_id(self) -> Result<PenguinId, EngineError> {
        self.as_str().into_penguin_id()
    }
}

impl IntoPenguinId for &String {
    fn into_penguin_id(self) -> Result<PenguinId, EngineError> {
        self.as_str().into_penguin_id()
    }
}

/// Represents errors that may occur in client operations.
#[derive(thiserror::Error, Debug)]
pub enum ClientError {
    #[error("Failed to send message")]
    SendFailed,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn detached_client() -> Arc<Client> {
        Client::new("127.0.0.1:4000".parse().unwrap(), EngineRef::detached())
    }

    #[test]
    fn identity_coercion() {
        assert_eq!("42".into_penguin_id().unwrap(), 42);
        assert_eq!(" 101 ".into_penguin_id().unwrap(), 101);
        assert_eq!(String::from("7").into_penguin_id().unwrap(), 7);
        assert_eq!(42i64.into_penguin_id().unwrap(), 42);
        assert!(matches!("abc".into_penguin_id(), Err(EngineError::InvalidIdentity(_))));
        assert!(matches!((-1i64).into_penguin_id(), Err(EngineError::InvalidIdentity(_))));
        assert!("".into_penguin_id().is_err());
    }

    #[test]
    fn integer_coercion_covers_common_widths() {
        fn coerce(id: impl IntoPenguinId) -> Result<PenguinId, EngineError> {
            id.into_penguin_id()
        }

        assert_eq!(coerce(42).unwrap(), 42);
        assert_eq!(42i32.into_penguin_id().unwrap(), 42);
        assert_eq!(42u64.into_penguin_id().unwrap(), 42);
        assert_eq!(42usize.into_penguin_id().unwrap(), 42);
        assert!(matches!((-5i32).into_penguin_id(), Err(EngineError::InvalidIdentity(_))));
        assert!(matches!(
            (u64::from(u32::MAX) + 1).into_penguin_id(),
            Err(EngineError::InvalidIdentity(_))
        ));
    }

    #[test]
    fn penguin_id_starts_unassigned() {
        let client = detached_client();
        assert_eq!(client.penguin_id(), None);
        client.set_penguin_id(42);
        assert_eq!(client.penguin_id(), Some(42));
    }

    #[test]
    fn zero_is_a_valid_penguin_id() {
        let client = detached_client();
        client.set_penguin_id(0);
        assert_eq!(client.penguin_id(), Some(0));
        client.set_penguin_id(PenguinId::MAX);
        assert_eq!(client.penguin_id(), Some(PenguinId::MAX));
    }

    #[test]
    fn liveness_flags() {
        let client = detached_client();
        assert!(client.accepts_input());
        client.set_can_receive(false);
        assert!(!client.accepts_input());
        client.set_can_receive(true);
        client.set_enabled(false);
        assert!(!client.accepts_input());
    }

    #[test]
    fn reference_resolves_until_dropped() {
        let client = detached_client();
        let reference = client.reference();
        assert_eq!(reference.id(), client.id());
        assert!(reference.upgrade().is_some());
        drop(client);
        assert!(reference.upgrade().is_none());
    }

    #[test]
    fn payload_round_trip() {
        let client = detached_client();
        assert_eq!(client.with_payload(|n: &mut u32| *n), None);
        client.set_payload(5u32);
        client.with_payload(|n: &mut u32| *n += 1);
        assert_eq!(client.with_payload(|n: &mut u32| *n), Some(6));
        assert_eq!(client.with_payload(|s: &mut String| s.len()), None);
    }

    #[tokio::test]
    async fn teardown_signals() {
        let client = detached_client();
        assert!(!client.disconnect_requested());

        let waiter = {
            let client = client.clone();
            tokio::spawn(async move {
                client.disconnect_signal().await;
                client.mark_closed();
            })
        };

        client.disconnect();
        tokio::time::timeout(Duration::from_secs(1), client.closed())
            .await
            .expect("client should close");
        assert!(client.is_closed());
        waiter.await.unwrap();
    }

    #[test]
    fn send_queues_until_receiver_dropped() {
        let client = detached_client();
        assert!(client.send(b"hello".to_vec()).is_ok());
        let receiver = client.take_outbound();
        assert!(receiver.is_some());
        assert!(client.take_outbound().is_none());
        drop(receiver);
        assert!(matches!(client.send("bye"), Err(ClientError::SendFailed)));
    }
}
