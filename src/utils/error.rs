use thiserror::Error;

/// Represents the errors surfaced by the connection engine.
#[derive(Error, Debug)]
pub enum EngineError {
    /// The engine already owns a listener.
    ///
    /// An engine binds exactly one address/port for its lifetime; a second
    /// `run` is a startup-configuration bug and must not be retried.
    #[error("{name} already listening on {address}. An engine can only listen to 1 TCP/IP/PORT")]
    AlreadyListening { name: String, address: String },

    /// A penguin lookup was given something that is not a numeric identity.
    #[error("Invalid penguin identity: {0:?}")]
    InvalidIdentity(String),

    /// A weak engine reference was resolved after the engine was dropped.
    #[error("Engine has been torn down")]
    EngineGone,

    /// Represents a transport-level failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Represents an error in the server configuration.
    ///
    /// This occurs when an invalid or inconsistent configuration is detected.
    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    /// The external state store rejected or could not perform an operation.
    #[error("Store error: {0}")]
    Store(#[from] crate::store::StoreError),

    /// Represents an error related to client operations.
    #[error("Client error: {0}")]
    Client(#[from] crate::server::client::ClientError),

    /// Raised by protocol handlers attached to an admitted client.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Metrics could not be registered, encoded or served.
    #[error("Metrics error: {0}")]
    Metrics(String),
}

impl From<prometheus::Error> for EngineError {
    fn from(err: prometheus::Error) -> Self {
        EngineError::Metrics(err.to_string())
    }
}
