// src/server/mod.rs
pub mod capability;
pub mod client;
pub mod engine;
pub mod events;
pub mod handler;
pub mod health;
pub mod registry;

// Re-export public components
pub use capability::Capabilities;
pub use client::{Client, ClientError, ClientRef, IntoPenguinId, PenguinId};
pub use engine::{Engine, EngineBuilder, EngineRef, LogLevel, ServerKind, ServerProtocol};
pub use events::{EngineEvent, EventBus};
pub use handler::{DiscardProtocol, ProtocolHandler, SERVER_FULL_PACKET};
pub use health::EngineMetrics;
pub use registry::{Registry, RegistryError};
