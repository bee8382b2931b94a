//! Connection-accepting engine for a multiplayer game server.
//!
//! The [`Engine`](server::Engine) owns a TCP listener, admits clients up to
//! its capacity, tracks them in admission order, publishes the population
//! to a shared [`StateStore`](store::StateStore), and drains every client on
//! shutdown. Protocol handling and gameplay features plug in through
//! [`ProtocolHandler`](server::ProtocolHandler), the event bus and the
//! capability map.

pub mod config;
pub mod server;
pub mod store;
pub mod utils;

pub use server::{Engine, EngineBuilder, EngineEvent};
pub use utils::EngineError;
