pub mod error;
pub mod logging;

pub use error::EngineError;
pub use logging::init_tracing;
