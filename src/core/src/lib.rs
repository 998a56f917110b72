//! A3S Forge Core - Foundational Types
//!
//! Error types, configuration, build events and tracing setup shared by
//! the A3S Forge build engine.

pub mod config;
pub mod error;
pub mod event;
pub mod log;

// Re-export commonly used types
pub use config::{CacheConfig, ForgeConfig, LogLevel};
pub use error::{ErrorKind, ExecutorError, ForgeError, Result};
pub use event::{BuildEvent, EventEmitter, EventPayload};

/// A3S Forge version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
