//! Shared types, config, and error definitions for the Pleinchamp bridge.

pub mod config;
pub mod error;
pub mod types;

pub use config::BridgeConfig;
pub use error::{Error, ErrorKind, FetchError};
pub use types::*;

/// Convenience Result alias.
pub type Result<T> = std::result::Result<T, Error>;
