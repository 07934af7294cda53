//! DLC Core - Foundational Types
//!
//! This crate provides the error type, configuration, and per-unit outcome
//! types shared by the layer cache engine and the command line front end.

pub mod config;
pub mod error;
pub mod outcome;

// Re-export commonly used types
pub use config::{CacheConfig, CacheDirectories};
pub use error::{CacheError, Result};
pub use outcome::{CacheId, UnitOutcome};

/// DLC version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
