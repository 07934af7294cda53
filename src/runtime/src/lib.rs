//! DLC Runtime - Layer cache engine.
//!
//! Splits an exported image into a root artifact and independently
//! cached layers, derives content-addressed keys from the export manifest,
//! and drives bounded-concurrency store/restore against a keyed cache.

pub mod detector;
pub mod engine;
pub mod key;
pub mod layers;
pub mod manifest;
pub mod pool;
pub mod store;
pub mod tool;

// Re-export common types
pub use detector::ImageDetector;
pub use engine::{LayerCache, LayerObservation, Operation, RestorePhase, StorePhase};
pub use key::{content_hash, KeyTemplate};
pub use manifest::{ImageManifest, LayerId};
pub use pool::{PoolRun, TaskReport, WorkerPool};
pub use store::{CacheStore, LocalCacheStore, StoreError};
pub use tool::{DockerCli, ImageRecord, ImageTool};

/// DLC Runtime version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
