//! Per-unit results of cache store/restore operations.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier handed back by the cache store for a saved entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CacheId(pub String);

impl fmt::Display for CacheId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// What happened to one cache unit (the root artifact or a single layer).
///
/// Outcomes are always observed and logged, even when the overall
/// operation has already decided its result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", content = "detail", rename_all = "snake_case")]
pub enum UnitOutcome {
    /// Saved under a fresh reservation
    Stored(CacheId),
    /// Restored from the given matched key
    Restored(String),
    /// Another writer already holds the key
    AlreadyReserved,
    /// Nothing cached under the key
    NotFound,
    /// The store call failed in a non-fatal way
    Failed(String),
}

impl UnitOutcome {
    /// True for `Stored` and `Restored`.
    pub fn is_success(&self) -> bool {
        matches!(self, UnitOutcome::Stored(_) | UnitOutcome::Restored(_))
    }

    /// Short label used in structured logs.
    pub fn label(&self) -> &'static str {
        match self {
            UnitOutcome::Stored(_) => "stored",
            UnitOutcome::Restored(_) => "restored",
            UnitOutcome::AlreadyReserved => "already_reserved",
            UnitOutcome::NotFound => "not_found",
            UnitOutcome::Failed(_) => "failed",
        }
    }
}

impl fmt::Display for UnitOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UnitOutcome::Stored(id) => write!(f, "stored (id {})", id),
            UnitOutcome::Restored(key) => write!(f, "restored from {}", key),
            UnitOutcome::AlreadyReserved => f.write_str("already reserved"),
            UnitOutcome::NotFound => f.write_str("not found"),
            UnitOutcome::Failed(reason) => write!(f, "failed: {}", reason),
        }
    }
}
