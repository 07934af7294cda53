use std::path::PathBuf;

use thiserror::Error;

/// Layer cache error types
///
/// Every variant here is fatal for the enclosing `store`/`restore` call.
/// Benign per-unit conditions (reservation conflicts, layer misses) are
/// reported through [`crate::outcome::UnitOutcome`] instead.
#[derive(Error, Debug)]
pub enum CacheError {
    /// The image export tool exited unsuccessfully
    #[error("Image export failed (exit status {status}): {message}")]
    ExportFailure { status: i32, message: String },

    /// The image import tool exited unsuccessfully
    #[error("Image import failed (exit status {status}): {message}")]
    ImportFailure { status: i32, message: String },

    /// No manifest file in the export directory
    #[error("Manifest not found: {}", .0.display())]
    ManifestMissing(PathBuf),

    /// Manifest file exists but is not a valid manifest array
    #[error("Malformed manifest {}: {message}", .path.display())]
    ManifestMalformed { path: PathBuf, message: String },

    /// A layer tar could not be moved between directory trees
    #[error("Failed to move {} to {}: {source}", .from.display(), .to.display())]
    MoveFailure {
        from: PathBuf,
        to: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Key template is missing its `{hash}` placeholder (or has several)
    #[error("Invalid key template: {0}")]
    InvalidTemplate(String),

    /// Cache service rejected the request (e.g. invalid key characters)
    #[error("Cache validation error: {0}")]
    CacheValidation(String),

    /// External command could not be run
    #[error("Command error: {command} - {message}")]
    CommandError { command: String, message: String },

    /// I/O error
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl From<serde_json::Error> for CacheError {
    fn from(err: serde_json::Error) -> Self {
        CacheError::SerializationError(err.to_string())
    }
}

impl From<serde_yaml::Error> for CacheError {
    fn from(err: serde_yaml::Error) -> Self {
        CacheError::SerializationError(err.to_string())
    }
}

/// Result type alias for layer cache operations
pub type Result<T> = std::result::Result<T, CacheError>;
