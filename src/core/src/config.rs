use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{CacheError, Result};

/// Default number of in-flight layer operations.
pub const DEFAULT_CONCURRENCY: usize = 4;

/// Directory name of the unpacked export inside the images directory.
const TAR_STORE_DIR: &str = "image";

/// File name every layer tarball carries inside an export.
pub const LAYER_TAR_NAME: &str = "layer.tar";

/// Layer cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Working directory for exported and restored images
    pub images_dir: PathBuf,

    /// Root of the local cache store
    pub cache_dir: PathBuf,

    /// Maximum in-flight layer store/restore operations
    pub concurrency: usize,

    /// Cache layers as independent units (false caches the export as one unit)
    pub parallel: bool,

    /// Extra `docker image ls --filter` value used by the image detector
    pub filter: Option<String>,

    /// Run state shared between `restore` and `save`
    pub state_file: PathBuf,
}

impl Default for CacheConfig {
    fn default() -> Self {
        let images_dir = default_images_dir();
        let state_file = images_dir
            .parent()
            .map(|p| p.join(".adlc-state.json"))
            .unwrap_or_else(|| PathBuf::from(".adlc-state.json"));
        Self {
            images_dir,
            cache_dir: dirs::cache_dir()
                .unwrap_or_else(std::env::temp_dir)
                .join("dlc"),
            concurrency: DEFAULT_CONCURRENCY,
            parallel: true,
            filter: None,
            state_file,
        }
    }
}

impl CacheConfig {
    /// Load configuration from a YAML file.
    ///
    /// Fields missing from the file keep their defaults.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            CacheError::ConfigError(format!("Failed to read {}: {}", path.display(), e))
        })?;
        let config: CacheConfig = serde_yaml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.concurrency == 0 {
            return Err(CacheError::ConfigError(
                "concurrency must be at least 1".to_string(),
            ));
        }
        if self.images_dir.as_os_str().is_empty() {
            return Err(CacheError::ConfigError(
                "images_dir must not be empty".to_string(),
            ));
        }
        Ok(())
    }

    /// Directory layout for one orchestration run.
    pub fn directories(&self) -> CacheDirectories {
        CacheDirectories {
            images_dir: self.images_dir.clone(),
            concurrency: self.concurrency,
            parallel: self.parallel,
        }
    }
}

/// `$GITHUB_WORKSPACE/../.adlc`, falling back to the system temp directory.
fn default_images_dir() -> PathBuf {
    match std::env::var_os("GITHUB_WORKSPACE") {
        Some(workspace) => PathBuf::from(workspace).join("..").join(".adlc"),
        None => std::env::temp_dir().join(".adlc"),
    }
}

/// Directories and limits owned by a single store/restore run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheDirectories {
    /// Parent of the unpacked export and the per-layer tree
    pub images_dir: PathBuf,

    /// Maximum in-flight layer operations (>= 1)
    pub concurrency: usize,

    /// Whether layers are split out and cached independently
    pub parallel: bool,
}

impl CacheDirectories {
    /// Create a layout rooted at `images_dir`.
    pub fn new(images_dir: impl Into<PathBuf>, concurrency: usize) -> Self {
        Self {
            images_dir: images_dir.into(),
            concurrency,
            parallel: true,
        }
    }

    /// The unified export directory (`<images_dir>/image`).
    pub fn unpacked_dir(&self) -> PathBuf {
        self.images_dir.join(TAR_STORE_DIR)
    }

    /// The per-layer tree (`<images_dir>/image-layers`).
    pub fn layers_dir(&self) -> PathBuf {
        self.images_dir.join(format!("{}-layers", TAR_STORE_DIR))
    }

    /// Where a single layer's tarball lives in the per-layer tree.
    pub fn layer_store_path(&self, layer_id: &str) -> PathBuf {
        self.layers_dir().join(layer_id).join(LAYER_TAR_NAME)
    }
}
