//! Image export manifest parsing.
//!
//! `docker save` writes a `manifest.json` at the root of the export: a JSON
//! array with one record per image describing its config blob, repository
//! tags, and ordered layer tarballs.

use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};

use dlc_core::config::LAYER_TAR_NAME;
use dlc_core::error::{CacheError, Result};
use serde::{Deserialize, Serialize};

/// File name of the manifest inside an export directory.
pub const MANIFEST_FILE: &str = "manifest.json";

/// One image record of an export manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageManifest {
    /// Path of the image config JSON, relative to the export root
    #[serde(rename = "Config")]
    pub config_path: String,

    /// Repository tags, `null` for untagged images
    #[serde(rename = "RepoTags")]
    pub repo_tags: Option<Vec<String>>,

    /// Layer tarballs, bottom to top, relative to the export root
    #[serde(rename = "Layers")]
    pub layers: Vec<String>,
}

/// Directory component of a layer tarball path (`<sha>/layer.tar` → `<sha>`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LayerId(String);

impl LayerId {
    /// Derive the id from a manifest layer path.
    ///
    /// Layers that sit directly at the export root have an empty id.
    pub fn from_layer_path(layer_path: &str) -> Self {
        let id = match layer_path.rfind('/') {
            Some(idx) => &layer_path[..idx],
            None => "",
        };
        Self(id.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for LayerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Path of the manifest inside an export directory.
pub fn manifest_path(export_dir: &Path) -> PathBuf {
    export_dir.join(MANIFEST_FILE)
}

/// Read the manifest bytes exactly as the export tool wrote them.
pub async fn load_raw_manifest(export_dir: &Path) -> Result<Vec<u8>> {
    let path = manifest_path(export_dir);
    match tokio::fs::read(&path).await {
        Ok(bytes) => Ok(bytes),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            Err(CacheError::ManifestMissing(path))
        }
        Err(e) => Err(CacheError::IoError(e)),
    }
}

/// Parse raw manifest bytes.
pub fn parse_manifest(path: &Path, raw: &[u8]) -> Result<Vec<ImageManifest>> {
    serde_json::from_slice(raw).map_err(|e| CacheError::ManifestMalformed {
        path: path.to_path_buf(),
        message: e.to_string(),
    })
}

/// Load and parse every image record in an export directory.
pub async fn load_manifest(export_dir: &Path) -> Result<Vec<ImageManifest>> {
    let raw = load_raw_manifest(export_dir).await?;
    parse_manifest(&manifest_path(export_dir), &raw)
}

/// Flatten layer paths across manifests, first occurrence wins.
pub fn collect_layer_paths(manifests: &[ImageManifest]) -> Vec<String> {
    let mut seen = HashSet::new();
    manifests
        .iter()
        .flat_map(|m| m.layers.iter())
        .filter(|layer| seen.insert(layer.as_str()))
        .cloned()
        .collect()
}

/// Distinct layer ids across all manifests, in first-seen order.
pub fn collect_layer_ids(manifests: &[ImageManifest]) -> Vec<LayerId> {
    let mut seen = HashSet::new();
    let ids: Vec<LayerId> = collect_layer_paths(manifests)
        .iter()
        .map(|path| LayerId::from_layer_path(path))
        .filter(|id| seen.insert(id.clone()))
        .collect();
    tracing::debug!(count = ids.len(), "Collected layer ids");
    ids
}

/// Whether every layer sits at `<id>/layer.tar` with a distinct id.
///
/// OCI-layout exports (`blobs/sha256/<digest>`) fail this check: their
/// layers cannot be split out and cached per layer.
pub fn is_layer_split_layout(manifests: &[ImageManifest]) -> bool {
    let paths = collect_layer_paths(manifests);
    let suffix = format!("/{}", LAYER_TAR_NAME);
    if let Some(path) = paths.iter().find(|p| !p.ends_with(&suffix)) {
        tracing::warn!(layer = %path, "Layer is not a {} tarball", LAYER_TAR_NAME);
        return false;
    }
    let ids: HashSet<LayerId> = paths.iter().map(|p| LayerId::from_layer_path(p)).collect();
    if ids.len() != paths.len() {
        tracing::warn!(layers = paths.len(), ids = ids.len(), "Layer ids collide");
        return false;
    }
    true
}
