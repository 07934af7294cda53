//! Cache key derivation.
//!
//! Keys are built from a caller-supplied template with one `{hash}`
//! placeholder. The root artifact is keyed by the manifest content hash,
//! each layer by its layer id.

use dlc_core::error::{CacheError, Result};
use sha2::{Digest, Sha256};

use crate::manifest::LayerId;

/// Placeholder token substituted by [`KeyTemplate::expand`].
pub const HASH_PLACEHOLDER: &str = "{hash}";

const ROOT_SUFFIX: &str = "-root";
const LAYER_PREFIX: &str = "layer-";

/// Lowercase hex SHA-256 of the raw manifest bytes.
pub fn content_hash(manifest_bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(manifest_bytes))
}

/// A key template holding exactly one `{hash}` placeholder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyTemplate(String);

impl KeyTemplate {
    /// Validate and wrap a template string.
    pub fn new(template: impl Into<String>) -> Result<Self> {
        let template = template.into();
        match template.matches(HASH_PLACEHOLDER).count() {
            1 => Ok(Self(template)),
            0 => Err(CacheError::InvalidTemplate(format!(
                "'{}' has no {} placeholder",
                template, HASH_PLACEHOLDER
            ))),
            n => Err(CacheError::InvalidTemplate(format!(
                "'{}' has {} {} placeholders, expected one",
                template, n, HASH_PLACEHOLDER
            ))),
        }
    }

    /// Recover the template from a restored root key.
    ///
    /// The manifest hash inside the key goes back to `{hash}` and the
    /// `-root` suffix is dropped.
    pub fn recover(root_key: &str, manifest_hash: &str) -> Result<Self> {
        let base = root_key.strip_suffix(ROOT_SUFFIX).unwrap_or(root_key);
        if !base.contains(manifest_hash) {
            return Err(CacheError::InvalidTemplate(format!(
                "restored key '{}' does not contain manifest hash {}",
                root_key, manifest_hash
            )));
        }
        Self::new(base.replacen(manifest_hash, HASH_PLACEHOLDER, 1))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Substitute the placeholder with `hash`.
    pub fn expand(&self, hash: &str) -> String {
        self.0.replacen(HASH_PLACEHOLDER, hash, 1)
    }

    /// Key of the root artifact: `expand(manifest_hash) + "-root"`.
    pub fn root_key(&self, manifest_hash: &str) -> String {
        format!("{}{}", self.expand(manifest_hash), ROOT_SUFFIX)
    }

    /// Key of a single layer: `"layer-" + expand(layer_id)`.
    pub fn layer_key(&self, layer_id: &LayerId) -> String {
        format!("{}{}", LAYER_PREFIX, self.expand(layer_id.as_str()))
    }
}
