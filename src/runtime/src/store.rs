//! Keyed blob cache adapter.
//!
//! [`CacheStore`] is the seam between the engine and whatever cache
//! service holds the blobs. Its errors are typed, so a reservation conflict
//! is told apart from other failures without inspecting messages.
//! [`LocalCacheStore`] is a directory-backed implementation with the same
//! first-writer-wins reservation semantics.

use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dlc_core::error::{CacheError, Result};
use dlc_core::outcome::CacheId;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Longest key the store accepts.
pub const MAX_KEY_LENGTH: usize = 512;

/// Errors returned by a [`CacheStore`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// Another writer already holds this key
    #[error("Unable to reserve cache with key {0}, another job may be creating this cache")]
    AlreadyReserved(String),

    /// The request itself is invalid (bad key, too many keys)
    #[error("Validation error: {0}")]
    Validation(String),

    /// Anything else (transport, I/O, archive)
    #[error("{0}")]
    Other(String),
}

/// A keyed blob cache with at-most-one reservation per key.
#[async_trait]
pub trait CacheStore: Send + Sync {
    /// Save `paths` under `key`.
    async fn save(&self, paths: &[PathBuf], key: &str) -> std::result::Result<CacheId, StoreError>;

    /// Restore `paths` from the first match of `primary_key` then
    /// `restore_keys`. Returns the key that matched.
    async fn restore(
        &self,
        paths: &[PathBuf],
        primary_key: &str,
        restore_keys: &[String],
    ) -> std::result::Result<Option<String>, StoreError>;
}

/// Check a key against the store's rules.
pub fn validate_key(key: &str) -> std::result::Result<(), StoreError> {
    if key.is_empty() {
        return Err(StoreError::Validation("Key must not be empty".to_string()));
    }
    if key.len() > MAX_KEY_LENGTH {
        return Err(StoreError::Validation(format!(
            "Key {} cannot be larger than {} characters",
            key, MAX_KEY_LENGTH
        )));
    }
    if key.contains(',') {
        return Err(StoreError::Validation(format!(
            "Key {} cannot contain commas",
            key
        )));
    }
    Ok(())
}

/// Sidecar metadata written once an entry is complete.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntryMeta {
    /// Cache key
    pub key: String,
    /// Identifier returned to the writer
    pub cache_id: CacheId,
    /// Archive size in bytes
    pub size_bytes: u64,
    /// When the entry was committed
    pub created_at: DateTime<Utc>,
}

/// Directory-backed cache store.
///
/// Entries live under `cache_dir` as `<sha256(key)>.tar` with a
/// `<sha256(key)>.meta.json` sidecar. The archive file is reserved with
/// create-new semantics; the sidecar marks the entry as committed.
#[derive(Debug, Clone)]
pub struct LocalCacheStore {
    cache_dir: PathBuf,
}

impl LocalCacheStore {
    /// Open (and create if needed) a store at `cache_dir`.
    pub fn new(cache_dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(cache_dir).map_err(|e| {
            CacheError::ConfigError(format!(
                "Failed to create cache directory {}: {}",
                cache_dir.display(),
                e
            ))
        })?;
        Ok(Self {
            cache_dir: cache_dir.to_path_buf(),
        })
    }

    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    fn entry_name(key: &str) -> String {
        hex::encode(Sha256::digest(key.as_bytes()))
    }

    fn archive_path(&self, key: &str) -> PathBuf {
        self.cache_dir.join(format!("{}.tar", Self::entry_name(key)))
    }

    fn meta_path(&self, key: &str) -> PathBuf {
        self.cache_dir.join(format!("{}.meta.json", Self::entry_name(key)))
    }

    /// All committed entries.
    pub fn list_entries(&self) -> Result<Vec<EntryMeta>> {
        let mut entries = Vec::new();
        for entry in std::fs::read_dir(&self.cache_dir)? {
            let path = entry?.path();
            let is_meta = path
                .file_name()
                .and_then(|n| n.to_str())
                .map(|n| n.ends_with(".meta.json"))
                .unwrap_or(false);
            if !is_meta {
                continue;
            }
            match std::fs::read_to_string(&path)
                .map_err(CacheError::from)
                .and_then(|s| serde_json::from_str::<EntryMeta>(&s).map_err(CacheError::from))
            {
                Ok(meta) => entries.push(meta),
                Err(e) => tracing::warn!(path = %path.display(), error = %e, "Skipping unreadable cache entry"),
            }
        }
        Ok(entries)
    }

    /// Remove the entry stored under `key`, if any.
    pub fn invalidate(&self, key: &str) -> Result<()> {
        for path in [self.meta_path(key), self.archive_path(key)] {
            match std::fs::remove_file(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    return Err(CacheError::Other(format!(
                        "Failed to remove cache entry {}: {}",
                        path.display(),
                        e
                    )));
                }
            }
        }
        tracing::debug!(key = %key, "Invalidated cache entry");
        Ok(())
    }

    /// Exact match on `key`, if committed.
    fn find_exact(&self, entries: &[EntryMeta], key: &str) -> Option<String> {
        entries.iter().find(|e| e.key == key).map(|e| e.key.clone())
    }

    /// Newest committed entry whose key starts with `prefix`.
    fn find_prefix(&self, entries: &[EntryMeta], prefix: &str) -> Option<String> {
        entries
            .iter()
            .filter(|e| e.key.starts_with(prefix))
            .max_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.key.cmp(&b.key)))
            .map(|e| e.key.clone())
    }

    fn save_blocking(&self, paths: &[PathBuf], key: &str) -> std::result::Result<CacheId, StoreError> {
        for path in paths {
            if !path.exists() {
                return Err(StoreError::Other(format!(
                    "Path {} does not exist",
                    path.display()
                )));
            }
        }

        let archive_path = self.archive_path(key);
        let file = match std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&archive_path)
        {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                return Err(StoreError::AlreadyReserved(key.to_string()));
            }
            Err(e) => {
                return Err(StoreError::Other(format!(
                    "Failed to reserve {}: {}",
                    archive_path.display(),
                    e
                )));
            }
        };

        if let Err(e) = write_archive(file, paths) {
            // Release the reservation so a later writer can retry
            let _ = std::fs::remove_file(&archive_path);
            return Err(StoreError::Other(format!(
                "Failed to archive cache entry {}: {}",
                key, e
            )));
        }

        let size_bytes = std::fs::metadata(&archive_path).map(|m| m.len()).unwrap_or(0);
        let meta = EntryMeta {
            key: key.to_string(),
            cache_id: CacheId(uuid::Uuid::new_v4().to_string()),
            size_bytes,
            created_at: Utc::now(),
        };
        let json = serde_json::to_string_pretty(&meta)
            .map_err(|e| StoreError::Other(e.to_string()))?;
        std::fs::write(self.meta_path(key), json).map_err(|e| {
            StoreError::Other(format!("Failed to write cache metadata for {}: {}", key, e))
        })?;

        tracing::debug!(key = %key, size_bytes, cache_id = %meta.cache_id, "Committed cache entry");
        Ok(meta.cache_id)
    }

    fn restore_blocking(
        &self,
        paths: &[PathBuf],
        primary_key: &str,
        restore_keys: &[String],
    ) -> std::result::Result<Option<String>, StoreError> {
        validate_key(primary_key)?;
        for key in restore_keys {
            validate_key(key)?;
        }

        let entries = self
            .list_entries()
            .map_err(|e| StoreError::Other(e.to_string()))?;

        let matched = self.find_exact(&entries, primary_key).or_else(|| {
            restore_keys.iter().find_map(|key| {
                self.find_exact(&entries, key)
                    .or_else(|| self.find_prefix(&entries, key))
            })
        });

        let Some(key) = matched else {
            return Ok(None);
        };

        let archive_path = self.archive_path(&key);
        unpack_archive(&archive_path, paths).map_err(|e| {
            StoreError::Other(format!("Failed to extract cache entry {}: {}", key, e))
        })?;

        tracing::debug!(key = %key, "Extracted cache entry");
        Ok(Some(key))
    }
}

#[async_trait]
impl CacheStore for LocalCacheStore {
    async fn save(&self, paths: &[PathBuf], key: &str) -> std::result::Result<CacheId, StoreError> {
        validate_key(key)?;
        let store = self.clone();
        let paths = paths.to_vec();
        let key = key.to_string();
        tokio::task::spawn_blocking(move || store.save_blocking(&paths, &key))
            .await
            .map_err(|e| StoreError::Other(format!("Save task failed: {}", e)))?
    }

    async fn restore(
        &self,
        paths: &[PathBuf],
        primary_key: &str,
        restore_keys: &[String],
    ) -> std::result::Result<Option<String>, StoreError> {
        let store = self.clone();
        let paths = paths.to_vec();
        let primary_key = primary_key.to_string();
        let restore_keys = restore_keys.to_vec();
        tokio::task::spawn_blocking(move || {
            store.restore_blocking(&paths, &primary_key, &restore_keys)
        })
        .await
        .map_err(|e| StoreError::Other(format!("Restore task failed: {}", e)))?
    }
}

/// Archive each path under entry prefix `<index>`.
fn write_archive(file: std::fs::File, paths: &[PathBuf]) -> std::io::Result<()> {
    let mut builder = tar::Builder::new(file);
    builder.follow_symlinks(false);
    for (index, path) in paths.iter().enumerate() {
        let name = index.to_string();
        if path.is_dir() {
            builder.append_dir_all(&name, path)?;
        } else {
            builder.append_path_with_name(path, &name)?;
        }
    }
    builder.into_inner()?.sync_all()
}

/// Unpack entry prefix `<index>` of the archive back onto `paths[index]`.
fn unpack_archive(archive_path: &Path, paths: &[PathBuf]) -> std::io::Result<()> {
    let file = std::fs::File::open(archive_path)?;
    let mut archive = tar::Archive::new(file);
    for entry in archive.entries()? {
        let mut entry = entry?;
        let entry_path = entry.path()?.into_owned();
        let mut components = entry_path.components();
        let Some(Component::Normal(first)) = components.next() else {
            continue;
        };
        let Some(index) = first.to_str().and_then(|s| s.parse::<usize>().ok()) else {
            continue;
        };
        let Some(base) = paths.get(index) else {
            tracing::warn!(index, "Cache entry has more paths than requested, skipping");
            continue;
        };
        let rest = components.as_path();
        if rest
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir))
        {
            continue;
        }
        let dest = if rest.as_os_str().is_empty() {
            base.clone()
        } else {
            base.join(rest)
        };

        if entry.header().entry_type().is_dir() {
            std::fs::create_dir_all(&dest)?;
            continue;
        }
        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent)?;
        }
        entry.unpack(&dest)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_validate_key() {
        assert!(validate_key("layer-abc").is_ok());
        assert!(matches!(validate_key(""), Err(StoreError::Validation(_))));
        assert!(matches!(validate_key("a,b"), Err(StoreError::Validation(_))));
        let long = "k".repeat(MAX_KEY_LENGTH + 1);
        assert!(matches!(validate_key(&long), Err(StoreError::Validation(_))));
    }

    #[tokio::test]
    async fn test_save_and_restore_directory() {
        let tmp = TempDir::new().unwrap();
        let store = LocalCacheStore::new(&tmp.path().join("cache")).unwrap();
        let src = tmp.path().join("image");
        fs::create_dir_all(src.join("sub")).unwrap();
        fs::write(src.join("manifest.json"), "[]").unwrap();
        fs::write(src.join("sub/config.json"), "{}").unwrap();

        store.save(&[src.clone()], "key-root").await.unwrap();
        fs::remove_dir_all(&src).unwrap();

        let matched = store.restore(&[src.clone()], "key-root", &[]).await.unwrap();
        assert_eq!(matched.as_deref(), Some("key-root"));
        assert_eq!(fs::read_to_string(src.join("manifest.json")).unwrap(), "[]");
        assert_eq!(fs::read_to_string(src.join("sub/config.json")).unwrap(), "{}");
    }

    #[tokio::test]
    async fn test_save_and_restore_single_file() {
        let tmp = TempDir::new().unwrap();
        let store = LocalCacheStore::new(&tmp.path().join("cache")).unwrap();
        let layer = tmp.path().join("layers/aaa/layer.tar");
        fs::create_dir_all(layer.parent().unwrap()).unwrap();
        fs::write(&layer, b"\x00\x01layer-bytes").unwrap();

        store.save(&[layer.clone()], "layer-aaa").await.unwrap();
        fs::remove_dir_all(tmp.path().join("layers")).unwrap();

        let matched = store.restore(&[layer.clone()], "layer-aaa", &[]).await.unwrap();
        assert!(matched.is_some());
        assert_eq!(fs::read(&layer).unwrap(), b"\x00\x01layer-bytes");
    }

    #[tokio::test]
    async fn test_second_save_is_already_reserved() {
        let tmp = TempDir::new().unwrap();
        let store = LocalCacheStore::new(&tmp.path().join("cache")).unwrap();
        let file = tmp.path().join("f");
        fs::write(&file, "x").unwrap();

        store.save(&[file.clone()], "k").await.unwrap();
        let err = store.save(&[file.clone()], "k").await.unwrap_err();
        assert_eq!(err, StoreError::AlreadyReserved("k".to_string()));
    }

    #[tokio::test]
    async fn test_invalidate_frees_key() {
        let tmp = TempDir::new().unwrap();
        let store = LocalCacheStore::new(&tmp.path().join("cache")).unwrap();
        let file = tmp.path().join("f");
        fs::write(&file, "x").unwrap();

        store.save(&[file.clone()], "k").await.unwrap();
        store.invalidate("k").unwrap();
        assert!(store.list_entries().unwrap().is_empty());
        assert!(store.restore(&[file.clone()], "k", &[]).await.unwrap().is_none());
        store.save(&[file.clone()], "k").await.unwrap();
        store.invalidate("never-stored").unwrap();
    }

    #[tokio::test]
    async fn test_save_rejects_invalid_key() {
        let tmp = TempDir::new().unwrap();
        let store = LocalCacheStore::new(&tmp.path().join("cache")).unwrap();
        let err = store.save(&[tmp.path().to_path_buf()], "a,b").await.unwrap_err();
        assert!(matches!(err, StoreError::Validation(_)));
    }

    #[tokio::test]
    async fn test_save_missing_path_releases_nothing() {
        let tmp = TempDir::new().unwrap();
        let store = LocalCacheStore::new(&tmp.path().join("cache")).unwrap();
        let err = store
            .save(&[tmp.path().join("missing")], "k")
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Other(_)));
        assert!(store.list_entries().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_restore_miss() {
        let tmp = TempDir::new().unwrap();
        let store = LocalCacheStore::new(&tmp.path().join("cache")).unwrap();
        let matched = store
            .restore(&[tmp.path().join("x")], "nothing", &["no".to_string()])
            .await
            .unwrap();
        assert!(matched.is_none());
    }

    #[tokio::test]
    async fn test_restore_falls_back_to_newest_prefix() {
        let tmp = TempDir::new().unwrap();
        let store = LocalCacheStore::new(&tmp.path().join("cache")).unwrap();
        let file = tmp.path().join("f");

        fs::write(&file, "old").unwrap();
        store.save(&[file.clone()], "build-aaa-root").await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        fs::write(&file, "new").unwrap();
        store.save(&[file.clone()], "build-bbb-root").await.unwrap();
        fs::remove_file(&file).unwrap();

        let matched = store
            .restore(&[file.clone()], "build-ccc-root", &["build-".to_string()])
            .await
            .unwrap();
        assert_eq!(matched.as_deref(), Some("build-bbb-root"));
        assert_eq!(fs::read_to_string(&file).unwrap(), "new");
    }
}
