//! Test doubles shared by the layer cache integration tests.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use dlc_core::error::{CacheError, Result};
use dlc_core::outcome::CacheId;
use dlc_runtime::{CacheStore, ImageManifest, ImageRecord, ImageTool, LocalCacheStore, StoreError};
use parking_lot::Mutex;

/// An image as the fake daemon knows it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FakeImage {
    pub id: String,
    pub tag: String,
    pub config: Vec<u8>,
    /// `(layer id, layer.tar bytes)`, bottom to top
    pub layers: Vec<(String, Vec<u8>)>,
}

impl FakeImage {
    pub fn new(id: &str, tag: &str, layers: &[(&str, &str)]) -> Self {
        Self {
            id: id.to_string(),
            tag: tag.to_string(),
            config: format!("{{\"id\":\"{}\"}}", id).into_bytes(),
            layers: layers
                .iter()
                .map(|(layer, data)| (layer.to_string(), data.as_bytes().to_vec()))
                .collect(),
        }
    }
}

/// In-memory image daemon speaking the unpacked `docker save` layout.
#[derive(Default)]
pub struct FakeDocker {
    images: Mutex<Vec<FakeImage>>,
    history: HashMap<String, Vec<String>>,
    exports: Mutex<Vec<Vec<String>>>,
    imports: AtomicUsize,
    fail_export: bool,
    /// Export layers as `blobs/sha256/<layer>` instead of `<layer>/layer.tar`
    blob_layout: bool,
}

impl FakeDocker {
    pub fn with_images(images: Vec<FakeImage>) -> Self {
        Self {
            images: Mutex::new(images),
            ..Default::default()
        }
    }

    /// Daemon whose `docker save` writes the OCI blob layout.
    pub fn with_blob_layout(images: Vec<FakeImage>) -> Self {
        Self {
            images: Mutex::new(images),
            blob_layout: true,
            ..Default::default()
        }
    }

    pub fn failing_export() -> Self {
        Self {
            fail_export: true,
            ..Default::default()
        }
    }

    pub fn set_history(&mut self, image: &str, ids: &[&str]) {
        self.history
            .insert(image.to_string(), ids.iter().map(|s| s.to_string()).collect());
    }

    pub fn images(&self) -> Vec<FakeImage> {
        self.images.lock().clone()
    }

    pub fn add_image(&self, image: FakeImage) {
        self.images.lock().push(image);
    }

    pub fn exports(&self) -> Vec<Vec<String>> {
        self.exports.lock().clone()
    }

    pub fn import_count(&self) -> usize {
        self.imports.load(Ordering::SeqCst)
    }

    fn find(&self, reference: &str) -> Option<FakeImage> {
        self.images
            .lock()
            .iter()
            .find(|i| i.tag == reference || i.id == reference)
            .cloned()
    }
}

#[async_trait]
impl ImageTool for FakeDocker {
    async fn history(&self, image: &str) -> Result<Vec<String>> {
        Ok(self.history.get(image).cloned().unwrap_or_default())
    }

    async fn export(&self, images: &[String], dest_dir: &Path) -> Result<()> {
        self.exports.lock().push(images.to_vec());
        if self.fail_export {
            return Err(CacheError::ExportFailure {
                status: 1,
                message: "no such image".to_string(),
            });
        }

        let mut seen = HashSet::new();
        let mut manifest = Vec::new();
        for image in images.iter().filter_map(|r| self.find(r)) {
            if !seen.insert(image.id.clone()) {
                continue;
            }
            let config_path = format!("{}.json", image.id);
            std::fs::write(dest_dir.join(&config_path), &image.config)?;
            let mut layers = Vec::new();
            for (layer, data) in &image.layers {
                if self.blob_layout {
                    let blobs = dest_dir.join("blobs").join("sha256");
                    std::fs::create_dir_all(&blobs)?;
                    std::fs::write(blobs.join(layer), data)?;
                    layers.push(format!("blobs/sha256/{}", layer));
                    continue;
                }
                let dir = dest_dir.join(layer);
                std::fs::create_dir_all(&dir)?;
                std::fs::write(dir.join("layer.tar"), data)?;
                std::fs::write(dir.join("VERSION"), "1.0")?;
                layers.push(format!("{}/layer.tar", layer));
            }
            manifest.push(ImageManifest {
                config_path,
                repo_tags: Some(vec![image.tag.clone()]),
                layers,
            });
        }
        std::fs::write(dest_dir.join("manifest.json"), serde_json::to_vec(&manifest)?)?;
        Ok(())
    }

    async fn import(&self, src_dir: &Path) -> Result<()> {
        let raw = std::fs::read(src_dir.join("manifest.json"))?;
        let manifest: Vec<ImageManifest> = serde_json::from_slice(&raw)?;
        for entry in manifest {
            let id = entry.config_path.trim_end_matches(".json").to_string();
            let mut layers = Vec::new();
            for layer_path in &entry.layers {
                let data = std::fs::read(src_dir.join(layer_path)).map_err(|e| {
                    CacheError::ImportFailure {
                        status: 1,
                        message: format!("missing {}: {}", layer_path, e),
                    }
                })?;
                let layer = layer_path
                    .trim_end_matches("/layer.tar")
                    .trim_start_matches("blobs/sha256/")
                    .to_string();
                layers.push((layer, data));
            }
            let image = FakeImage {
                id,
                tag: entry.repo_tags.and_then(|t| t.into_iter().next()).unwrap_or_default(),
                config: std::fs::read(src_dir.join(&entry.config_path))?,
                layers,
            };
            let mut images = self.images.lock();
            if !images.contains(&image) {
                images.push(image);
            }
        }
        self.imports.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn list_images(&self, _filter: Option<&str>) -> Result<Vec<ImageRecord>> {
        Ok(self
            .images
            .lock()
            .iter()
            .map(|i| ImageRecord {
                id: i.id.clone(),
                repo_tag: i.tag.clone(),
            })
            .collect())
    }
}

/// Wraps a [`LocalCacheStore`] to count calls, track peak concurrency,
/// slow operations down and simulate misses or store errors.
pub struct InstrumentedStore {
    inner: LocalCacheStore,
    delay: Duration,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
    saves: Mutex<Vec<String>>,
    restores: Mutex<Vec<String>>,
    missing: Mutex<HashSet<String>>,
    /// `(key prefix, error)` returned without delay by save and restore
    failures: Mutex<Vec<(String, StoreError)>>,
}

impl InstrumentedStore {
    pub fn new(cache_dir: &Path, delay: Duration) -> Self {
        Self {
            inner: LocalCacheStore::new(cache_dir).unwrap(),
            delay,
            in_flight: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
            saves: Mutex::new(Vec::new()),
            restores: Mutex::new(Vec::new()),
            missing: Mutex::new(HashSet::new()),
            failures: Mutex::new(Vec::new()),
        }
    }

    pub fn inner(&self) -> &LocalCacheStore {
        &self.inner
    }

    /// Report `key` as absent on restore, without delay.
    pub fn mark_missing(&self, key: &str) {
        self.missing.lock().insert(key.to_string());
    }

    /// Fail every save and restore whose key starts with `prefix`.
    pub fn fail_keys(&self, prefix: &str, error: StoreError) {
        self.failures.lock().push((prefix.to_string(), error));
    }

    fn failure_for(&self, key: &str) -> Option<StoreError> {
        self.failures
            .lock()
            .iter()
            .find(|(prefix, _)| key.starts_with(prefix.as_str()))
            .map(|(_, error)| error.clone())
    }

    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    pub fn reset_peak(&self) {
        self.peak.store(0, Ordering::SeqCst);
    }

    pub fn saves(&self) -> Vec<String> {
        self.saves.lock().clone()
    }

    pub fn restores(&self) -> Vec<String> {
        self.restores.lock().clone()
    }

    fn enter(&self) {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
    }

    fn exit(&self) {
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl CacheStore for InstrumentedStore {
    async fn save(&self, paths: &[PathBuf], key: &str) -> std::result::Result<CacheId, StoreError> {
        self.saves.lock().push(key.to_string());
        if let Some(error) = self.failure_for(key) {
            return Err(error);
        }
        self.enter();
        tokio::time::sleep(self.delay).await;
        let result = self.inner.save(paths, key).await;
        self.exit();
        result
    }

    async fn restore(
        &self,
        paths: &[PathBuf],
        primary_key: &str,
        restore_keys: &[String],
    ) -> std::result::Result<Option<String>, StoreError> {
        self.restores.lock().push(primary_key.to_string());
        if self.missing.lock().contains(primary_key) {
            return Ok(None);
        }
        if let Some(error) = self.failure_for(primary_key) {
            return Err(error);
        }
        self.enter();
        tokio::time::sleep(self.delay).await;
        let result = self.inner.restore(paths, primary_key, restore_keys).await;
        self.exit();
        result
    }
}

/// Three images sharing a base layer.
pub fn sample_images() -> Vec<FakeImage> {
    vec![
        FakeImage::new("sha256-app", "app:latest", &[("base", "BASE"), ("app1", "APP-1")]),
        FakeImage::new("sha256-worker", "worker:latest", &[("base", "BASE"), ("work1", "WORK-1")]),
        FakeImage::new("sha256-db", "db:15", &[("dbbase", "DB-BASE"), ("db1", "DB-1"), ("db2", "DB-2")]),
    ]
}
