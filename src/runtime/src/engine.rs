//! Layer cache orchestrator.
//!
//! `store`: export → split layers → store root (gate) → store layers
//! (bounded, best-effort).
//!
//! `restore`: restore root (gate) → restore layers (bounded,
//! all-or-nothing) → join → import.
//!
//! The root artifact is the export directory with layer tarballs moved
//! out, so it only holds configs and `manifest.json`. Each layer is cached
//! on its own so images sharing a base share cache entries.
//!
//! Exports whose layers are not `<id>/layer.tar` (OCI blob layout) are
//! cached as a single unit: the root then carries the blobs itself.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;

use dlc_core::config::CacheDirectories;
use dlc_core::error::{CacheError, Result};
use dlc_core::outcome::{CacheId, UnitOutcome};
use futures::future::try_join_all;
use parking_lot::Mutex;
use tokio::task::JoinHandle;

use crate::key::{content_hash, KeyTemplate};
use crate::layers;
use crate::manifest::{
    collect_layer_ids, is_layer_split_layout, load_manifest, load_raw_manifest, LayerId,
};
use crate::pool::{PoolRun, TaskReport, WorkerPool};
use crate::store::{CacheStore, StoreError};
use crate::tool::ImageTool;

/// Report of one pooled layer operation. `Err` holds a fatal error.
pub type LayerReport = TaskReport<LayerId, Result<UnitOutcome>>;

/// Progress of a `store` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorePhase {
    Init,
    Exported,
    Split,
    RootStored,
    RootConflict,
    RootFailed,
    LayersDispatched,
    Done,
    PartialFailed,
}

/// Progress of a `restore` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestorePhase {
    Init,
    RootRestored,
    RootMiss,
    LayersRestored,
    LayersMiss,
    Joined,
    Imported,
}

/// Which side of the cache a layer operation ran on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Store,
    Restore,
}

/// A layer outcome as seen by the orchestrator or a detached observer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LayerObservation {
    pub operation: Operation,
    pub layer: LayerId,
    /// Fatal errors are kept as their message
    pub outcome: std::result::Result<UnitOutcome, String>,
}

/// Logs each layer report and keeps a record of it.
#[derive(Debug, Clone, Default)]
struct OutcomeLog(Arc<Mutex<Vec<LayerObservation>>>);

impl OutcomeLog {
    fn record(&self, operation: Operation, report: &LayerReport) {
        let layer = &report.item;
        let label = report.output.as_ref().map(UnitOutcome::label).unwrap_or("fatal");
        match &report.output {
            Ok(UnitOutcome::Stored(id)) => {
                tracing::info!(?operation, layer = %layer, outcome = label, cache_id = %id, "Layer cache done");
            }
            Ok(UnitOutcome::Restored(key)) => {
                tracing::info!(?operation, layer = %layer, outcome = label, key = %key, "Layer cache done");
            }
            Ok(UnitOutcome::AlreadyReserved) => {
                tracing::info!(?operation, layer = %layer, outcome = label, "Layer cache key already reserved");
            }
            Ok(UnitOutcome::NotFound) => {
                tracing::info!(?operation, layer = %layer, outcome = label, "Layer cache not found");
            }
            Ok(UnitOutcome::Failed(reason)) => {
                tracing::warn!(?operation, layer = %layer, outcome = label, reason = %reason, "Layer cache operation failed");
            }
            Err(e) => {
                tracing::error!(?operation, layer = %layer, outcome = label, error = %e, "Layer cache operation aborted");
            }
        }
        self.0.lock().push(LayerObservation {
            operation,
            layer: layer.clone(),
            outcome: report.output.as_ref().map(Clone::clone).map_err(|e| e.to_string()),
        });
    }

    fn snapshot(&self) -> Vec<LayerObservation> {
        self.0.lock().clone()
    }
}

/// Map a store `save` result onto a unit outcome; validation errors are fatal.
pub fn classify_save(result: std::result::Result<CacheId, StoreError>) -> Result<UnitOutcome> {
    match result {
        Ok(id) => Ok(UnitOutcome::Stored(id)),
        Err(StoreError::AlreadyReserved(_)) => Ok(UnitOutcome::AlreadyReserved),
        Err(StoreError::Validation(message)) => Err(CacheError::CacheValidation(message)),
        Err(StoreError::Other(message)) => Ok(UnitOutcome::Failed(message)),
    }
}

/// Map a store `restore` result onto a unit outcome; validation errors are fatal.
pub fn classify_restore(result: std::result::Result<Option<String>, StoreError>) -> Result<UnitOutcome> {
    match result {
        Ok(Some(key)) => Ok(UnitOutcome::Restored(key)),
        Ok(None) => Ok(UnitOutcome::NotFound),
        Err(StoreError::Validation(message)) => Err(CacheError::CacheValidation(message)),
        Err(e @ StoreError::AlreadyReserved(_)) | Err(e @ StoreError::Other(_)) => {
            Ok(UnitOutcome::Failed(e.to_string()))
        }
    }
}

/// Incremental image cache split into a root artifact and per-layer units.
pub struct LayerCache {
    /// Images requested for `store`
    images: Vec<String>,
    dirs: CacheDirectories,
    pool: WorkerPool,
    store: Arc<dyn CacheStore>,
    tool: Arc<dyn ImageTool>,
    /// Key the root artifact was restored from
    restored_root_key: Option<String>,
    store_phase: StorePhase,
    restore_phase: RestorePhase,
    outcomes: OutcomeLog,
    /// Observers left draining layer tasks after an early decision
    observers: Vec<JoinHandle<Vec<LayerReport>>>,
}

impl LayerCache {
    /// Create an orchestrator for one store or restore run.
    pub fn new(
        images: Vec<String>,
        dirs: CacheDirectories,
        store: Arc<dyn CacheStore>,
        tool: Arc<dyn ImageTool>,
    ) -> Result<Self> {
        let pool = WorkerPool::new(dirs.concurrency)?;
        Ok(Self {
            images,
            dirs,
            pool,
            store,
            tool,
            restored_root_key: None,
            store_phase: StorePhase::Init,
            restore_phase: RestorePhase::Init,
            outcomes: OutcomeLog::default(),
            observers: Vec::new(),
        })
    }

    pub fn directories(&self) -> &CacheDirectories {
        &self.dirs
    }

    pub fn store_phase(&self) -> StorePhase {
        self.store_phase
    }

    pub fn restore_phase(&self) -> RestorePhase {
        self.restore_phase
    }

    pub fn restored_root_key(&self) -> Option<&str> {
        self.restored_root_key.as_deref()
    }

    /// Every layer outcome observed so far, including late ones recorded
    /// by detached observers.
    pub fn observations(&self) -> Vec<LayerObservation> {
        self.outcomes.snapshot()
    }

    fn enter_store(&mut self, phase: StorePhase) {
        tracing::debug!(from = ?self.store_phase, to = ?phase, "Store phase");
        self.store_phase = phase;
    }

    fn enter_restore(&mut self, phase: RestorePhase) {
        tracing::debug!(from = ?self.restore_phase, to = ?phase, "Restore phase");
        self.restore_phase = phase;
    }

    // --- store ---

    /// Export the requested images and cache them under `key_template`.
    ///
    /// Returns `false` when the root key is already taken (this exact
    /// content is cached) or the root store failed; layers are not
    /// attempted in that case.
    pub async fn store(&mut self, key_template: &str) -> Result<bool> {
        let template = KeyTemplate::new(key_template)?;
        self.enter_store(StorePhase::Init);

        let arguments = self.export_arguments().await?;
        if arguments.is_empty() {
            tracing::info!("No images to store");
            return Ok(false);
        }
        let unpacked = self.dirs.unpacked_dir();
        tokio::fs::create_dir_all(&unpacked).await?;
        self.tool.export(&arguments, &unpacked).await?;
        self.enter_store(StorePhase::Exported);

        let per_layer = self.caches_per_layer().await?;
        if per_layer {
            layers::split(&unpacked, &self.dirs.layers_dir()).await?;
            self.enter_store(StorePhase::Split);
        }

        match self.store_root(&template).await? {
            UnitOutcome::Stored(_) => {}
            UnitOutcome::AlreadyReserved => {
                self.enter_store(StorePhase::RootConflict);
                tracing::info!("Cache key already exists, aborting");
                return Ok(false);
            }
            other => {
                self.enter_store(StorePhase::RootFailed);
                tracing::warn!(outcome = %other, "Root cache could not be stored, aborting");
                return Ok(false);
            }
        }
        self.enter_store(StorePhase::RootStored);

        if per_layer {
            let clean = self.store_layers(&template).await?;
            self.enter_store(if clean {
                StorePhase::Done
            } else {
                StorePhase::PartialFailed
            });
        } else {
            self.enter_store(StorePhase::Done);
        }
        Ok(true)
    }

    /// Requested images plus every intermediate id in their history,
    /// deduplicated in first-seen order.
    pub async fn export_arguments(&self) -> Result<Vec<String>> {
        let mut seen = HashSet::new();
        let requested: Vec<&String> = self
            .images
            .iter()
            .filter(|image| seen.insert(image.as_str()))
            .collect();

        let histories = try_join_all(requested.iter().map(|image| self.tool.history(image))).await?;

        let mut seen = HashSet::new();
        let arguments: Vec<String> = requested
            .iter()
            .zip(histories)
            .flat_map(|(image, history)| std::iter::once((*image).clone()).chain(history))
            .filter(|id| seen.insert(id.clone()))
            .collect();
        tracing::debug!(arguments = ?arguments, "Export arguments");
        Ok(arguments)
    }

    /// Whether this export can be split into per-layer cache units.
    ///
    /// Reads the manifest in the unpacked directory; single-unit mode and
    /// non-splittable layouts both answer `false`.
    async fn caches_per_layer(&self) -> Result<bool> {
        if !self.dirs.parallel {
            return Ok(false);
        }
        let manifests = load_manifest(&self.dirs.unpacked_dir()).await?;
        if is_layer_split_layout(&manifests) {
            return Ok(true);
        }
        tracing::warn!("Image layout cannot be cached per layer, using a single cache unit");
        Ok(false)
    }

    /// Store the root artifact and report how the store answered.
    async fn store_root(&self, template: &KeyTemplate) -> Result<UnitOutcome> {
        let unpacked = self.dirs.unpacked_dir();
        let manifest_hash = content_hash(&load_raw_manifest(&unpacked).await?);
        let root_key = template.root_key(&manifest_hash);

        tracing::info!(key = %root_key, dir = %unpacked.display(), "Start storing root cache");
        let outcome = classify_save(self.store.save(&[unpacked], &root_key).await)?;
        match &outcome {
            UnitOutcome::Stored(id) => {
                tracing::info!(key = %root_key, cache_id = %id, "Stored root cache");
            }
            UnitOutcome::AlreadyReserved => {
                tracing::info!(key = %root_key, "Root cache key already reserved");
            }
            other => {
                tracing::warn!(key = %root_key, outcome = other.label(), reason = %other, "Root cache not stored");
            }
        }
        Ok(outcome)
    }

    /// Store every layer through the pool, waiting for all of them.
    ///
    /// Returns whether every layer was stored or already present. A fatal
    /// error is returned only after all tasks have reported.
    async fn store_layers(&mut self, template: &KeyTemplate) -> Result<bool> {
        let ids = collect_layer_ids(&load_manifest(&self.dirs.unpacked_dir()).await?);
        let store = Arc::clone(&self.store);
        let dirs = self.dirs.clone();
        let template = template.clone();

        let run = self.pool.spawn(ids, move |layer_id: LayerId| {
            let store = Arc::clone(&store);
            let path = dirs.layer_store_path(layer_id.as_str());
            let key = template.layer_key(&layer_id);
            async move {
                tracing::info!(layer = %layer_id, key = %key, "Start storing layer cache");
                classify_save(store.save(&[path], &key).await)
            }
        });
        self.enter_store(StorePhase::LayersDispatched);

        let mut clean = true;
        let mut fatal = None;
        for report in run.collect().await {
            self.outcomes.record(Operation::Store, &report);
            match report.output {
                Ok(UnitOutcome::Stored(_)) | Ok(UnitOutcome::AlreadyReserved) => {}
                Ok(_) => clean = false,
                Err(e) => {
                    clean = false;
                    fatal.get_or_insert(e);
                }
            }
        }

        match fatal {
            Some(e) => Err(e),
            None => Ok(clean),
        }
    }

    // --- restore ---

    /// Restore the root artifact and all layers, then import the image.
    ///
    /// Returns the matched root key, or `None` when the root or any layer
    /// is missing. Fatal errors propagate.
    pub async fn restore(
        &mut self,
        primary_key: &str,
        restore_keys: &[String],
    ) -> Result<Option<String>> {
        self.enter_restore(RestorePhase::Init);

        let Some(root_key) = self.restore_root(primary_key, restore_keys).await? else {
            self.enter_restore(RestorePhase::RootMiss);
            tracing::info!("Root cache could not be found, aborting");
            return Ok(None);
        };
        self.restored_root_key = Some(root_key.clone());
        self.enter_restore(RestorePhase::RootRestored);

        if self.caches_per_layer().await? {
            if !self.restore_layers(&root_key).await? {
                self.enter_restore(RestorePhase::LayersMiss);
                tracing::info!("Some layer cache could not be found, aborting");
                return Ok(None);
            }
            self.enter_restore(RestorePhase::LayersRestored);

            layers::join(&self.dirs.layers_dir(), &self.dirs.unpacked_dir()).await?;
            self.enter_restore(RestorePhase::Joined);
        }

        self.tool.import(&self.dirs.unpacked_dir()).await?;
        self.enter_restore(RestorePhase::Imported);
        Ok(Some(root_key))
    }

    async fn restore_root(
        &self,
        primary_key: &str,
        restore_keys: &[String],
    ) -> Result<Option<String>> {
        let unpacked = self.dirs.unpacked_dir();
        tracing::debug!(
            primary_key = %primary_key,
            restore_keys = ?restore_keys,
            dir = %unpacked.display(),
            "Trying to restore root cache"
        );
        tokio::fs::create_dir_all(&unpacked).await?;

        let outcome = classify_restore(
            self.store
                .restore(&[unpacked], primary_key, restore_keys)
                .await,
        )?;
        match outcome {
            UnitOutcome::Restored(key) => {
                tracing::info!(key = %key, "Restored root cache");
                Ok(Some(key))
            }
            UnitOutcome::Failed(reason) => {
                tracing::warn!(reason = %reason, "Root cache restore failed");
                Ok(None)
            }
            _ => Ok(None),
        }
    }

    /// Restore every layer; `false` as soon as any layer misses.
    ///
    /// Tasks still running when the decision is made are never cancelled:
    /// an observer is attached that logs and records each of them.
    async fn restore_layers(&mut self, root_key: &str) -> Result<bool> {
        let unpacked = self.dirs.unpacked_dir();
        let manifest_hash = content_hash(&load_raw_manifest(&unpacked).await?);
        let template = KeyTemplate::recover(root_key, &manifest_hash)?;
        let ids = collect_layer_ids(&load_manifest(&unpacked).await?);

        let store = Arc::clone(&self.store);
        let dirs = self.dirs.clone();
        let mut run = self.pool.spawn(ids, move |layer_id: LayerId| {
            let store = Arc::clone(&store);
            let path = dirs.layer_store_path(layer_id.as_str());
            let key = template.layer_key(&layer_id);
            async move {
                tracing::debug!(layer = %layer_id, key = %key, path = %path.display(), "Restoring layer cache");
                if let Some(parent) = path.parent() {
                    tokio::fs::create_dir_all(parent).await?;
                }
                classify_restore(store.restore(&[path], &key, &[]).await)
            }
        });

        while let Some(report) = run.next().await {
            self.outcomes.record(Operation::Restore, &report);
            match report.output {
                Ok(outcome) if outcome.is_success() => {}
                Ok(_) => {
                    self.observe_rest(run, Operation::Restore);
                    return Ok(false);
                }
                Err(e) => {
                    self.observe_rest(run, Operation::Restore);
                    return Err(e);
                }
            }
        }
        Ok(true)
    }

    /// Detach an observer for the tasks of `run` that have not reported.
    fn observe_rest(&mut self, run: PoolRun<LayerId, Result<UnitOutcome>>, operation: Operation) {
        if run.outstanding() == 0 {
            return;
        }
        tracing::debug!(outstanding = run.outstanding(), "Observing remaining layer tasks");
        let outcomes = self.outcomes.clone();
        let handle = run.observe_rest(move |report| outcomes.record(operation, report));
        self.observers.push(handle);
    }

    /// Wait for detached observers and return the reports they saw.
    pub async fn drain_observers(&mut self) -> Vec<LayerReport> {
        let mut late = Vec::new();
        for handle in self.observers.drain(..) {
            match handle.await {
                Ok(reports) => late.extend(reports),
                Err(e) => tracing::error!(error = %e, "Layer observer failed"),
            }
        }
        late
    }

    /// Wait for outstanding layer tasks, then remove the working directories.
    pub async fn cleanup(&mut self) -> Result<()> {
        self.drain_observers().await;
        let images_dir: PathBuf = self.dirs.images_dir.clone();
        match tokio::fs::remove_dir_all(&images_dir).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
