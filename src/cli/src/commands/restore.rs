//! `dlc restore` command - Restore cached images before a build.
//!
//! Records which images already exist so `dlc save` only stores what the
//! job built, then restores the layer cache and reports whether the
//! primary key hit.

use clap::Args;
use dlc_core::CacheConfig;
use dlc_runtime::{ImageDetector, LayerCache};

use super::Services;
use crate::output::set_output;
use crate::state::{RunState, StateFile};

#[derive(Args, Debug)]
pub struct RestoreArgs {
    /// Key template containing `{hash}`
    #[arg(long)]
    pub key: String,

    /// Fallback key prefixes, tried in order
    #[arg(long = "restore-key")]
    pub restore_keys: Vec<String>,
}

/// Result of a restore run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestoreSummary {
    pub restored_key: Option<String>,
    pub cache_hit: bool,
}

pub async fn execute(
    args: RestoreArgs,
    config: &CacheConfig,
    services: &Services,
) -> Result<(), Box<dyn std::error::Error>> {
    let summary = run(&args, config, services).await?;
    set_output("cache-hit", &summary.cache_hit.to_string())?;
    set_output("restored-key", summary.restored_key.as_deref().unwrap_or(""))?;
    Ok(())
}

/// Restore the cache and persist the run state.
///
/// On failure the state still records the primary key with no restored
/// key or images, so a later `save` stores everything.
pub async fn run(
    args: &RestoreArgs,
    config: &CacheConfig,
    services: &Services,
) -> Result<RestoreSummary, Box<dyn std::error::Error>> {
    let mut state_file = StateFile::load(&config.state_file)?;
    let detector = ImageDetector::new(services.tool.clone(), config.filter.clone());

    let already_existing = ImageDetector::image_set(&detector.existing_images().await?);
    let mut state = RunState {
        primary_key: Some(args.key.clone()),
        already_existing_images: already_existing.clone(),
        ..Default::default()
    };
    state_file.update(state.clone())?;

    let mut cache = LayerCache::new(
        Vec::new(),
        config.directories(),
        services.store.clone(),
        services.tool.clone(),
    )?;
    let restored = cache.restore(&args.key, &args.restore_keys).await;
    let cleaned = cache.cleanup().await;

    let restored_key = match restored {
        Ok(key) => key,
        Err(e) => {
            tracing::error!(error = %e, "Failed to restore image");
            return Err(e.into());
        }
    };
    cleaned?;

    state.restored_images = detector.images_to_save(&already_existing).await?;
    state.restored_key = restored_key.clone();
    let cache_hit = state.is_exact_key_match();
    state_file.update(state)?;

    match &restored_key {
        Some(key) => tracing::info!(key = %key, cache_hit, "Cache restored"),
        None => tracing::info!(key = %args.key, "Cache not found"),
    }
    Ok(RestoreSummary {
        restored_key,
        cache_hit,
    })
}
