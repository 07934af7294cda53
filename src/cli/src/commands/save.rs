//! `dlc save` command - Store images built since `dlc restore`.

use clap::Args;
use dlc_core::CacheConfig;
use dlc_runtime::{ImageDetector, LayerCache};

use super::Services;
use crate::state::{is_exact_key_match, StateFile};

#[derive(Args, Debug)]
pub struct SaveArgs {
    /// Key template; defaults to the one recorded by `dlc restore`
    #[arg(long)]
    pub key: Option<String>,

    /// Images to save instead of everything built since restore
    #[arg(long = "image")]
    pub images: Vec<String>,

    /// Do nothing
    #[arg(long)]
    pub skip_save: bool,
}

/// Why a save run did or did not store anything.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SaveSummary {
    Skipped,
    NoPrimaryKey,
    ExactKeyMatch,
    NothingToSave,
    /// `LayerCache::store` ran; `true` when a new root was stored
    Stored(bool),
}

pub async fn execute(
    args: SaveArgs,
    config: &CacheConfig,
    services: &Services,
) -> Result<(), Box<dyn std::error::Error>> {
    let summary = run(&args, config, services).await?;
    tracing::debug!(?summary, "Save finished");
    Ok(())
}

/// Decide what to store and store it.
pub async fn run(
    args: &SaveArgs,
    config: &CacheConfig,
    services: &Services,
) -> Result<SaveSummary, Box<dyn std::error::Error>> {
    if args.skip_save {
        tracing::info!("Skipping save");
        return Ok(SaveSummary::Skipped);
    }

    let state_file = StateFile::load(&config.state_file)?;
    let state = state_file.state();

    let Some(primary_key) = args.key.clone().or_else(|| state.primary_key.clone()) else {
        tracing::warn!(path = %state_file.path().display(), "Error retrieving key from state");
        return Ok(SaveSummary::NoPrimaryKey);
    };

    if is_exact_key_match(&primary_key, state.restored_key.as_deref()) {
        tracing::info!(key = %primary_key, "Cache hit occurred on the primary key, not saving cache");
        return Ok(SaveSummary::ExactKeyMatch);
    }

    let images = if args.images.is_empty() {
        let detector = ImageDetector::new(services.tool.clone(), config.filter.clone());
        if detector.images_to_save(&state.known_images()).await?.is_empty() {
            tracing::info!("There is no image to save");
            return Ok(SaveSummary::NothingToSave);
        }
        detector.images_to_save(&state.already_existing_images).await?
    } else {
        args.images.clone()
    };

    tracing::info!(key = %primary_key, images = ?images, "Saving images");
    let mut cache = LayerCache::new(
        images,
        config.directories(),
        services.store.clone(),
        services.tool.clone(),
    )?;
    let stored = cache.store(&primary_key).await;
    let cleaned = cache.cleanup().await;

    let stored = match stored {
        Ok(stored) => stored,
        Err(e) => {
            tracing::error!(error = %e, "Failed to save image");
            return Err(e.into());
        }
    };
    cleaned?;
    Ok(SaveSummary::Stored(stored))
}
