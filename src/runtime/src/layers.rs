//! Moving layer tarballs between the unified export and the per-layer tree.
//!
//! `split` and `join` are the same primitive in opposite directions: every
//! file named `layer.tar` under the source is moved to the same relative
//! path under the destination.

use std::path::{Path, PathBuf};

use dlc_core::config::LAYER_TAR_NAME;
use dlc_core::error::{CacheError, Result};
use futures::future::try_join_all;

/// Move layer tarballs out of the unified export into the per-layer tree.
pub async fn split(export_dir: &Path, layers_dir: &Path) -> Result<usize> {
    move_layer_tars(export_dir, layers_dir).await
}

/// Move layer tarballs from the per-layer tree back into the export.
pub async fn join(layers_dir: &Path, export_dir: &Path) -> Result<usize> {
    move_layer_tars(layers_dir, export_dir).await
}

/// Move every `layer.tar` under `from_dir` to the same relative path under
/// `to_dir`. Moves run concurrently; returns how many were moved.
pub async fn move_layer_tars(from_dir: &Path, to_dir: &Path) -> Result<usize> {
    let root = from_dir.to_path_buf();
    let layer_tars = tokio::task::spawn_blocking(move || find_layer_tars(&root))
        .await
        .map_err(|e| CacheError::Other(format!("Layer scan task failed: {}", e)))??;

    let moves = layer_tars.iter().map(|relative| {
        let from = from_dir.join(relative);
        let to = to_dir.join(relative);
        move_layer(from, to)
    });
    try_join_all(moves).await?;

    tracing::debug!(
        from = %from_dir.display(),
        to = %to_dir.display(),
        count = layer_tars.len(),
        "Moved layer tars"
    );
    Ok(layer_tars.len())
}

async fn move_layer(from: PathBuf, to: PathBuf) -> Result<()> {
    tracing::trace!(from = %from.display(), to = %to.display(), "Moving layer tar");
    if let Some(parent) = to.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|source| CacheError::MoveFailure {
                from: from.clone(),
                to: to.clone(),
                source,
            })?;
    }
    tokio::fs::rename(&from, &to)
        .await
        .map_err(|source| CacheError::MoveFailure { from, to, source })
}

/// Relative paths of all files named `layer.tar` below `root`.
///
/// A missing root yields an empty list.
pub fn find_layer_tars(root: &Path) -> Result<Vec<PathBuf>> {
    let mut found = Vec::new();
    if root.is_dir() {
        walk(root, root, &mut found)?;
    }
    found.sort();
    Ok(found)
}

fn walk(root: &Path, dir: &Path, found: &mut Vec<PathBuf>) -> Result<()> {
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            walk(root, &path, found)?;
        } else if entry.file_name() == LAYER_TAR_NAME {
            if let Ok(relative) = path.strip_prefix(root) {
                found.push(relative.to_path_buf());
            }
        }
    }
    Ok(())
}
