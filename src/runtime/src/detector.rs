//! Detect which local images are new since a given point.

use std::collections::HashSet;
use std::sync::Arc;

use dlc_core::error::Result;

use crate::tool::{ImageRecord, ImageTool};

/// Lists local images through an [`ImageTool`] and diffs image sets.
pub struct ImageDetector {
    tool: Arc<dyn ImageTool>,
    filter: Option<String>,
}

impl ImageDetector {
    pub fn new(tool: Arc<dyn ImageTool>, filter: Option<String>) -> Self {
        Self { tool, filter }
    }

    /// Current non-dangling images.
    pub async fn existing_images(&self) -> Result<Vec<ImageRecord>> {
        let records = self.tool.list_images(self.filter.as_deref()).await?;
        tracing::debug!(count = records.len(), "Listed existing images");
        Ok(records)
    }

    /// Every id and every `repo:tag` in `records`, deduplicated.
    ///
    /// Ids come first, then tags, each in listing order.
    pub fn image_set(records: &[ImageRecord]) -> Vec<String> {
        let mut seen = HashSet::new();
        records
            .iter()
            .map(|r| r.id.as_str())
            .chain(records.iter().map(|r| r.repo_tag.as_str()))
            .filter(|s| !s.is_empty() && seen.insert(*s))
            .map(str::to_string)
            .collect()
    }

    /// Images present now that are not in `already_registered`.
    pub async fn images_to_save(&self, already_registered: &[String]) -> Result<Vec<String>> {
        let known: HashSet<&str> = already_registered.iter().map(String::as_str).collect();
        let current = Self::image_set(&self.existing_images().await?);
        let new: Vec<String> = current
            .into_iter()
            .filter(|image| !known.contains(image.as_str()))
            .collect();
        tracing::debug!(images = ?new, "Images to save");
        Ok(new)
    }
}
