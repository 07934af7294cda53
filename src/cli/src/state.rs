//! Run state shared between `dlc restore` and `dlc save`.
//!
//! `restore` runs before the job builds anything and `save` runs after, so
//! the primary key and the image sets seen at restore time are persisted to
//! a JSON file with atomic writes.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// What `restore` saw, as needed by `save`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunState {
    /// Key template the job restored with (and will save under)
    #[serde(default)]
    pub primary_key: Option<String>,
    /// Root key the cache was restored from, if any
    #[serde(default)]
    pub restored_key: Option<String>,
    /// Image ids and tags present before restore
    #[serde(default)]
    pub already_existing_images: Vec<String>,
    /// Image ids and tags that restore brought in
    #[serde(default)]
    pub restored_images: Vec<String>,
    /// When the state was last written
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

impl RunState {
    /// Whether the restored key is exactly the primary key, ignoring case.
    pub fn is_exact_key_match(&self) -> bool {
        self.primary_key
            .as_deref()
            .is_some_and(|key| is_exact_key_match(key, self.restored_key.as_deref()))
    }

    /// Images present before restore plus the ones restore brought in.
    pub fn known_images(&self) -> Vec<String> {
        self.already_existing_images
            .iter()
            .chain(self.restored_images.iter())
            .cloned()
            .collect()
    }
}

/// Whether `cache_key` is present and equals `key`, ignoring case.
pub fn is_exact_key_match(key: &str, cache_key: Option<&str>) -> bool {
    cache_key.is_some_and(|cache_key| !cache_key.is_empty() && cache_key.to_lowercase() == key.to_lowercase())
}

/// Persistent state file backed by JSON.
pub struct StateFile {
    path: PathBuf,
    state: RunState,
}

impl StateFile {
    /// Load state from disk. An empty state is used if the file doesn't exist.
    pub fn load(path: &Path) -> Result<Self, std::io::Error> {
        let state = if path.exists() {
            let data = std::fs::read_to_string(path)?;
            serde_json::from_str(&data).unwrap_or_else(|e| {
                tracing::warn!(path = %path.display(), error = %e, "Ignoring unreadable state file");
                RunState::default()
            })
        } else {
            RunState::default()
        };
        Ok(Self {
            path: path.to_path_buf(),
            state,
        })
    }

    pub fn state(&self) -> &RunState {
        &self.state
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Replace the state and persist it.
    pub fn update(&mut self, mut state: RunState) -> Result<(), std::io::Error> {
        state.updated_at = Some(Utc::now());
        self.state = state;
        self.save()
    }

    /// Save state to disk atomically (write to .tmp, then rename).
    pub fn save(&self) -> Result<(), std::io::Error> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let data = serde_json::to_string_pretty(&self.state).map_err(std::io::Error::other)?;
        let tmp_path = self.path.with_extension("json.tmp");
        std::fs::write(&tmp_path, &data)?;
        std::fs::rename(&tmp_path, &self.path)?;
        Ok(())
    }
}
