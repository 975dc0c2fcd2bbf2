//! In-memory project backend for testing.

use super::{ImageEntry, ProjectStore};
use crate::error::ProjectError;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

/// In-memory project backend
///
/// Useful for tests and for callers that persist entries themselves.
pub struct InMemoryProject {
    base_dir: PathBuf,
    entries: RwLock<Vec<ImageEntry>>,
}

impl InMemoryProject {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
            entries: RwLock::new(Vec::new()),
        }
    }

    /// Project pre-populated with `entries`
    pub fn with_entries(base_dir: impl Into<PathBuf>, entries: Vec<ImageEntry>) -> Self {
        Self {
            base_dir: base_dir.into(),
            entries: RwLock::new(entries),
        }
    }

    fn poisoned(&self) -> ProjectError {
        ProjectError::Corrupted {
            path: PathBuf::from("memory"),
        }
    }
}

impl ProjectStore for InMemoryProject {
    fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    fn entries(&self) -> Result<Vec<ImageEntry>, ProjectError> {
        let entries = self.entries.read().map_err(|_| self.poisoned())?;
        Ok(entries.clone())
    }

    fn add_entry(&self, entry: &ImageEntry) -> Result<(), ProjectError> {
        let mut entries = self.entries.write().map_err(|_| self.poisoned())?;
        entries.push(entry.clone());
        Ok(())
    }

    fn save_entry(&self, entry: &ImageEntry) -> Result<(), ProjectError> {
        let mut entries = self.entries.write().map_err(|_| self.poisoned())?;
        let slot = entries
            .iter_mut()
            .find(|e| e.id == entry.id)
            .ok_or_else(|| ProjectError::EntryNotFound {
                id: entry.id.to_string(),
            })?;
        *slot = entry.clone();
        Ok(())
    }
}
