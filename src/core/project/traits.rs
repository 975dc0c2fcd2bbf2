//! Project store trait definition.

use super::ImageEntry;
use crate::error::ProjectError;
use std::path::Path;

/// Trait for project backends
pub trait ProjectStore: Send + Sync {
    /// Directory the project lives in
    fn base_dir(&self) -> &Path;

    /// All entries, in insertion order
    fn entries(&self) -> Result<Vec<ImageEntry>, ProjectError>;

    /// Register a new entry
    fn add_entry(&self, entry: &ImageEntry) -> Result<(), ProjectError>;

    /// Persist changes to an existing entry
    ///
    /// Fails with `EntryNotFound` if the entry was never added.
    fn save_entry(&self, entry: &ImageEntry) -> Result<(), ProjectError>;

    /// Number of entries
    fn len(&self) -> Result<usize, ProjectError> {
        Ok(self.entries()?.len())
    }

    fn is_empty(&self) -> Result<bool, ProjectError> {
        Ok(self.len()? == 0)
    }
}
