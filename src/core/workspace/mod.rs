//! # Workspace Module
//!
//! Working directories for one normalization run.
//!
//! ## Layout
//! ```text
//! <root>/normalized[N]/
//!     img_temp/            tiles, sidecars, worker output (deleted at run end)
//!     QuPath_project[N]/   the freshly created project
//!     img_final/           stitched pyramids
//! ```
//! Every directory is created exactly once per run. When a name is taken,
//! a numeric suffix is tried (`name1`, `name2`, ...) until a free one is found.

use crate::error::WorkspaceError;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::{info, warn};
use walkdir::WalkDir;

const MAIN_DIR_NAME: &str = "normalized";
const TEMP_DIR_NAME: &str = "img_temp";
const PROJECT_DIR_NAME: &str = "QuPath_project";
const FINAL_DIR_NAME: &str = "img_final";

/// The four directories of a run
#[derive(Debug, Clone)]
pub struct WorkspaceLayout {
    main_dir: PathBuf,
    temp_dir: PathBuf,
    project_dir: PathBuf,
    final_dir: PathBuf,
}

impl WorkspaceLayout {
    /// Create the run directories under `root`.
    pub fn create(root: &Path) -> Result<Self, WorkspaceError> {
        if !root.is_dir() {
            return Err(WorkspaceError::ParentNotFound {
                path: root.to_path_buf(),
            });
        }

        let main_dir = create_unique_directory(root, MAIN_DIR_NAME)?;
        let temp_dir = create_unique_directory(&main_dir, TEMP_DIR_NAME)?;
        let project_dir = create_unique_directory(&main_dir, PROJECT_DIR_NAME)?;
        let final_dir = create_unique_directory(&main_dir, FINAL_DIR_NAME)?;

        info!("Created workspace at {}", main_dir.display());

        Ok(Self {
            main_dir,
            temp_dir,
            project_dir,
            final_dir,
        })
    }

    /// The `normalized[N]` root
    pub fn main_dir(&self) -> &Path {
        &self.main_dir
    }

    /// Tile directories and sidecars
    pub fn temp_dir(&self) -> &Path {
        &self.temp_dir
    }

    /// Directory of the new project
    pub fn project_dir(&self) -> &Path {
        &self.project_dir
    }

    /// Stitched, normalized images
    pub fn final_dir(&self) -> &Path {
        &self.final_dir
    }
}

/// Create `parent/name`, or `parent/name1`, `parent/name2`, ... if taken.
///
/// Fails with an I/O error on permission denial or when another process
/// creates the tried name between the check and the create.
pub fn create_unique_directory(parent: &Path, name: &str) -> Result<PathBuf, WorkspaceError> {
    let mut path = parent.join(name);
    let mut counter = 0u32;

    while path.exists() {
        counter += 1;
        path = parent.join(format!("{}{}", name, counter));
    }

    fs::create_dir(&path).map_err(|source| WorkspaceError::CreateFailed {
        path: path.clone(),
        source,
    })?;

    Ok(path)
}

/// Delete a directory and its contents, deepest entries first.
///
/// Failures are logged and accumulated rather than aborting, so the return
/// value is advisory: `true` only if every entry was removed. Open file
/// handles held by other processes can make this return `false`.
pub fn delete_directory(dir: &Path) -> bool {
    if !dir.exists() {
        return true;
    }

    info!("Deleting {} and its contents...", dir.display());
    let mut success = true;

    for entry in WalkDir::new(dir).contents_first(true) {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                warn!("Failed to visit an entry in {}: {}", dir.display(), e);
                success = false;
                continue;
            }
        };

        let path = entry.path();
        let result = if entry.file_type().is_dir() {
            fs::remove_dir(path)
        } else {
            fs::remove_file(path)
        };

        if let Err(e) = result {
            if e.kind() != ErrorKind::NotFound {
                warn!("Failed to delete {} in {}: {}", path.display(), dir.display(), e);
                success = false;
            }
        }
    }

    success
}
