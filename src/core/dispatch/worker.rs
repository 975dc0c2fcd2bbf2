//! Resolving and staging the worker executable.

use crate::error::DispatchError;
use std::path::{Path, PathBuf};
use tempfile::{NamedTempFile, TempPath};
use tracing::{info, warn};

/// How to launch one worker process
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerCommand {
    /// Executable, either a path or a name looked up on `PATH`
    pub program: PathBuf,
    /// Arguments placed before the encoded directory list
    pub leading_args: Vec<String>,
    /// Copy the executable to a private temp file before launching
    pub stage: bool,
}

impl WorkerCommand {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            leading_args: Vec::new(),
            stage: false,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.leading_args.push(arg.into());
        self
    }

    pub fn staged(mut self, stage: bool) -> Self {
        self.stage = stage;
        self
    }

    /// Resolve the executable, staging it when requested
    pub(crate) fn prepare(&self) -> Result<PreparedWorker, DispatchError> {
        let is_path = self.program.components().count() > 1;
        if (is_path || self.stage) && !self.program.is_file() {
            return Err(DispatchError::WorkerNotFound {
                path: self.program.clone(),
            });
        }

        if !self.stage {
            return Ok(PreparedWorker {
                program: self.program.clone(),
                staged: None,
            });
        }

        let staged = stage_executable(&self.program)?;
        info!(path = %staged.display(), "Staged worker executable");
        Ok(PreparedWorker {
            program: staged.to_path_buf(),
            staged: Some(staged),
        })
    }
}

/// A worker executable ready to launch
pub(crate) struct PreparedWorker {
    pub program: PathBuf,
    staged: Option<TempPath>,
}

impl PreparedWorker {
    /// Delete the staged copy, if any
    pub fn cleanup(self) {
        if let Some(staged) = self.staged {
            let path = staged.to_path_buf();
            match staged.close() {
                Ok(()) => info!(path = %path.display(), "Temporary worker executable deleted"),
                Err(e) => warn!(
                    path = %path.display(),
                    error = %e,
                    "Failed to delete temporary worker executable"
                ),
            }
        }
    }
}

fn stage_executable(source: &Path) -> Result<TempPath, DispatchError> {
    let staging_failed = |e: std::io::Error| DispatchError::StagingFailed(e.to_string());

    let temp = NamedTempFile::with_prefix("slide-norm-worker-").map_err(staging_failed)?;
    let path = temp.into_temp_path();
    std::fs::copy(source, &path).map_err(staging_failed)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755))
            .map_err(staging_failed)?;
    }

    Ok(path)
}
