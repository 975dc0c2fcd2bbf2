//! # Error Module
//!
//! Error types for the slide normalizer.
//!
//! ## Design Principles
//! - **Never panic** on slide data - return errors instead
//! - **Include context** - paths, tile names, what went wrong
//! - **Per-item vs fatal** - stage errors for one image never abort the run;
//!   only setup, dispatch and unexpected errors do
//! - **Recovery hints** - suggest how to fix when possible

use std::path::PathBuf;
use thiserror::Error;

/// Top-level application error
#[derive(Error, Debug)]
pub enum NormalizerError {
    #[error("Workspace error: {0}")]
    Workspace(#[from] WorkspaceError),

    #[error("Image store error: {0}")]
    Slide(#[from] SlideError),

    #[error("Tiling error: {0}")]
    Tiling(#[from] TilingError),

    #[error("Stitching error: {0}")]
    Stitch(#[from] StitchError),

    #[error("Normalization error: {0}")]
    Dispatch(#[from] DispatchError),

    #[error("Project error: {0}")]
    Project(#[from] ProjectError),

    #[error("Run cancelled by user")]
    Cancelled,

    #[error("Configuration error: {0}")]
    Config(String),
}

impl NormalizerError {
    /// Whether this error is the cooperative cancellation signal
    pub fn is_cancelled(&self) -> bool {
        matches!(
            self,
            NormalizerError::Cancelled | NormalizerError::Dispatch(DispatchError::Cancelled)
        )
    }
}

/// Errors creating or cleaning up the working directories
#[derive(Error, Debug)]
pub enum WorkspaceError {
    #[error("Failed to create directory {path}: {source}")]
    CreateFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Parent directory not found: {path}")]
    ParentNotFound { path: PathBuf },
}

/// Errors from the image store (reading slides, writing pyramids)
#[derive(Error, Debug)]
pub enum SlideError {
    #[error("Failed to open slide {path}: {reason}")]
    OpenFailed { path: PathBuf, reason: String },

    #[error("Region {x},{y} {width}x{height} is outside the {image_width}x{image_height} image")]
    RegionOutOfBounds {
        x: u32,
        y: u32,
        width: u32,
        height: u32,
        image_width: u32,
        image_height: u32,
    },

    #[error("Invalid downsample {0} (must be >= 1)")]
    InvalidDownsample(f64),

    #[error("Resize failed: {0}")]
    ResizeFailed(String),

    #[error("Failed to write {path}: {reason}")]
    WriteFailed { path: PathBuf, reason: String },

    #[error("Not enough memory for a {width}x{height} image. Try a smaller tile size.")]
    ResourceExhausted { width: u32, height: u32 },
}

/// Errors while extracting tiles for one image
#[derive(Error, Debug)]
pub enum TilingError {
    #[error("Invalid tile size {0} (must be > 0)")]
    InvalidTileSize(u32),

    #[error("Failed to write tile {path}: {reason}")]
    WriteFailed { path: PathBuf, reason: String },

    #[error("Failed to write metadata for {path}: {source}")]
    MetadataFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Slide(#[from] SlideError),

    #[error("Failed to create tile directory {path}: {source}")]
    CreateDirFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Files for {base_name} were removed because an error occurred: {reason}")]
    Discarded { base_name: String, reason: String },
}

/// Errors while stitching one tile directory back into a pyramid
#[derive(Error, Debug)]
pub enum StitchError {
    #[error("Stitching for {dir} was skipped because its tiles failed to normalize properly")]
    NotNormalized { dir: PathBuf },

    #[error("Stitching for {dir} was skipped because its metadata is missing")]
    MissingMetadata { dir: PathBuf },

    #[error("Malformed metadata in {path}: {reason}")]
    BadMetadata { path: PathBuf, reason: String },

    #[error(
        "Could not decode the tile position from {file}: {reason}. \
         This may be due to the names of the image files being too long."
    )]
    BadTileName { file: String, reason: String },

    #[error("No tiles found in {dir}")]
    NoTiles { dir: PathBuf },

    #[error("Failed to read tile {path}: {reason}")]
    ReadFailed { path: PathBuf, reason: String },

    #[error("Failed to read directory {path}: {source}")]
    ReadDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Slide(#[from] SlideError),
}

/// Errors from dispatching tile directories to external workers
#[derive(Error, Debug)]
pub enum DispatchError {
    #[error("Worker executable not found: {path}")]
    WorkerNotFound { path: PathBuf },

    #[error("Failed to stage worker executable: {0}")]
    StagingFailed(String),

    #[error("Failed to launch worker #{worker}: {source}")]
    LaunchFailed {
        worker: usize,
        #[source]
        source: std::io::Error,
    },

    #[error("Worker #{worker} finished with exit code {code:?}")]
    WorkerFailed { worker: usize, code: Option<i32> },

    #[error("Failed to wait for worker #{worker}: {source}")]
    WaitFailed {
        worker: usize,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to list tile directories in {path}: {source}")]
    ListFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to encode worker argument: {0}")]
    EncodeFailed(String),

    #[error("Normalization was cancelled")]
    Cancelled,
}

/// Errors from the project store
#[derive(Error, Debug)]
pub enum ProjectError {
    #[error("Failed to open project at {path}: {reason}")]
    OpenFailed { path: PathBuf, reason: String },

    #[error("Project query failed: {0}")]
    QueryFailed(String),

    #[error("Project database at {path} is unusable. Delete this file and try again.")]
    Corrupted { path: PathBuf },

    #[error("Failed to serialize entry objects: {0}")]
    SerializationFailed(String),

    #[error("Entry not found: {id}")]
    EntryNotFound { id: String },
}

/// Convenience Result type alias
pub type Result<T> = std::result::Result<T, NormalizerError>;
