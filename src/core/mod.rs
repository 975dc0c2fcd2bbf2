//! # Core Module
//!
//! The UI-agnostic normalization engine.
//!
//! ## Modules
//! - `workspace` - Creates and removes the run's working directories
//! - `tiling` - Tile grids, exclusion geometry and masking
//! - `slide` - Reading slides and writing pyramids
//! - `tiles` - Extracting tile directories and stitching them back
//! - `dispatch` - Runs external normalization workers
//! - `project` - Source and rebuilt image projects
//! - `pipeline` - Orchestrates the full workflow

pub mod dispatch;
pub mod pipeline;
pub mod project;
pub mod slide;
pub mod tiles;
pub mod tiling;
pub mod workspace;

// Re-export commonly used types
pub use pipeline::{CancellationToken, NormalizerConfig, Orchestrator};
pub use project::{ImageEntry, ImageType, PathObject, ProjectStore, SqliteProject};
pub use tiling::{MaskMode, TileRect};
pub use workspace::WorkspaceLayout;
