//! # Pipeline Module
//!
//! Orchestrates a full normalization run.
//!
//! ## Pipeline Stages
//! 1. **Enumerate** - Pick usable H&E entries from the source project
//! 2. **Tile** - Cut each image into masked tiles under the temp directory
//! 3. **Normalize** - Hand every tile directory to external workers
//! 4. **Stitch** - Reassemble each directory into one pyramid
//! 5. **Rebuild** - Register the stitched images in a fresh project
//!
//! Tiling and stitching fail per item: the error flag is raised and the
//! run carries on. A failed dispatch aborts the run before stitching.
//!
//! ## Parallelism
//! Tile reads and writes use rayon. Worker output is read on one thread
//! per process.

mod enumerate;
mod executor;
mod state;

pub use enumerate::{enumerate_entries, tiling_passes, Enumeration, SourceImageRecord};
pub use executor::{
    find_normalized_image, NormalizerConfig, Orchestrator, OrchestratorBuilder, ProjectFactory,
    DEFAULT_WORKER,
};
pub use state::{CancellationToken, RunSnapshot, RunState};
