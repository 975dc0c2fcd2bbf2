//! # Slide Normalizer
//!
//! Batch stain normalization for whole-slide images.
//!
//! A run takes every Brightfield H&E entry of a project, cuts its image
//! into tiles (blacking out regions annotated as `Ignore*`), hands the
//! tile directories to external normalization workers, stitches the
//! normalized tiles back into pyramids and registers them in a new
//! project with the original annotations.
//!
//! ## Architecture
//! - `core` - The normalization engine
//! - `events` - Event-driven progress reporting
//! - `error` - Error types with recovery hints

pub mod core;
pub mod error;
pub mod events;

// Re-export commonly used types at the crate root
pub use error::{NormalizerError, Result};

/// Initialize tracing for the library
///
/// Logs go to stderr. `RUST_LOG` overrides the default level, which is
/// `debug` when `verbose` is set and `info` otherwise. Calling this twice
/// keeps the first subscriber.
pub fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}
