//! # slide-norm CLI
//!
//! Command-line interface for the slide normalizer.
//!
//! ## Usage
//! ```bash
//! slide-norm add ~/projects/liver ~/slides/case_12.tif --image-type he
//! slide-norm run ~/projects/liver --worker ./normalize --multiprocess
//! slide-norm list ~/projects/liver/normalized/QuPath_project
//! ```

mod cli;

use slide_normalizer::Result;

fn main() -> Result<()> {
    cli::run()
}
