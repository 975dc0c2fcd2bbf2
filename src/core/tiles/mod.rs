//! # Tiles Module
//!
//! Extraction of slides into tile directories and reconstruction of
//! normalized tile directories into pyramids.
//!
//! ## Directory Layout
//! ```text
//! <tiles>/<base name>/
//!   [x-0,y-0,w-5000,h-5000].tif   one file per tile
//!   reference.tif                 downsampled, masked thumbnail
//!   metadata.txt                  [pH-..,pW-..,zSp-..,dsp-[..]]
//!   tiles.json                    {file, rect} per tile
//!   ERROR.txt                     written by the worker on failure
//! ```
//!
//! Tile positions are read from `tiles.json` when present. Directories
//! without an index fall back to decoding the tile file names.

mod extract;
mod mosaic;
mod naming;
mod stitch;

pub use extract::{extract_tiles, reference_downsample, ExtractOptions, ExtractedTiles, MAX_REFERENCE_PIXELS};
pub use mosaic::{MosaicTile, SparseMosaic};
pub use naming::{
    is_tile_file, parse_tile_file_name, tile_file_name, SlideMetadata, TileIndex, TileIndexEntry,
    ERROR_FILE_NAME, METADATA_FILE_NAME, REFERENCE_FILE_NAME, TILE_INDEX_FILE_NAME,
};
pub use stitch::{final_file_name, stitch, StitchOptions, DEFAULT_FINAL_SUFFIX, FINAL_EXTENSION};
