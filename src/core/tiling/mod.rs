//! # Tiling Module
//!
//! Square-tile partitioning of a slide and exclusion masking of regions.
//!
//! ## Partition
//! Tiles are emitted row by row from the origin, stepping by the tile
//! size. The last row and column are clipped to the remaining pixels, so
//! the tiles cover `[0, width) x [0, height)` exactly once and never have
//! zero area.
//!
//! ## Masking
//! Annotations classified as [`IGNORE_CLASS`] form the exclusion geometry.
//! Before a tile is handed to the normalizer, the excluded area is blacked
//! out using one of the [`MaskMode`] strategies.

mod geometry;
mod mask;
mod watermark;

pub use geometry::{Bounds, MaskGeometry, Polygon};
pub use mask::{mask_region, MaskMode};
pub use watermark::Watermark;

use crate::core::project::PathObject;
use serde::{Deserialize, Serialize};

/// Class label marking an operator-drawn exclusion region
pub const IGNORE_CLASS: &str = "Ignore*";

/// A pixel rectangle relative to the full-resolution image
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TileRect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl TileRect {
    pub fn new(x: u32, y: u32, width: u32, height: u32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    /// Number of pixels covered
    pub fn area(&self) -> u64 {
        self.width as u64 * self.height as u64
    }

    /// Exclusive right edge, saturating at `u32::MAX`
    pub fn right(&self) -> u32 {
        self.x.saturating_add(self.width)
    }

    /// Exclusive bottom edge, saturating at `u32::MAX`
    pub fn bottom(&self) -> u32 {
        self.y.saturating_add(self.height)
    }

    /// The rectangle as floating-point bounds
    pub fn bounds(&self) -> Bounds {
        Bounds {
            min_x: self.x as f64,
            min_y: self.y as f64,
            max_x: self.right() as f64,
            max_y: self.bottom() as f64,
        }
    }
}

/// Partition a `width x height` image into square tiles of `tile_size`.
///
/// Returns an empty list if any argument is zero.
pub fn partition(width: u32, height: u32, tile_size: u32) -> Vec<TileRect> {
    if width == 0 || height == 0 || tile_size == 0 {
        return Vec::new();
    }

    let rows = height.div_ceil(tile_size) as usize;
    let cols = width.div_ceil(tile_size) as usize;
    let mut tiles = Vec::with_capacity(rows * cols);

    for y in (0..height).step_by(tile_size as usize) {
        let tile_height = tile_size.min(height - y);
        for x in (0..width).step_by(tile_size as usize) {
            let tile_width = tile_size.min(width - x);
            tiles.push(TileRect::new(x, y, tile_width, tile_height));
        }
    }

    tiles
}

/// Union of every annotation classified as [`IGNORE_CLASS`], nested ones included.
pub fn build_exclusion_geometry(objects: &[PathObject]) -> MaskGeometry {
    let mut geometry = MaskGeometry::default();
    collect_ignored(objects, &mut geometry);
    geometry
}

fn collect_ignored(objects: &[PathObject], geometry: &mut MaskGeometry) {
    for object in objects {
        if object.is_annotation() && object.class_label.as_deref() == Some(IGNORE_CLASS) {
            geometry.add(object.roi.clone());
        }
        collect_ignored(&object.children, geometry);
    }
}
