//! Watermark glyph tiled across masked regions.
//!
//! The glyph is repeated on a world-space grid whose cells are the glyph
//! bounds plus a tenth of the glyph width as spacing. Glyph areas are cut
//! out of the mask, so the slide content shows through them.
//!
//! The grid origin is snapped backward from the mask bounds to a multiple
//! of the cell size. The grid is therefore anchored to the full-resolution
//! image, and a cell covers the same content whether the mask is rendered
//! from one tile or from several adjacent ones.

use super::geometry::{Bounds, Polygon};
use serde::{Deserialize, Serialize};

/// A watermark glyph in full-resolution pixel units.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Vec<Polygon>", into = "Vec<Polygon>")]
pub struct Watermark {
    glyph: Vec<Polygon>,
    glyph_width: f64,
    glyph_height: f64,
}

impl Watermark {
    /// Build a watermark from glyph polygons, normalized so the glyph
    /// bounds start at (0, 0). Returns `None` if the glyph has no area.
    pub fn new(polygons: Vec<Polygon>) -> Option<Self> {
        let polygons: Vec<Polygon> = polygons.into_iter().filter(|p| p.area() > 0.0).collect();
        let bounds = polygons
            .iter()
            .filter_map(Polygon::bounds)
            .reduce(|a, b| a.union(&b))?;

        let glyph = polygons
            .iter()
            .map(|p| p.translate(-bounds.min_x, -bounds.min_y))
            .collect();

        Some(Self {
            glyph,
            glyph_width: bounds.width(),
            glyph_height: bounds.height(),
        })
    }

    /// Width and height of one grid cell
    pub fn cell_size(&self) -> (f64, f64) {
        let spacing = self.glyph_width / 10.0;
        (self.glyph_width + spacing, self.glyph_height + spacing)
    }

    /// Grid origin for a mask with the given bounds
    pub fn grid_origin(&self, mask_bounds: &Bounds) -> (f64, f64) {
        let (cell_width, cell_height) = self.cell_size();
        (
            (mask_bounds.min_x / cell_width).floor() * cell_width,
            (mask_bounds.min_y / cell_height).floor() * cell_height,
        )
    }

    /// Whether a full-resolution point falls on the glyph of its cell
    pub fn covers(&self, origin: (f64, f64), x: f64, y: f64) -> bool {
        let (cell_width, cell_height) = self.cell_size();
        let local_x = (x - origin.0).rem_euclid(cell_width);
        let local_y = (y - origin.1).rem_euclid(cell_height);
        if local_x > self.glyph_width || local_y > self.glyph_height {
            return false;
        }
        self.glyph.iter().any(|p| p.contains(local_x, local_y))
    }
}

impl Default for Watermark {
    /// A stamp of five vertical bars, 300x80 pixels at full resolution.
    fn default() -> Self {
        let bars = (0..5)
            .map(|i| Polygon::rectangle(i as f64 * 64.0, 0.0, 44.0, 80.0))
            .collect();
        Self::new(bars).unwrap_or(Self {
            glyph: Vec::new(),
            glyph_width: 1.0,
            glyph_height: 1.0,
        })
    }
}

impl TryFrom<Vec<Polygon>> for Watermark {
    type Error = String;

    fn try_from(polygons: Vec<Polygon>) -> Result<Self, Self::Error> {
        Watermark::new(polygons).ok_or_else(|| "watermark glyph has no area".to_string())
    }
}

impl From<Watermark> for Vec<Polygon> {
    fn from(watermark: Watermark) -> Self {
        watermark.glyph
    }
}
