//! Multi-resolution output files.

use super::resize::{scaled_dimensions, FastResizer};
use super::{PixelCalibration, SlideImage};
use crate::core::tiling::TileRect;
use crate::error::SlideError;
use image::{imageops, RgbImage};
use std::fs::File;
use std::io::BufWriter;
use std::path::Path;
use tiff::encoder::compression::Deflate;
use tiff::encoder::{colortype, Rational, TiffEncoder};
use tiff::tags::{ResolutionUnit, Tag};
use tracing::debug;

/// NewSubfileType value for a reduced-resolution page
const REDUCED_RESOLUTION: u32 = 1;

/// Most full-resolution pixels read at once while building a reduced level
const BLOCK_SOURCE_PIXELS: u64 = 1 << 24;

/// Serializes a slide into one pyramidal file
pub trait PyramidWriter: Send + Sync {
    /// Write `source` with one level per entry of `downsamples`.
    ///
    /// `description` is stored with the full-resolution level.
    fn write(
        &self,
        source: &dyn SlideImage,
        downsamples: &[f64],
        description: &str,
        output: &Path,
    ) -> Result<(), SlideError>;
}

/// Writes pyramids as multi-page, Deflate-compressed TIFF files.
///
/// Page 0 is the full-resolution image; every following page is a reduced
/// level flagged through NewSubfileType. Pixel calibration is stored as
/// X/Y resolution in pixels per centimetre.
#[derive(Debug, Clone)]
pub struct TiffPyramidWriter {
    rows_per_strip: u32,
}

impl TiffPyramidWriter {
    pub fn new(rows_per_strip: u32) -> Self {
        Self {
            rows_per_strip: rows_per_strip.max(1),
        }
    }

    fn levels(downsamples: &[f64]) -> Vec<f64> {
        let mut levels: Vec<f64> = downsamples
            .iter()
            .copied()
            .filter(|d| d.is_finite() && *d > 1.0)
            .collect();
        levels.sort_by(|a, b| a.total_cmp(b));
        levels.dedup();
        levels.insert(0, 1.0);
        levels
    }
}

impl Default for TiffPyramidWriter {
    fn default() -> Self {
        Self::new(512)
    }
}

fn pixels_per_cm(microns: f64) -> Option<Rational> {
    if !microns.is_finite() || microns <= 0.0 {
        return None;
    }
    let per_cm = 10_000.0 / microns;
    Some(Rational {
        n: (per_cm * 1000.0).round() as u32,
        d: 1000,
    })
}

/// Map an edge of a `from`-wide axis onto a `to`-wide one
fn scale_edge(value: u32, from: u32, to: u32) -> u32 {
    (value as u64 * to as u64 / from.max(1) as u64) as u32
}

impl TiffPyramidWriter {
    /// Rows `y..y + rows` of a `level_width x level_height` reduction of
    /// `source`.
    ///
    /// Built from column blocks, so no single read covers more than
    /// [`BLOCK_SOURCE_PIXELS`] full-resolution pixels.
    fn reduced_strip(
        source: &dyn SlideImage,
        resizer: &mut FastResizer,
        (level_width, level_height): (u32, u32),
        y: u32,
        rows: u32,
    ) -> Result<RgbImage, SlideError> {
        let (width, height) = (source.width(), source.height());
        let top = scale_edge(y, level_height, height);
        let source_rows = (scale_edge(y + rows, level_height, height) - top).max(1);

        let source_columns = (BLOCK_SOURCE_PIXELS / source_rows as u64).max(1);
        let block_width = (source_columns * level_width as u64 / width.max(1) as u64)
            .clamp(1, level_width as u64) as u32;

        let mut strip = RgbImage::new(level_width, rows);
        let mut x = 0;
        while x < level_width {
            let columns = block_width.min(level_width - x);
            let left = scale_edge(x, level_width, width);
            let source_columns = (scale_edge(x + columns, level_width, width) - left).max(1);

            let region = source.read_region(TileRect::new(left, top, source_columns, source_rows), 1.0)?;
            let block = resizer.resize_rgb(&region, columns, rows)?;
            imageops::replace(&mut strip, &block, x as i64, 0);
            x += columns;
        }
        Ok(strip)
    }
}

impl PyramidWriter for TiffPyramidWriter {
    /// Streams every page strip by strip; the full image is never held in
    /// memory.
    fn write(
        &self,
        source: &dyn SlideImage,
        downsamples: &[f64],
        description: &str,
        output: &Path,
    ) -> Result<(), SlideError> {
        let write_failed = |reason: String| SlideError::WriteFailed {
            path: output.to_path_buf(),
            reason,
        };

        let (width, height) = (source.width(), source.height());
        let calibration: PixelCalibration = source.calibration();

        let file = File::create(output).map_err(|e| write_failed(e.to_string()))?;
        let mut encoder =
            TiffEncoder::new(BufWriter::new(file)).map_err(|e| write_failed(e.to_string()))?;
        let mut resizer = FastResizer::new();

        for (index, downsample) in Self::levels(downsamples).into_iter().enumerate() {
            let (level_width, level_height) = if index == 0 {
                (width, height)
            } else {
                scaled_dimensions(width, height, downsample)
            };

            let mut page = encoder
                .new_image_with_compression::<colortype::RGB8, _>(
                    level_width,
                    level_height,
                    Deflate::default(),
                )
                .map_err(|e| write_failed(e.to_string()))?;

            page.rows_per_strip(self.rows_per_strip)
                .map_err(|e| write_failed(e.to_string()))?;

            if index == 0 {
                page.encoder()
                    .write_tag(Tag::ImageDescription, description)
                    .map_err(|e| write_failed(e.to_string()))?;
            } else {
                page.encoder()
                    .write_tag(Tag::NewSubfileType, REDUCED_RESOLUTION)
                    .map_err(|e| write_failed(e.to_string()))?;
            }

            page.resolution_unit(ResolutionUnit::Centimeter);
            if let Some(x) = pixels_per_cm(calibration.pixel_width * downsample) {
                page.x_resolution(x);
            }
            if let Some(y) = pixels_per_cm(calibration.pixel_height * downsample) {
                page.y_resolution(y);
            }

            let mut y = 0;
            while y < level_height {
                let rows = self.rows_per_strip.min(level_height - y);
                let strip = if index == 0 {
                    source.read_region(TileRect::new(0, y, width, rows), 1.0)?
                } else {
                    Self::reduced_strip(source, &mut resizer, (level_width, level_height), y, rows)?
                };
                page.write_strip(strip.as_raw())
                    .map_err(|e| write_failed(e.to_string()))?;
                y += rows;
            }
            page.finish().map_err(|e| write_failed(e.to_string()))?;

            debug!(
                output = %output.display(),
                level = index,
                width = level_width,
                height = level_height,
                "Wrote pyramid level"
            );
        }

        Ok(())
    }
}
