//! # Slide Module
//!
//! The image store the pipeline reads from and writes to.
//!
//! - [`SlideImage`] is an open, readable image with a pixel calibration
//!   and a set of preferred pyramid downsamples. Closing is `Drop`.
//! - [`SlideOpener`] resolves a backing file path into a [`SlideImage`].
//! - [`PyramidWriter`] serializes any [`SlideImage`] into a
//!   multi-resolution file.
//!
//! [`RasterSlideOpener`] handles every format the `image` crate decodes,
//! and [`TiffPyramidWriter`] writes losslessly compressed multi-page TIFFs
//! that the raster opener can read back.

mod pyramid;
mod raster;
mod resize;

pub use pyramid::{PyramidWriter, TiffPyramidWriter};
pub use raster::{RasterSlide, RasterSlideOpener};
pub use resize::{scaled_dimensions, FastResizer};

use crate::core::tiling::TileRect;
use crate::error::SlideError;
use image::RgbImage;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Physical size of one pixel, in microns
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PixelCalibration {
    pub pixel_width: f64,
    pub pixel_height: f64,
    pub z_spacing: f64,
}

impl Default for PixelCalibration {
    fn default() -> Self {
        Self {
            pixel_width: 1.0,
            pixel_height: 1.0,
            z_spacing: 1.0,
        }
    }
}

/// An open slide
pub trait SlideImage: Send + Sync {
    /// Full-resolution width in pixels
    fn width(&self) -> u32;

    /// Full-resolution height in pixels
    fn height(&self) -> u32;

    fn calibration(&self) -> PixelCalibration;

    /// Downsamples of the pyramid levels, starting at 1.0
    fn preferred_downsamples(&self) -> Vec<f64>;

    /// Read `rect` (full-resolution coordinates) scaled down by `downsample`
    fn read_region(&self, rect: TileRect, downsample: f64) -> Result<RgbImage, SlideError>;

    /// The whole image as one rectangle
    fn full_rect(&self) -> TileRect {
        TileRect::new(0, 0, self.width(), self.height())
    }
}

/// Opens backing files as slides
pub trait SlideOpener: Send + Sync {
    fn open(&self, path: &Path) -> Result<Box<dyn SlideImage>, SlideError>;
}

/// Check that `rect` lies inside a `width x height` image and `downsample`
/// is usable.
pub(crate) fn validate_request(
    rect: TileRect,
    downsample: f64,
    width: u32,
    height: u32,
) -> Result<(), SlideError> {
    if !downsample.is_finite() || downsample < 1.0 {
        return Err(SlideError::InvalidDownsample(downsample));
    }
    if rect.width == 0 || rect.height == 0 || rect.right() > width || rect.bottom() > height {
        return Err(SlideError::RegionOutOfBounds {
            x: rect.x,
            y: rect.y,
            width: rect.width,
            height: rect.height,
            image_width: width,
            image_height: height,
        });
    }
    Ok(())
}
