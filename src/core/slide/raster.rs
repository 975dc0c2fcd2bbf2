//! Slides decoded fully into memory by the `image` crate.

use super::resize::{scaled_dimensions, FastResizer};
use super::{validate_request, PixelCalibration, SlideImage, SlideOpener};
use crate::core::tiling::TileRect;
use crate::error::SlideError;
use image::{imageops, ImageError, ImageReader, Limits, RgbImage};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Smallest side a generated pyramid level may have
const MIN_LEVEL_SIDE: f64 = 512.0;

/// An in-memory RGB slide
pub struct RasterSlide {
    path: Option<PathBuf>,
    pixels: RgbImage,
    calibration: PixelCalibration,
}

impl RasterSlide {
    pub fn from_image(pixels: RgbImage) -> Self {
        Self {
            path: None,
            pixels,
            calibration: PixelCalibration::default(),
        }
    }

    pub fn with_calibration(mut self, calibration: PixelCalibration) -> Self {
        self.calibration = calibration;
        self
    }

    /// File the slide was decoded from, if any
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }
}

impl SlideImage for RasterSlide {
    fn width(&self) -> u32 {
        self.pixels.width()
    }

    fn height(&self) -> u32 {
        self.pixels.height()
    }

    fn calibration(&self) -> PixelCalibration {
        self.calibration
    }

    /// Powers of four while the largest side stays at or above 512 px
    fn preferred_downsamples(&self) -> Vec<f64> {
        let largest = self.width().max(self.height()) as f64;
        let mut downsamples = vec![1.0];
        let mut next = 4.0;
        while largest / next >= MIN_LEVEL_SIDE {
            downsamples.push(next);
            next *= 4.0;
        }
        downsamples
    }

    fn read_region(&self, rect: TileRect, downsample: f64) -> Result<RgbImage, SlideError> {
        validate_request(rect, downsample, self.width(), self.height())?;

        let region =
            imageops::crop_imm(&self.pixels, rect.x, rect.y, rect.width, rect.height).to_image();
        if downsample == 1.0 {
            return Ok(region);
        }

        let (width, height) = scaled_dimensions(rect.width, rect.height, downsample);
        FastResizer::new().resize_rgb(&region, width, height)
    }
}

/// Opens any format the `image` crate can decode
#[derive(Debug, Clone, Default)]
pub struct RasterSlideOpener {
    max_pixels: Option<u64>,
}

impl RasterSlideOpener {
    pub fn new() -> Self {
        Self::default()
    }

    /// Refuse to decode images larger than `max_pixels`
    pub fn with_max_pixels(mut self, max_pixels: u64) -> Self {
        self.max_pixels = Some(max_pixels);
        self
    }

    fn limits(&self) -> Limits {
        match self.max_pixels {
            Some(max) => {
                let mut limits = Limits::no_limits();
                limits.max_alloc = Some(max.saturating_mul(4));
                limits
            }
            None => Limits::no_limits(),
        }
    }
}

impl SlideOpener for RasterSlideOpener {
    fn open(&self, path: &Path) -> Result<Box<dyn SlideImage>, SlideError> {
        let open_failed = |reason: String| SlideError::OpenFailed {
            path: path.to_path_buf(),
            reason,
        };

        let mut reader = ImageReader::open(path)
            .map_err(|e| open_failed(e.to_string()))?
            .with_guessed_format()
            .map_err(|e| open_failed(e.to_string()))?;
        reader.limits(self.limits());

        let decoded = reader.decode().map_err(|e| match e {
            ImageError::Limits(_) => {
                let (width, height) = image::image_dimensions(path).unwrap_or((0, 0));
                SlideError::ResourceExhausted { width, height }
            }
            other => open_failed(other.to_string()),
        })?;

        let pixels = decoded.to_rgb8();
        if let Some(max) = self.max_pixels {
            if pixels.width() as u64 * pixels.height() as u64 > max {
                return Err(SlideError::ResourceExhausted {
                    width: pixels.width(),
                    height: pixels.height(),
                });
            }
        }

        debug!(
            path = %path.display(),
            width = pixels.width(),
            height = pixels.height(),
            "Opened raster slide"
        );

        Ok(Box::new(RasterSlide {
            path: Some(path.to_path_buf()),
            pixels,
            calibration: PixelCalibration::default(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;
    use tempfile::TempDir;

    fn checker(width: u32, height: u32) -> RgbImage {
        RgbImage::from_fn(width, height, |x, y| {
            if (x / 4 + y / 4) % 2 == 0 {
                Rgb([255, 255, 255])
            } else {
                Rgb([10, 20, 30])
            }
        })
    }

    #[test]
    fn full_resolution_read_is_an_exact_crop() {
        let source = checker(40, 30);
        let slide = RasterSlide::from_image(source.clone());

        let region = slide.read_region(TileRect::new(4, 8, 12, 10), 1.0).unwrap();

        assert_eq!(
            region,
            imageops::crop_imm(&source, 4, 8, 12, 10).to_image()
        );
    }

    #[test]
    fn downsampled_read_shrinks_region() {
        let slide = RasterSlide::from_image(checker(40, 30));

        let region = slide.read_region(TileRect::new(0, 0, 40, 30), 4.0).unwrap();

        assert_eq!(region.dimensions(), (10, 8));
    }

    #[test]
    fn preferred_downsamples_stop_above_minimum_level() {
        let slide = RasterSlide::from_image(RgbImage::new(9000, 3000));
        assert_eq!(slide.preferred_downsamples(), vec![1.0, 4.0]);

        let small = RasterSlide::from_image(RgbImage::new(300, 200));
        assert_eq!(small.preferred_downsamples(), vec![1.0]);
    }

    #[test]
    fn opener_decodes_png() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("slide.png");
        checker(16, 12).save(&path).unwrap();

        let slide = RasterSlideOpener::new().open(&path).unwrap();

        assert_eq!((slide.width(), slide.height()), (16, 12));
        assert_eq!(slide.calibration(), PixelCalibration::default());
    }

    #[test]
    fn opener_reports_missing_file() {
        let result = RasterSlideOpener::new().open(Path::new("/nonexistent/slide.tif"));
        assert!(matches!(result, Err(SlideError::OpenFailed { .. })));
    }

    #[test]
    fn opener_enforces_pixel_limit() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("big.png");
        checker(64, 64).save(&path).unwrap();

        let result = RasterSlideOpener::new().with_max_pixels(100).open(&path);

        assert!(matches!(result, Err(SlideError::ResourceExhausted { .. })));
    }
}
