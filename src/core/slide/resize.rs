//! SIMD-accelerated RGB downsampling.
//!
//! Wraps `fast_image_resize`, which picks AVX2/NEON paths when available.

use crate::error::SlideError;
use fast_image_resize::{images::Image, FilterType, PixelType, ResizeAlg, ResizeOptions, Resizer};
use image::RgbImage;

/// Reusable resizer for RGB regions
pub struct FastResizer {
    resizer: Resizer,
}

impl FastResizer {
    pub fn new() -> Self {
        Self {
            resizer: Resizer::new(),
        }
    }

    /// Resize `image` to exactly `width x height`.
    ///
    /// Uses a bilinear convolution, which keeps thin structures visible in
    /// the reference thumbnail and pyramid levels.
    pub fn resize_rgb(
        &mut self,
        image: &RgbImage,
        width: u32,
        height: u32,
    ) -> Result<RgbImage, SlideError> {
        if image.width() == 0 || image.height() == 0 {
            return Err(SlideError::ResizeFailed(
                "invalid source dimensions".to_string(),
            ));
        }
        if width == 0 || height == 0 {
            return Err(SlideError::ResizeFailed(
                "invalid destination dimensions".to_string(),
            ));
        }
        if width == image.width() && height == image.height() {
            return Ok(image.clone());
        }

        let src = Image::from_vec_u8(
            image.width(),
            image.height(),
            image.as_raw().clone(),
            PixelType::U8x3,
        )
        .map_err(|e| SlideError::ResizeFailed(format!("source buffer: {}", e)))?;

        let mut dst = Image::new(width, height, PixelType::U8x3);

        let options =
            ResizeOptions::new().resize_alg(ResizeAlg::Convolution(FilterType::Bilinear));

        self.resizer
            .resize(&src, &mut dst, &options)
            .map_err(|e| SlideError::ResizeFailed(e.to_string()))?;

        RgbImage::from_raw(width, height, dst.into_vec())
            .ok_or_else(|| SlideError::ResizeFailed("result buffer size mismatch".to_string()))
    }
}

impl Default for FastResizer {
    fn default() -> Self {
        Self::new()
    }
}

/// Output size of a `width x height` region read at `downsample`
pub fn scaled_dimensions(width: u32, height: u32, downsample: f64) -> (u32, u32) {
    let scale = |v: u32| ((v as f64 / downsample).round() as u32).max(1);
    (scale(width), scale(height))
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    fn create_test_image(width: u32, height: u32) -> RgbImage {
        RgbImage::from_fn(width, height, |x, y| {
            let r = (x * 255 / width.max(1)) as u8;
            let g = (y * 255 / height.max(1)) as u8;
            Rgb([r, g, 128])
        })
    }

    #[test]
    fn resize_produces_requested_dimensions() {
        let mut resizer = FastResizer::new();
        let resized = resizer
            .resize_rgb(&create_test_image(200, 100), 50, 25)
            .unwrap();

        assert_eq!(resized.dimensions(), (50, 25));
    }

    #[test]
    fn resize_of_uniform_image_keeps_colour() {
        let mut resizer = FastResizer::new();
        let flat = RgbImage::from_pixel(64, 64, Rgb([200, 100, 50]));

        let resized = resizer.resize_rgb(&flat, 16, 16).unwrap();

        assert!(resized.pixels().all(|p| *p == Rgb([200, 100, 50])));
    }

    #[test]
    fn resize_to_zero_fails() {
        let mut resizer = FastResizer::new();
        let result = resizer.resize_rgb(&create_test_image(10, 10), 0, 5);
        assert!(matches!(result, Err(SlideError::ResizeFailed(_))));
    }

    #[test]
    fn scaled_dimensions_never_reach_zero() {
        assert_eq!(scaled_dimensions(12000, 8000, 4.0), (3000, 2000));
        assert_eq!(scaled_dimensions(3, 2, 16.0), (1, 1));
        assert_eq!(scaled_dimensions(10, 10, 1.0), (10, 10));
    }
}
