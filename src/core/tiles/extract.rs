//! Writing a slide out as a directory of tiles.

use super::naming::{tile_file_name, SlideMetadata, TileIndex, REFERENCE_FILE_NAME};
use crate::core::slide::SlideImage;
use crate::core::tiling::{mask_region, partition, MaskGeometry, MaskMode, TileRect, Watermark};
use crate::core::workspace::delete_directory;
use crate::error::TilingError;
use image::{ImageFormat, RgbImage};
use rayon::prelude::*;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Area cap of the reference thumbnail, in pixels
pub const MAX_REFERENCE_PIXELS: f64 = 7000.0 * 7000.0;

/// How tiles are cut, masked and written
#[derive(Debug, Clone)]
pub struct ExtractOptions {
    pub tile_size: u32,
    /// Masking applied to tiles when exclusion geometry exists
    pub tile_mask: MaskMode,
    /// Masking applied to the reference thumbnail when exclusion geometry exists
    pub reference_mask: MaskMode,
    /// Write tiles on the rayon pool
    pub parallel: bool,
}

impl Default for ExtractOptions {
    fn default() -> Self {
        Self {
            tile_size: 5000,
            tile_mask: MaskMode::Watermarked(Watermark::default()),
            reference_mask: MaskMode::Solid,
            parallel: true,
        }
    }
}

/// Result of a successful extraction
#[derive(Debug, Clone)]
pub struct ExtractedTiles {
    /// The per-image tile directory
    pub dir: PathBuf,
    pub tiles: Vec<TileRect>,
}

/// Downsample giving a reference thumbnail of at most [`MAX_REFERENCE_PIXELS`]
pub fn reference_downsample(width: u32, height: u32) -> f64 {
    let area = width as f64 * height as f64;
    (area / MAX_REFERENCE_PIXELS).sqrt().max(1.0)
}

/// Cut `slide` into tiles under `output_dir/base_name`.
///
/// Tiles overlapping `exclusion` are masked before writing. Besides the
/// tiles, the directory receives the reference thumbnail, the metadata
/// sidecar and the tile index. On any failure the whole directory is
/// removed before the error is returned, so a partial tile set is never
/// left behind.
pub fn extract_tiles(
    slide: &dyn SlideImage,
    exclusion: &MaskGeometry,
    output_dir: &Path,
    base_name: &str,
    options: &ExtractOptions,
) -> Result<ExtractedTiles, TilingError> {
    if options.tile_size == 0 {
        return Err(TilingError::InvalidTileSize(options.tile_size));
    }

    let dir = output_dir.join(base_name);
    std::fs::create_dir_all(&dir).map_err(|e| TilingError::CreateDirFailed {
        path: dir.clone(),
        source: e,
    })?;

    info!(base_name, dir = %dir.display(), "Writing tiles");

    match write_tile_set(slide, exclusion, &dir, options) {
        Ok(tiles) => {
            info!(base_name, tiles = tiles.len(), "Tiles written");
            Ok(ExtractedTiles { dir, tiles })
        }
        Err(e) => {
            if !delete_directory(&dir) {
                warn!(dir = %dir.display(), "Could not fully remove partial tile directory");
            }
            Err(TilingError::Discarded {
                base_name: base_name.to_string(),
                reason: e.to_string(),
            })
        }
    }
}

fn write_tile_set(
    slide: &dyn SlideImage,
    exclusion: &MaskGeometry,
    dir: &Path,
    options: &ExtractOptions,
) -> Result<Vec<TileRect>, TilingError> {
    let tiles = partition(slide.width(), slide.height(), options.tile_size);
    let masked = !exclusion.is_empty();

    let write_one = |rect: &TileRect| -> Result<(), TilingError> {
        let region = slide.read_region(*rect, 1.0)?;
        let region = if masked {
            mask_region(region, *rect, exclusion, 1.0, &options.tile_mask)
        } else {
            region
        };
        save_tiff(&region, &dir.join(tile_file_name(rect)))
    };

    if options.parallel {
        tiles.par_iter().try_for_each(write_one)?;
    } else {
        tiles.iter().try_for_each(write_one)?;
    }

    debug!(dir = %dir.display(), "Generating reference image");
    let full = slide.full_rect();
    let downsample = reference_downsample(full.width, full.height);
    let reference = slide.read_region(full, downsample)?;
    let reference = if masked {
        mask_region(reference, full, exclusion, downsample, &options.reference_mask)
    } else {
        reference
    };
    save_tiff(&reference, &dir.join(REFERENCE_FILE_NAME))?;

    let metadata = SlideMetadata {
        calibration: slide.calibration(),
        downsamples: slide.preferred_downsamples(),
    };
    metadata
        .write(dir)
        .map_err(|e| TilingError::MetadataFailed {
            path: dir.to_path_buf(),
            source: e,
        })?;

    TileIndex::from_rects(&tiles)
        .write(dir)
        .map_err(|e| TilingError::MetadataFailed {
            path: dir.to_path_buf(),
            source: e,
        })?;

    Ok(tiles)
}

fn save_tiff(image: &RgbImage, path: &Path) -> Result<(), TilingError> {
    image
        .save_with_format(path, ImageFormat::Tiff)
        .map_err(|e| TilingError::WriteFailed {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::slide::RasterSlide;
    use crate::core::tiles::naming::{METADATA_FILE_NAME, TILE_INDEX_FILE_NAME};
    use crate::core::tiling::Polygon;
    use crate::error::SlideError;
    use image::Rgb;
    use tempfile::TempDir;

    fn slide(width: u32, height: u32) -> RasterSlide {
        RasterSlide::from_image(RgbImage::from_fn(width, height, |x, y| {
            Rgb([(x % 200) as u8 + 20, (y % 200) as u8 + 20, 90])
        }))
    }

    fn options(tile_size: u32) -> ExtractOptions {
        ExtractOptions {
            tile_size,
            parallel: false,
            ..ExtractOptions::default()
        }
    }

    fn file_names(dir: &Path) -> Vec<String> {
        let mut names: Vec<String> = std::fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
            .collect();
        names.sort();
        names
    }

    #[test]
    fn reference_downsample_caps_area() {
        assert_eq!(reference_downsample(5000, 5000), 1.0);
        let ds = reference_downsample(70000, 28000);
        let area = (70000.0 / ds) * (28000.0 / ds);
        assert!((area - MAX_REFERENCE_PIXELS).abs() < 1.0);
    }

    #[test]
    fn extraction_writes_tiles_and_companions() {
        let out = TempDir::new().unwrap();

        let result = extract_tiles(
            &slide(30, 20),
            &MaskGeometry::default(),
            out.path(),
            "slide",
            &options(16),
        )
        .unwrap();

        assert_eq!(result.tiles.len(), 4);
        assert_eq!(
            file_names(&result.dir),
            vec![
                "[x-0,y-0,w-16,h-16].tif",
                "[x-0,y-16,w-16,h-4].tif",
                "[x-16,y-0,w-14,h-16].tif",
                "[x-16,y-16,w-14,h-4].tif",
                METADATA_FILE_NAME,
                REFERENCE_FILE_NAME,
                TILE_INDEX_FILE_NAME,
            ]
        );
    }

    #[test]
    fn unmasked_tiles_are_exact_copies() {
        let out = TempDir::new().unwrap();
        let source = slide(20, 20);

        let result = extract_tiles(&source, &MaskGeometry::default(), out.path(), "s", &options(8))
            .unwrap();

        let tile = image::open(result.dir.join("[x-8,y-8,w-8,h-8].tif"))
            .unwrap()
            .to_rgb8();
        assert_eq!(tile, source.read_region(TileRect::new(8, 8, 8, 8), 1.0).unwrap());
    }

    #[test]
    fn masked_tiles_are_blacked_out() {
        let out = TempDir::new().unwrap();
        let exclusion = MaskGeometry::from_polygons(vec![Polygon::rectangle(0.0, 0.0, 8.0, 8.0)]);
        let opts = ExtractOptions {
            tile_mask: MaskMode::Solid,
            ..options(8)
        };

        let result = extract_tiles(&slide(16, 8), &exclusion, out.path(), "s", &opts).unwrap();

        let masked = image::open(result.dir.join("[x-0,y-0,w-8,h-8].tif"))
            .unwrap()
            .to_rgb8();
        assert!(masked.pixels().all(|p| *p == Rgb([0, 0, 0])));

        let clean = image::open(result.dir.join("[x-8,y-0,w-8,h-8].tif"))
            .unwrap()
            .to_rgb8();
        assert!(clean.pixels().all(|p| *p != Rgb([0, 0, 0])));
    }

    struct FailingSlide;

    impl SlideImage for FailingSlide {
        fn width(&self) -> u32 {
            20
        }
        fn height(&self) -> u32 {
            20
        }
        fn calibration(&self) -> crate::core::slide::PixelCalibration {
            Default::default()
        }
        fn preferred_downsamples(&self) -> Vec<f64> {
            vec![1.0]
        }
        fn read_region(&self, rect: TileRect, _downsample: f64) -> Result<RgbImage, SlideError> {
            if rect.x > 0 {
                return Err(SlideError::ResourceExhausted {
                    width: rect.width,
                    height: rect.height,
                });
            }
            Ok(RgbImage::new(rect.width, rect.height))
        }
    }

    #[test]
    fn failure_removes_the_partial_tile_directory() {
        let out = TempDir::new().unwrap();

        let err = extract_tiles(&FailingSlide, &MaskGeometry::default(), out.path(), "bad", &options(10))
            .unwrap_err();

        assert!(matches!(err, TilingError::Discarded { .. }));
        assert!(!out.path().join("bad").exists());
    }

    #[test]
    fn zero_tile_size_is_rejected() {
        let out = TempDir::new().unwrap();
        let err = extract_tiles(&slide(4, 4), &MaskGeometry::default(), out.path(), "s", &options(0))
            .unwrap_err();
        assert!(matches!(err, TilingError::InvalidTileSize(0)));
    }
}
