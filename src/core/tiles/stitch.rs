//! Reassembling a normalized tile directory into one pyramid.

use super::mosaic::{MosaicTile, SparseMosaic};
use super::naming::{
    is_tile_file, parse_tile_file_name, SlideMetadata, TileIndex, ERROR_FILE_NAME,
    METADATA_FILE_NAME,
};
use crate::core::slide::PyramidWriter;
use crate::core::tiling::TileRect;
use crate::core::workspace::delete_directory;
use crate::error::StitchError;
use rayon::prelude::*;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Suffix appended to the base name of every stitched image
pub const DEFAULT_FINAL_SUFFIX: &str = "_norm.ome";
/// Extension of stitched images
pub const FINAL_EXTENSION: &str = "tiff";

#[derive(Debug, Clone)]
pub struct StitchOptions {
    pub suffix: String,
    /// Remove the tile directory afterwards, on success or failure
    pub delete_on_completion: bool,
    /// Read tiles on the rayon pool
    pub parallel: bool,
    /// Largest region, in pixels, the stitcher may compose at once
    pub max_canvas_pixels: Option<u64>,
}

impl Default for StitchOptions {
    fn default() -> Self {
        Self {
            suffix: DEFAULT_FINAL_SUFFIX.to_string(),
            delete_on_completion: true,
            parallel: true,
            max_canvas_pixels: None,
        }
    }
}

/// Name of the stitched image for a tile directory called `base_name`
pub fn final_file_name(base_name: &str, suffix: &str) -> String {
    format!("{}{}.{}", base_name, suffix, FINAL_EXTENSION)
}

/// Stitch the tiles of `patch_dir` into one pyramid in `output_dir`.
///
/// Returns the path of the written image.
pub fn stitch(
    patch_dir: &Path,
    output_dir: &Path,
    writer: &dyn PyramidWriter,
    options: &StitchOptions,
) -> Result<PathBuf, StitchError> {
    let result = stitch_directory(patch_dir, output_dir, writer, options);

    if options.delete_on_completion && patch_dir.exists() && !delete_directory(patch_dir) {
        warn!(dir = %patch_dir.display(), "Could not fully remove tile directory");
    }

    result
}

fn stitch_directory(
    patch_dir: &Path,
    output_dir: &Path,
    writer: &dyn PyramidWriter,
    options: &StitchOptions,
) -> Result<PathBuf, StitchError> {
    if patch_dir.join(ERROR_FILE_NAME).exists() {
        return Err(StitchError::NotNormalized {
            dir: patch_dir.to_path_buf(),
        });
    }

    let metadata_path = patch_dir.join(METADATA_FILE_NAME);
    if !metadata_path.is_file() {
        return Err(StitchError::MissingMetadata {
            dir: patch_dir.to_path_buf(),
        });
    }

    let base_name = patch_dir
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    info!(base_name = %base_name, "Stitching tiles");

    let text = std::fs::read_to_string(&metadata_path).map_err(|e| StitchError::ReadFailed {
        path: metadata_path.clone(),
        reason: e.to_string(),
    })?;
    let metadata = SlideMetadata::parse(&text, &metadata_path)?;

    let placements = list_tiles(patch_dir)?;
    if placements.is_empty() {
        return Err(StitchError::NoTiles {
            dir: patch_dir.to_path_buf(),
        });
    }

    // Only headers are read here; pixels are decoded while the pyramid is written
    let locate = |(path, x, y): &(PathBuf, u32, u32)| -> Result<MosaicTile, StitchError> {
        let (width, height) =
            image::image_dimensions(path).map_err(|e| StitchError::ReadFailed {
                path: path.clone(),
                reason: e.to_string(),
            })?;
        Ok(MosaicTile {
            path: path.clone(),
            rect: TileRect::new(*x, *y, width, height),
        })
    };
    let tiles: Vec<MosaicTile> = if options.parallel {
        placements.par_iter().map(locate).collect::<Result<_, _>>()?
    } else {
        placements.iter().map(locate).collect::<Result<_, _>>()?
    };

    let mut mosaic = SparseMosaic::new(tiles)?
        .with_calibration(metadata.calibration)
        .with_downsamples(metadata.downsamples.clone())
        .with_parallel_decode(options.parallel);
    if let Some(max) = options.max_canvas_pixels {
        mosaic = mosaic.with_max_pixels(max);
    }

    let output = output_dir.join(final_file_name(&base_name, &options.suffix));
    writer.write(&mosaic, &metadata.downsamples, &metadata.to_line(), &output)?;

    info!(
        base_name = %base_name,
        tiles = mosaic.tile_count(),
        output = %output.display(),
        "Stitched tiles"
    );
    Ok(output)
}

/// Tile files of `dir` with their (x, y) offsets.
///
/// Positions come from the tile index when present, otherwise from the
/// file names.
fn list_tiles(dir: &Path) -> Result<Vec<(PathBuf, u32, u32)>, StitchError> {
    if let Some(index) = TileIndex::read(dir)? {
        return Ok(index
            .tiles
            .into_iter()
            .map(|entry| (dir.join(&entry.file), entry.rect.x, entry.rect.y))
            .collect());
    }

    let entries = std::fs::read_dir(dir).map_err(|e| StitchError::ReadDir {
        path: dir.to_path_buf(),
        source: e,
    })?;

    let mut tiles = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|e| StitchError::ReadDir {
            path: dir.to_path_buf(),
            source: e,
        })?;
        let name = entry.file_name().to_string_lossy().to_string();
        if !is_tile_file(&name) {
            continue;
        }
        let rect = parse_tile_file_name(&name)?;
        tiles.push((entry.path(), rect.x, rect.y));
    }
    tiles.sort_by_key(|(_, x, y)| (*y, *x));
    Ok(tiles)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::slide::{RasterSlide, SlideImage, TiffPyramidWriter};
    use crate::core::tiles::extract::{extract_tiles, ExtractOptions};
    use crate::core::tiles::naming::TILE_INDEX_FILE_NAME;
    use crate::core::tiling::MaskGeometry;
    use image::{Rgb, RgbImage};
    use tempfile::TempDir;

    fn source(width: u32, height: u32) -> RgbImage {
        RgbImage::from_fn(width, height, |x, y| {
            Rgb([(x * 7 % 256) as u8, (y * 3 % 256) as u8, ((x ^ y) % 256) as u8])
        })
    }

    fn keep() -> StitchOptions {
        StitchOptions {
            delete_on_completion: false,
            parallel: false,
            ..StitchOptions::default()
        }
    }

    fn extract(image: RgbImage, tiles_dir: &Path, name: &str, tile_size: u32) -> PathBuf {
        let options = ExtractOptions {
            tile_size,
            ..ExtractOptions::default()
        };
        extract_tiles(
            &RasterSlide::from_image(image),
            &MaskGeometry::default(),
            tiles_dir,
            name,
            &options,
        )
        .unwrap()
        .dir
    }

    #[test]
    fn error_sentinel_blocks_stitching() {
        let temp = TempDir::new().unwrap();
        let patch_dir = temp.path().join("slide");
        std::fs::create_dir(&patch_dir).unwrap();
        std::fs::write(patch_dir.join(ERROR_FILE_NAME), "").unwrap();

        let err = stitch(&patch_dir, temp.path(), &TiffPyramidWriter::default(), &keep())
            .unwrap_err();

        assert!(matches!(err, StitchError::NotNormalized { .. }));
        assert!(!temp.path().join(final_file_name("slide", DEFAULT_FINAL_SUFFIX)).exists());
    }

    #[test]
    fn missing_metadata_is_reported() {
        let temp = TempDir::new().unwrap();
        let patch_dir = temp.path().join("slide");
        std::fs::create_dir(&patch_dir).unwrap();

        let err = stitch(&patch_dir, temp.path(), &TiffPyramidWriter::default(), &keep())
            .unwrap_err();

        assert!(matches!(err, StitchError::MissingMetadata { .. }));
    }

    #[test]
    fn failed_stitch_still_cleans_up_when_requested() {
        let temp = TempDir::new().unwrap();
        let patch_dir = temp.path().join("slide");
        std::fs::create_dir(&patch_dir).unwrap();
        std::fs::write(patch_dir.join(ERROR_FILE_NAME), "").unwrap();

        let options = StitchOptions {
            delete_on_completion: true,
            ..keep()
        };
        let _ = stitch(&patch_dir, temp.path(), &TiffPyramidWriter::default(), &options);

        assert!(!patch_dir.exists());
    }

    #[test]
    fn round_trip_reproduces_the_source() {
        let temp = TempDir::new().unwrap();
        let original = source(37, 23);
        let patch_dir = extract(original.clone(), temp.path(), "case", 10);

        let output = stitch(&patch_dir, temp.path(), &TiffPyramidWriter::default(), &keep())
            .unwrap();

        assert_eq!(output.file_name().unwrap(), "case_norm.ome.tiff");
        let stitched = image::open(&output).unwrap().to_rgb8();
        assert_eq!(stitched, original);
    }

    #[test]
    fn filename_positions_are_used_without_an_index() {
        let temp = TempDir::new().unwrap();
        let original = source(25, 25);
        let patch_dir = extract(original.clone(), temp.path(), "case", 10);
        std::fs::remove_file(patch_dir.join(TILE_INDEX_FILE_NAME)).unwrap();

        let output = stitch(&patch_dir, temp.path(), &TiffPyramidWriter::default(), &keep())
            .unwrap();

        let stitched = RasterSlide::from_image(image::open(&output).unwrap().to_rgb8());
        assert_eq!((stitched.width(), stitched.height()), (25, 25));
    }

    #[test]
    fn bad_tile_name_mentions_long_file_names() {
        let temp = TempDir::new().unwrap();
        let patch_dir = extract(source(10, 10), temp.path(), "case", 10);
        std::fs::remove_file(patch_dir.join(TILE_INDEX_FILE_NAME)).unwrap();
        source(2, 2)
            .save_with_format(patch_dir.join("[x-0,y-0,w-2.tif"), image::ImageFormat::Tiff)
            .unwrap();

        let err = stitch(&patch_dir, temp.path(), &TiffPyramidWriter::default(), &keep())
            .unwrap_err();

        assert!(err.to_string().contains("too long"));
    }
}
