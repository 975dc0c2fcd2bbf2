//! Sparse mosaic of independently stored tiles.
//!
//! Tiles stay on disk until a read touches them. The most recently decoded
//! tiles are cached, one row of tiles' worth, which is what a reader
//! sweeping the mosaic in horizontal strips keeps coming back to.

use crate::core::slide::{scaled_dimensions, FastResizer, PixelCalibration, SlideImage};
use crate::core::tiling::TileRect;
use crate::error::{SlideError, StitchError};
use image::{imageops, Rgb, RgbImage};
use rayon::prelude::*;
use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};

/// Colour of mosaic pixels no tile covers
const BACKGROUND: Rgb<u8> = Rgb([255, 255, 255]);

/// A tile file placed at its offset in the mosaic
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MosaicTile {
    pub path: PathBuf,
    /// Offset and the size of the pixel data in the file
    pub rect: TileRect,
}

/// Least recently used decoded tiles, keyed by tile index
struct TileCache {
    capacity: usize,
    entries: VecDeque<(usize, Arc<RgbImage>)>,
}

impl TileCache {
    fn get(&mut self, index: usize) -> Option<Arc<RgbImage>> {
        let position = self.entries.iter().position(|(i, _)| *i == index)?;
        let entry = self.entries.remove(position)?;
        let pixels = Arc::clone(&entry.1);
        self.entries.push_back(entry);
        Some(pixels)
    }

    fn insert(&mut self, index: usize, pixels: Arc<RgbImage>) {
        while self.entries.len() >= self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back((index, pixels));
    }
}

/// Tiles registered at their offsets, readable as one slide.
///
/// The mosaic extent is the bounding box of all tiles.
pub struct SparseMosaic {
    tiles: Vec<MosaicTile>,
    width: u32,
    height: u32,
    calibration: PixelCalibration,
    downsamples: Vec<f64>,
    max_pixels: Option<u64>,
    parallel: bool,
    cache: Mutex<TileCache>,
}

impl SparseMosaic {
    /// Fails when a tile reaches past the largest representable offset.
    pub fn new(tiles: Vec<MosaicTile>) -> Result<Self, StitchError> {
        let mut width = 0u32;
        let mut height = 0u32;
        for tile in &tiles {
            let TileRect {
                x,
                y,
                width: w,
                height: h,
            } = tile.rect;
            let (Some(right), Some(bottom)) = (x.checked_add(w), y.checked_add(h)) else {
                return Err(StitchError::BadTileName {
                    file: tile
                        .path
                        .file_name()
                        .map(|n| n.to_string_lossy().to_string())
                        .unwrap_or_default(),
                    reason: format!("a {}x{} tile at {},{} overflows the image extent", w, h, x, y),
                });
            };
            width = width.max(right);
            height = height.max(bottom);
        }

        let mut per_row: HashMap<u32, usize> = HashMap::new();
        for tile in &tiles {
            *per_row.entry(tile.rect.y).or_default() += 1;
        }
        let capacity = per_row.values().copied().max().unwrap_or(0).max(1);

        Ok(Self {
            tiles,
            width,
            height,
            calibration: PixelCalibration::default(),
            downsamples: vec![1.0],
            max_pixels: None,
            parallel: false,
            cache: Mutex::new(TileCache {
                capacity,
                entries: VecDeque::with_capacity(capacity),
            }),
        })
    }

    pub fn with_calibration(mut self, calibration: PixelCalibration) -> Self {
        self.calibration = calibration;
        self
    }

    /// Seed the pyramid levels
    pub fn with_downsamples(mut self, downsamples: Vec<f64>) -> Self {
        if !downsamples.is_empty() {
            self.downsamples = downsamples;
        }
        self
    }

    /// Refuse reads composing more than `max_pixels`
    pub fn with_max_pixels(mut self, max_pixels: u64) -> Self {
        self.max_pixels = Some(max_pixels);
        self
    }

    /// Decode the tiles of one read on the rayon pool
    pub fn with_parallel_decode(mut self, parallel: bool) -> Self {
        self.parallel = parallel;
        self
    }

    pub fn tile_count(&self) -> usize {
        self.tiles.len()
    }

    fn cache(&self) -> MutexGuard<'_, TileCache> {
        self.cache.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn load(&self, index: usize) -> Result<Arc<RgbImage>, SlideError> {
        let tile = &self.tiles[index];
        let open_failed = |reason: String| SlideError::OpenFailed {
            path: tile.path.clone(),
            reason,
        };

        let pixels = image::open(&tile.path)
            .map_err(|e| open_failed(e.to_string()))?
            .to_rgb8();
        if pixels.dimensions() != (tile.rect.width, tile.rect.height) {
            return Err(open_failed(format!(
                "tile is {}x{}, expected {}x{}",
                pixels.width(),
                pixels.height(),
                tile.rect.width,
                tile.rect.height
            )));
        }
        Ok(Arc::new(pixels))
    }

    /// Pixels of the tiles at `indices`, in the same order
    fn decode(&self, indices: &[usize]) -> Result<Vec<Arc<RgbImage>>, SlideError> {
        let mut found: Vec<Option<Arc<RgbImage>>> = {
            let mut cache = self.cache();
            indices.iter().map(|&i| cache.get(i)).collect()
        };
        let missing: Vec<usize> = indices
            .iter()
            .zip(&found)
            .filter(|(_, hit)| hit.is_none())
            .map(|(&i, _)| i)
            .collect();

        let loaded: Vec<Arc<RgbImage>> = if self.parallel && missing.len() > 1 {
            missing
                .par_iter()
                .map(|&i| self.load(i))
                .collect::<Result<_, _>>()?
        } else {
            missing
                .iter()
                .map(|&i| self.load(i))
                .collect::<Result<_, _>>()?
        };

        {
            let mut cache = self.cache();
            for (&index, pixels) in missing.iter().zip(&loaded) {
                cache.insert(index, Arc::clone(pixels));
            }
        }

        let mut loaded = loaded.into_iter();
        for slot in found.iter_mut().filter(|slot| slot.is_none()) {
            *slot = loaded.next();
        }
        Ok(found.into_iter().flatten().collect())
    }
}

fn overlaps(a: TileRect, b: TileRect) -> bool {
    a.x < b.right() && b.x < a.right() && a.y < b.bottom() && b.y < a.bottom()
}

impl SlideImage for SparseMosaic {
    fn width(&self) -> u32 {
        self.width
    }

    fn height(&self) -> u32 {
        self.height
    }

    fn calibration(&self) -> PixelCalibration {
        self.calibration
    }

    fn preferred_downsamples(&self) -> Vec<f64> {
        self.downsamples.clone()
    }

    fn read_region(&self, rect: TileRect, downsample: f64) -> Result<RgbImage, SlideError> {
        crate::core::slide::validate_request(rect, downsample, self.width, self.height)?;
        if let Some(max) = self.max_pixels {
            if rect.area() > max {
                return Err(SlideError::ResourceExhausted {
                    width: rect.width,
                    height: rect.height,
                });
            }
        }

        let touched: Vec<usize> = self
            .tiles
            .iter()
            .enumerate()
            .filter(|(_, tile)| overlaps(tile.rect, rect))
            .map(|(i, _)| i)
            .collect();
        let pixels = self.decode(&touched)?;

        let mut canvas = RgbImage::from_pixel(rect.width, rect.height, BACKGROUND);
        for (&index, tile_pixels) in touched.iter().zip(&pixels) {
            let tile = &self.tiles[index];
            imageops::replace(
                &mut canvas,
                tile_pixels.as_ref(),
                tile.rect.x as i64 - rect.x as i64,
                tile.rect.y as i64 - rect.y as i64,
            );
        }

        if downsample == 1.0 {
            return Ok(canvas);
        }
        let (width, height) = scaled_dimensions(rect.width, rect.height, downsample);
        FastResizer::new().resize_rgb(&canvas, width, height)
    }
}
