//! Rasterizing exclusion masks onto extracted regions.

use super::geometry::MaskGeometry;
use super::watermark::Watermark;
use super::TileRect;
use image::{Rgb, RgbImage};

const MASK_COLOR: Rgb<u8> = Rgb([0, 0, 0]);

/// How the excluded area is painted
#[derive(Debug, Clone, PartialEq)]
pub enum MaskMode {
    /// Flat black fill
    Solid,
    /// Black fill leaving every even-row, even-column pixel untouched. Slow.
    Hatched,
    /// Black fill with a tiled watermark glyph cut out of it
    Watermarked(Watermark),
}

/// Black out `mask` on `image`, a read of `main` at `downsample`.
///
/// Pixels are sampled at their centers in full-resolution coordinates. When
/// the mask does not overlap `main` the image is returned unchanged.
pub fn mask_region(
    mut image: RgbImage,
    main: TileRect,
    mask: &MaskGeometry,
    downsample: f64,
    mode: &MaskMode,
) -> RgbImage {
    let Some(mask_bounds) = mask.bounds() else {
        return image;
    };
    let overlap = mask_bounds.intersection(&main.bounds());
    if overlap.area() <= 0.0 || downsample <= 0.0 {
        return image;
    }

    let watermark_origin = match mode {
        MaskMode::Watermarked(watermark) => Some(watermark.grid_origin(&mask_bounds)),
        _ => None,
    };

    // Only visit the pixels whose centers can fall inside the overlap
    let to_pixel = |world: f64, start: u32| (world - start as f64) / downsample;
    let px_start = to_pixel(overlap.min_x, main.x).floor().max(0.0) as u32;
    let py_start = to_pixel(overlap.min_y, main.y).floor().max(0.0) as u32;
    let px_end = (to_pixel(overlap.max_x, main.x).ceil() as u32).min(image.width());
    let py_end = (to_pixel(overlap.max_y, main.y).ceil() as u32).min(image.height());

    for py in py_start..py_end {
        let world_y = main.y as f64 + (py as f64 + 0.5) * downsample;
        for px in px_start..px_end {
            let world_x = main.x as f64 + (px as f64 + 0.5) * downsample;
            if !mask.contains(world_x, world_y) {
                continue;
            }

            let paint = match (mode, watermark_origin) {
                (MaskMode::Solid, _) => true,
                (MaskMode::Hatched, _) => !(px % 2 == 0 && py % 2 == 0),
                (MaskMode::Watermarked(watermark), Some(origin)) => {
                    !watermark.covers(origin, world_x, world_y)
                }
                (MaskMode::Watermarked(_), None) => true,
            };

            if paint {
                image.put_pixel(px, py, MASK_COLOR);
            }
        }
    }

    image
}
