//! On-disk names and formats of a tile directory.
//!
//! A tile directory holds one file per tile, named after its rectangle,
//! plus a reference thumbnail, the metadata sidecar and a JSON index of
//! every tile written.

use crate::core::slide::PixelCalibration;
use crate::core::tiling::TileRect;
use crate::error::StitchError;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::LazyLock;
use tracing::error;

/// Downsampled thumbnail used by the worker to estimate stain vectors
pub const REFERENCE_FILE_NAME: &str = "reference.tif";
/// Pixel calibration and pyramid levels of the source image
pub const METADATA_FILE_NAME: &str = "metadata.txt";
/// Written by the worker into directories it failed to normalize
pub const ERROR_FILE_NAME: &str = "ERROR.txt";
/// Structured list of every tile written into the directory
pub const TILE_INDEX_FILE_NAME: &str = "tiles.json";

const TILE_EXTENSION: &str = "tif";

static TILE_NAME_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\[x-(\d+),y-(\d+),w-(\d+),h-(\d+)\]\.tiff?$").expect("valid tile name regex")
});

/// `[x-<x>,y-<y>,w-<w>,h-<h>].tif`
pub fn tile_file_name(rect: &TileRect) -> String {
    format!(
        "[x-{},y-{},w-{},h-{}].{}",
        rect.x, rect.y, rect.width, rect.height, TILE_EXTENSION
    )
}

/// True for `.tif`/`.tiff` files other than the reference thumbnail
pub fn is_tile_file(file_name: &str) -> bool {
    let lower = file_name.to_ascii_lowercase();
    (lower.ends_with(".tif") || lower.ends_with(".tiff"))
        && lower != "reference.tif"
        && lower != "reference.tiff"
}

/// Decode the rectangle from a tile file name
pub fn parse_tile_file_name(file_name: &str) -> Result<TileRect, StitchError> {
    let bad = |reason: String| StitchError::BadTileName {
        file: file_name.to_string(),
        reason,
    };

    let caps = TILE_NAME_RE
        .captures(file_name)
        .ok_or_else(|| bad("expected [x-<int>,y-<int>,w-<int>,h-<int>].tif".to_string()))?;

    let field = |i: usize| -> Result<u32, StitchError> {
        caps[i]
            .parse::<u32>()
            .map_err(|e| bad(format!("{}: {}", &caps[i], e)))
    };

    let rect = TileRect::new(field(1)?, field(2)?, field(3)?, field(4)?);
    if rect.x.checked_add(rect.width).is_none() || rect.y.checked_add(rect.height).is_none() {
        return Err(bad("tile reaches past the largest supported offset".to_string()));
    }
    Ok(rect)
}

/// One line of `tiles.json`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TileIndexEntry {
    pub file: String,
    pub rect: TileRect,
}

/// Companion index of a tile directory
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TileIndex {
    pub tiles: Vec<TileIndexEntry>,
}

impl TileIndex {
    pub fn from_rects(rects: &[TileRect]) -> Self {
        Self {
            tiles: rects
                .iter()
                .map(|rect| TileIndexEntry {
                    file: tile_file_name(rect),
                    rect: *rect,
                })
                .collect(),
        }
    }

    pub fn write(&self, dir: &Path) -> std::io::Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(dir.join(TILE_INDEX_FILE_NAME), json)
    }

    /// Read the index of `dir`; `Ok(None)` if the directory has none
    pub fn read(dir: &Path) -> Result<Option<Self>, StitchError> {
        let path = dir.join(TILE_INDEX_FILE_NAME);
        if !path.is_file() {
            return Ok(None);
        }
        let text = std::fs::read_to_string(&path).map_err(|e| StitchError::ReadFailed {
            path: path.clone(),
            reason: e.to_string(),
        })?;
        serde_json::from_str(&text)
            .map(Some)
            .map_err(|e| StitchError::ReadFailed {
                path,
                reason: e.to_string(),
            })
    }
}

/// Contents of the metadata sidecar
#[derive(Debug, Clone, PartialEq)]
pub struct SlideMetadata {
    pub calibration: PixelCalibration,
    pub downsamples: Vec<f64>,
}

static PIXEL_HEIGHT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"pH-([\d.]+)").expect("valid pH regex"));
static PIXEL_WIDTH_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"pW-([\d.]+)").expect("valid pW regex"));
static Z_SPACING_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"zSp-([\d.]+)").expect("valid zSp regex"));
static DOWNSAMPLES_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"dsp-\[(.*?)\]").expect("valid dsp regex"));

/// Plain decimal notation with at least one fractional digit
fn decimal(value: f64) -> String {
    let text = value.to_string();
    if value.is_finite() && !text.contains('.') {
        format!("{}.0", text)
    } else {
        text
    }
}

impl SlideMetadata {
    /// `[pH-<f>,pW-<f>,zSp-<f>,dsp-[<f>, <f>, ...]]`
    ///
    /// Values never use exponent notation, which the parser does not read.
    pub fn to_line(&self) -> String {
        let downsamples: Vec<String> = self.downsamples.iter().map(|&d| decimal(d)).collect();
        format!(
            "[pH-{},pW-{},zSp-{},dsp-[{}]]",
            decimal(self.calibration.pixel_height),
            decimal(self.calibration.pixel_width),
            decimal(self.calibration.z_spacing),
            downsamples.join(", ")
        )
    }

    /// Parse a sidecar line.
    ///
    /// The three calibration values are required. A missing downsample list
    /// means `[1.0]`; an unparseable downsample value is logged and read as 1.0.
    pub fn parse(text: &str, path: &Path) -> Result<Self, StitchError> {
        let value = |re: &Regex, key: &str| -> Result<f64, StitchError> {
            let bad = |reason: String| StitchError::BadMetadata {
                path: path.to_path_buf(),
                reason,
            };
            let caps = re
                .captures(text)
                .ok_or_else(|| bad(format!("{} not found", key)))?;
            caps[1]
                .parse::<f64>()
                .map_err(|e| bad(format!("{} = {}: {}", key, &caps[1], e)))
        };

        let calibration = PixelCalibration {
            pixel_height: value(&PIXEL_HEIGHT_RE, "pH")?,
            pixel_width: value(&PIXEL_WIDTH_RE, "pW")?,
            z_spacing: value(&Z_SPACING_RE, "zSp")?,
        };

        let downsamples = match DOWNSAMPLES_RE.captures(text) {
            None => vec![1.0],
            Some(caps) => caps[1]
                .split(',')
                .map(|raw| {
                    raw.trim().parse::<f64>().unwrap_or_else(|_| {
                        error!(value = raw, path = %path.display(), "Failed to parse downsample value");
                        1.0
                    })
                })
                .collect(),
        };

        Ok(Self {
            calibration,
            downsamples,
        })
    }

    pub fn write(&self, dir: &Path) -> std::io::Result<()> {
        std::fs::write(dir.join(METADATA_FILE_NAME), self.to_line())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn sidecar() -> PathBuf {
        PathBuf::from("/tiles/slide/metadata.txt")
    }

    #[test]
    fn tile_names_encode_the_rectangle() {
        let rect = TileRect::new(10000, 5000, 2000, 3000);
        let name = tile_file_name(&rect);

        assert_eq!(name, "[x-10000,y-5000,w-2000,h-3000].tif");
        assert_eq!(parse_tile_file_name(&name).unwrap(), rect);
    }

    #[test]
    fn offsets_overflowing_the_extent_are_rejected() {
        let err = parse_tile_file_name("[x-4294967295,y-0,w-8,h-8].tif").unwrap_err();
        assert!(matches!(err, StitchError::BadTileName { .. }));
        let err = parse_tile_file_name("[x-0,y-4294967290,w-8,h-8].tif").unwrap_err();
        assert!(matches!(err, StitchError::BadTileName { .. }));
    }

    #[test]
    fn tiff_extension_is_accepted() {
        let rect = parse_tile_file_name("[x-1,y-2,w-3,h-4].tiff").unwrap();
        assert_eq!(rect, TileRect::new(1, 2, 3, 4));
    }

    #[test]
    fn truncated_names_fail_with_length_hint() {
        let err = parse_tile_file_name("[x-10000,y-5000,w-20").unwrap_err();
        assert!(matches!(err, StitchError::BadTileName { .. }));
        assert!(err.to_string().contains("too long"));
    }

    #[test]
    fn reference_thumbnail_is_not_a_tile() {
        assert!(is_tile_file("[x-0,y-0,w-1,h-1].tif"));
        assert!(!is_tile_file("reference.tif"));
        assert!(!is_tile_file("reference.tiff"));
        assert!(!is_tile_file("metadata.txt"));
    }

    #[test]
    fn metadata_line_matches_sidecar_format() {
        let meta = SlideMetadata {
            calibration: PixelCalibration {
                pixel_width: 0.25,
                pixel_height: 0.5,
                z_spacing: 1.0,
            },
            downsamples: vec![1.0, 4.0, 16.0],
        };

        let line = meta.to_line();
        assert_eq!(line, "[pH-0.5,pW-0.25,zSp-1.0,dsp-[1.0, 4.0, 16.0]]");
        assert_eq!(SlideMetadata::parse(&line, &sidecar()).unwrap(), meta);
    }

    #[test]
    fn tiny_and_huge_calibrations_survive_the_sidecar() {
        let meta = SlideMetadata {
            calibration: PixelCalibration {
                pixel_width: 1e-6,
                pixel_height: 2.5e-7,
                z_spacing: 1e21,
            },
            downsamples: vec![1.0, 1e20],
        };

        let line = meta.to_line();

        assert!(!line.contains('e'), "exponent in {}", line);
        assert_eq!(SlideMetadata::parse(&line, &sidecar()).unwrap(), meta);
    }

    #[test]
    fn missing_downsamples_default_to_full_resolution() {
        let meta = SlideMetadata::parse("[pH-0.5,pW-0.5,zSp-1.0]", &sidecar()).unwrap();
        assert_eq!(meta.downsamples, vec![1.0]);
    }

    #[test]
    fn bad_downsample_value_reads_as_one() {
        let meta =
            SlideMetadata::parse("[pH-0.5,pW-0.5,zSp-1.0,dsp-[4.0, abc, 16.0]]", &sidecar())
                .unwrap();
        assert_eq!(meta.downsamples, vec![4.0, 1.0, 16.0]);
    }

    #[test]
    fn missing_calibration_is_an_error() {
        let err = SlideMetadata::parse("[pW-0.5,zSp-1.0]", &sidecar()).unwrap_err();
        assert!(matches!(err, StitchError::BadMetadata { .. }));
    }

    #[test]
    fn tile_index_round_trips_through_disk() {
        let dir = tempfile::TempDir::new().unwrap();
        let index = TileIndex::from_rects(&[TileRect::new(0, 0, 5, 5), TileRect::new(5, 0, 3, 5)]);

        index.write(dir.path()).unwrap();

        assert_eq!(TileIndex::read(dir.path()).unwrap(), Some(index));
        assert_eq!(TileIndex::read(&dir.path().join("missing")).unwrap(), None);
    }
}
