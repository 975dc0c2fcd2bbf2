//! Selecting the project entries a run will normalize.

use crate::core::project::{ImageEntry, ImageType, PathObject};
use crate::core::tiling::IGNORE_CLASS;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tracing::warn;
use uuid::Uuid;

/// An accepted project entry, ready for tiling
#[derive(Debug, Clone, PartialEq)]
pub struct SourceImageRecord {
    pub entry_id: Uuid,
    pub entry_name: String,
    /// The single backing file
    pub path: PathBuf,
    /// Annotations with every detection below them removed
    pub annotations: Vec<PathObject>,
    /// Whether any annotation is an exclusion region
    pub has_exclusion: bool,
    /// `_N` for entries with exclusion regions, empty otherwise
    pub group_suffix: String,
    /// Name of the tile directory and of the stitched image
    pub base_name: String,
}

impl SourceImageRecord {
    /// Entries sharing this key and lacking exclusions share one tiling pass
    pub fn dedup_key(&self) -> &Path {
        &self.path
    }
}

/// Outcome of enumerating a project
#[derive(Debug, Clone, Default)]
pub struct Enumeration {
    pub records: Vec<SourceImageRecord>,
    /// Entries left out (bad backing file or unsupported image type)
    pub skipped: usize,
}

fn has_ignore_annotation(objects: &[PathObject]) -> bool {
    objects.iter().any(|object| {
        object.is_annotation()
            && (object.class_label.as_deref() == Some(IGNORE_CLASS)
                || has_ignore_annotation(&object.children))
    })
}

/// File name up to its last `.`
fn file_stem(path: &Path) -> String {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    match name.rfind('.') {
        Some(dot) => name[..dot].to_string(),
        None => name,
    }
}

/// Turn project entries into source records.
///
/// Entries are skipped, with a warning, when they do not have exactly one
/// existing backing file or are not Brightfield H&E. Group suffixes count
/// up from 1 over the entries carrying exclusion regions.
pub fn enumerate_entries(entries: &[ImageEntry]) -> Enumeration {
    let mut enumeration = Enumeration::default();
    let mut exclusion_groups = 0;

    for entry in entries {
        let path = match entry.uris.as_slice() {
            [path] if path.is_file() => path.clone(),
            _ => {
                warn!(entry = %entry, "Skipped because its backing file is missing or ambiguous");
                enumeration.skipped += 1;
                continue;
            }
        };

        if entry.image_type != ImageType::BrightfieldHE {
            warn!(entry = %entry, "Skipped because image type is not set to Brightfield H&E");
            enumeration.skipped += 1;
            continue;
        }

        let annotations: Vec<PathObject> = entry
            .annotations()
            .into_iter()
            .map(PathObject::without_detections)
            .collect();
        let has_exclusion = has_ignore_annotation(&annotations);
        let group_suffix = if has_exclusion {
            exclusion_groups += 1;
            format!("_{}", exclusion_groups)
        } else {
            String::new()
        };
        let base_name = format!("{}{}", file_stem(&path), group_suffix);

        enumeration.records.push(SourceImageRecord {
            entry_id: entry.id,
            entry_name: entry.name.clone(),
            path,
            annotations,
            has_exclusion,
            group_suffix,
            base_name,
        });
    }

    enumeration
}

/// Records needing their own tiling pass.
///
/// Records with exclusions always get one. Of the records without
/// exclusions only the first per backing file does.
pub fn tiling_passes(records: &[SourceImageRecord]) -> Vec<&SourceImageRecord> {
    let mut seen: HashSet<&Path> = HashSet::new();
    records
        .iter()
        .filter(|record| record.has_exclusion || seen.insert(record.dedup_key()))
        .collect()
}
