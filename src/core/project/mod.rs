//! # Project Module
//!
//! A keyed store of image entries and their object hierarchies.
//!
//! The pipeline reads the source project, and writes the normalized
//! images into a fresh project. Two backends are provided:
//! - `SqliteProject` - persistent, one `project.db` per project directory
//! - `InMemoryProject` - for tests

mod memory;
mod sqlite;
mod traits;

pub use memory::InMemoryProject;
pub use sqlite::{SqliteProject, PROJECT_DB_NAME};
pub use traits::ProjectStore;

use crate::core::tiling::Polygon;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use uuid::Uuid;

/// Kind of object in an entry's hierarchy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ObjectKind {
    /// Operator-drawn region
    Annotation,
    /// Machine-generated object (cells, tiles); never migrated
    Detection,
}

/// An object in an entry's hierarchy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PathObject {
    pub kind: ObjectKind,
    #[serde(default)]
    pub class_label: Option<String>,
    pub roi: Polygon,
    #[serde(default)]
    pub children: Vec<PathObject>,
}

impl PathObject {
    /// Annotation without children
    pub fn annotation(class_label: Option<&str>, roi: Polygon) -> Self {
        Self {
            kind: ObjectKind::Annotation,
            class_label: class_label.map(str::to_string),
            roi,
            children: Vec::new(),
        }
    }

    pub fn is_annotation(&self) -> bool {
        self.kind == ObjectKind::Annotation
    }

    /// Copy of this object with every detection below it removed
    pub fn without_detections(&self) -> PathObject {
        PathObject {
            children: self
                .children
                .iter()
                .filter(|child| child.is_annotation())
                .map(PathObject::without_detections)
                .collect(),
            ..self.clone()
        }
    }
}

/// How an image should be interpreted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ImageType {
    /// Brightfield, hematoxylin and eosin
    #[serde(rename = "brightfield_he")]
    BrightfieldHE,
    /// Brightfield with other stains
    BrightfieldOther,
    Fluorescence,
    #[default]
    Unset,
}

impl ImageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ImageType::BrightfieldHE => "brightfield_he",
            ImageType::BrightfieldOther => "brightfield_other",
            ImageType::Fluorescence => "fluorescence",
            ImageType::Unset => "unset",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "brightfield_he" => ImageType::BrightfieldHE,
            "brightfield_other" => ImageType::BrightfieldOther,
            "fluorescence" => ImageType::Fluorescence,
            _ => ImageType::Unset,
        }
    }
}

/// One stain's optical density vector
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StainVector {
    pub name: String,
    pub rgb: [f64; 3],
}

/// Colour deconvolution stains for brightfield images
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StainVectors {
    pub name: String,
    pub stain1: StainVector,
    pub stain2: StainVector,
    pub background: [f64; 3],
}

impl StainVectors {
    /// The H&E reference the normalizer maps every slide onto
    pub fn normalized() -> Self {
        Self {
            name: "Normalized".to_string(),
            stain1: StainVector {
                name: "Hematoxylin".to_string(),
                rgb: [0.651, 0.701, 0.29],
            },
            stain2: StainVector {
                name: "Eosin".to_string(),
                rgb: [0.216, 0.801, 0.558],
            },
            background: [255.0, 255.0, 255.0],
        }
    }
}

/// An image registered in a project
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageEntry {
    pub id: Uuid,
    pub name: String,
    /// Backing files; a usable entry has exactly one
    pub uris: Vec<PathBuf>,
    pub image_type: ImageType,
    pub stains: Option<StainVectors>,
    pub objects: Vec<PathObject>,
}

impl ImageEntry {
    /// New entry backed by a single file, named after it
    pub fn new(path: PathBuf) -> Self {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        Self {
            id: Uuid::new_v4(),
            name,
            uris: vec![path],
            image_type: ImageType::Unset,
            stains: None,
            objects: Vec::new(),
        }
    }

    /// Top-level annotations, excluding detections
    pub fn annotations(&self) -> Vec<&PathObject> {
        self.objects.iter().filter(|o| o.is_annotation()).collect()
    }
}

impl std::fmt::Display for ImageEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn square(x: f64) -> Polygon {
        Polygon::rectangle(x, x, 1.0, 1.0)
    }

    #[test]
    fn without_detections_strips_nested_detections() {
        let mut root = PathObject::annotation(Some("Tumor"), square(0.0));
        let mut child = PathObject::annotation(None, square(1.0));
        child.children.push(PathObject {
            kind: ObjectKind::Detection,
            ..PathObject::annotation(None, square(2.0))
        });
        root.children.push(child);
        root.children.push(PathObject {
            kind: ObjectKind::Detection,
            ..PathObject::annotation(None, square(3.0))
        });

        let stripped = root.without_detections();

        assert_eq!(stripped.children.len(), 1);
        assert!(stripped.children[0].children.is_empty());
        assert_eq!(stripped.class_label.as_deref(), Some("Tumor"));
    }

    #[test]
    fn image_type_round_trips_through_strings() {
        for kind in [
            ImageType::BrightfieldHE,
            ImageType::BrightfieldOther,
            ImageType::Fluorescence,
            ImageType::Unset,
        ] {
            assert_eq!(ImageType::parse(kind.as_str()), kind);
        }
    }

    #[test]
    fn entry_is_named_after_its_file() {
        let entry = ImageEntry::new(PathBuf::from("/slides/case 12.svs"));
        assert_eq!(entry.name, "case 12.svs");
        assert_eq!(entry.uris.len(), 1);
    }

    #[test]
    fn path_objects_deserialize_without_optional_fields() {
        let json = r#"{"kind":"annotation","roi":{"points":[[0,0],[4,0],[4,4]]}}"#;
        let object: PathObject = serde_json::from_str(json).unwrap();
        assert!(object.class_label.is_none());
        assert!(object.children.is_empty());
    }
}
