//! SQLite project backend for persistent storage.

use super::{ImageEntry, ImageType, ProjectStore};
use crate::error::ProjectError;
use rusqlite::{params, Connection};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use uuid::Uuid;

/// File name of the project database inside the project directory
pub const PROJECT_DB_NAME: &str = "project.db";

/// SQLite-backed project
///
/// Entry objects, URIs and stains are stored as JSON columns.
pub struct SqliteProject {
    conn: Mutex<Connection>,
    base_dir: PathBuf,
    db_path: PathBuf,
}

impl SqliteProject {
    /// Open or create the project in `dir`
    pub fn open(dir: &Path) -> Result<Self, ProjectError> {
        std::fs::create_dir_all(dir).map_err(|e| ProjectError::OpenFailed {
            path: dir.to_path_buf(),
            reason: e.to_string(),
        })?;

        let db_path = dir.join(PROJECT_DB_NAME);
        let conn = Connection::open(&db_path).map_err(|e| ProjectError::OpenFailed {
            path: db_path.clone(),
            reason: e.to_string(),
        })?;

        conn.execute_batch("PRAGMA journal_mode=WAL;")
            .map_err(|e| ProjectError::QueryFailed(e.to_string()))?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS entries (
                position INTEGER PRIMARY KEY AUTOINCREMENT,
                id TEXT NOT NULL UNIQUE,
                name TEXT NOT NULL,
                uris TEXT NOT NULL,
                image_type TEXT NOT NULL,
                stains TEXT,
                objects TEXT NOT NULL
            )",
            [],
        )
        .map_err(|e| ProjectError::QueryFailed(e.to_string()))?;

        Ok(Self {
            conn: Mutex::new(conn),
            base_dir: dir.to_path_buf(),
            db_path,
        })
    }

    /// Open the project in `dir`, failing if it holds no project database
    pub fn open_existing(dir: &Path) -> Result<Self, ProjectError> {
        if !dir.join(PROJECT_DB_NAME).is_file() {
            return Err(ProjectError::OpenFailed {
                path: dir.to_path_buf(),
                reason: format!("no {} found", PROJECT_DB_NAME),
            });
        }
        Self::open(dir)
    }

    fn to_json<T: serde::Serialize>(value: &T) -> Result<String, ProjectError> {
        serde_json::to_string(value).map_err(|e| ProjectError::SerializationFailed(e.to_string()))
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>, ProjectError> {
        self.conn.lock().map_err(|_| ProjectError::Corrupted {
            path: self.db_path.clone(),
        })
    }
}

/// Raw column values of one row, decoded outside the rusqlite closure
struct EntryRow {
    id: String,
    name: String,
    uris: String,
    image_type: String,
    stains: Option<String>,
    objects: String,
}

impl EntryRow {
    fn decode(self) -> Result<ImageEntry, ProjectError> {
        let bad = |e: &dyn std::fmt::Display| ProjectError::SerializationFailed(e.to_string());
        Ok(ImageEntry {
            id: Uuid::parse_str(&self.id).map_err(|e| bad(&e))?,
            name: self.name,
            uris: serde_json::from_str(&self.uris).map_err(|e| bad(&e))?,
            image_type: ImageType::parse(&self.image_type),
            stains: match self.stains {
                Some(json) => Some(serde_json::from_str(&json).map_err(|e| bad(&e))?),
                None => None,
            },
            objects: serde_json::from_str(&self.objects).map_err(|e| bad(&e))?,
        })
    }
}

impl ProjectStore for SqliteProject {
    fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    fn entries(&self) -> Result<Vec<ImageEntry>, ProjectError> {
        let conn = self.lock()?;

        let mut stmt = conn
            .prepare(
                "SELECT id, name, uris, image_type, stains, objects
                 FROM entries ORDER BY position",
            )
            .map_err(|e| ProjectError::QueryFailed(e.to_string()))?;

        let rows: Vec<EntryRow> = stmt
            .query_map([], |row| {
                Ok(EntryRow {
                    id: row.get(0)?,
                    name: row.get(1)?,
                    uris: row.get(2)?,
                    image_type: row.get(3)?,
                    stains: row.get(4)?,
                    objects: row.get(5)?,
                })
            })
            .map_err(|e| ProjectError::QueryFailed(e.to_string()))?
            .collect::<Result<_, _>>()
            .map_err(|e| ProjectError::QueryFailed(e.to_string()))?;

        rows.into_iter().map(EntryRow::decode).collect()
    }

    fn add_entry(&self, entry: &ImageEntry) -> Result<(), ProjectError> {
        let uris = Self::to_json(&entry.uris)?;
        let stains = entry.stains.as_ref().map(Self::to_json).transpose()?;
        let objects = Self::to_json(&entry.objects)?;

        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO entries (id, name, uris, image_type, stains, objects)
             VALUES (?, ?, ?, ?, ?, ?)",
            params![
                entry.id.to_string(),
                entry.name,
                uris,
                entry.image_type.as_str(),
                stains,
                objects,
            ],
        )
        .map_err(|e| ProjectError::QueryFailed(e.to_string()))?;

        Ok(())
    }

    fn save_entry(&self, entry: &ImageEntry) -> Result<(), ProjectError> {
        let uris = Self::to_json(&entry.uris)?;
        let stains = entry.stains.as_ref().map(Self::to_json).transpose()?;
        let objects = Self::to_json(&entry.objects)?;

        let conn = self.lock()?;
        let changed = conn
            .execute(
                "UPDATE entries SET name = ?, uris = ?, image_type = ?, stains = ?, objects = ?
                 WHERE id = ?",
                params![
                    entry.name,
                    uris,
                    entry.image_type.as_str(),
                    stains,
                    objects,
                    entry.id.to_string(),
                ],
            )
            .map_err(|e| ProjectError::QueryFailed(e.to_string()))?;

        if changed == 0 {
            return Err(ProjectError::EntryNotFound {
                id: entry.id.to_string(),
            });
        }
        Ok(())
    }

    fn len(&self) -> Result<usize, ProjectError> {
        let conn = self.lock()?;
        conn.query_row("SELECT COUNT(*) FROM entries", [], |row| {
            row.get::<_, i64>(0).map(|v| v as usize)
        })
        .map_err(|e| ProjectError::QueryFailed(e.to_string()))
    }
}
