use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::config;
use crate::error::PersistenceError;
use crate::filters::FilterSpec;

/// A persisted favorite: the path plus a snapshot of its file-list columns.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FavoriteRecord {
    pub path: String,
    /// Absent for directories
    #[serde(default)]
    pub size: Option<u64>,
    /// Unix seconds
    #[serde(default)]
    pub date_modified: Option<i64>,
    #[serde(default)]
    pub date_created: Option<i64>,
}

impl FavoriteRecord {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            size: None,
            date_modified: None,
            date_created: None,
        }
    }
}

pub trait FavoritesStore: Send + Sync {
    fn load_favorites(&self) -> Result<Vec<FavoriteRecord>, PersistenceError>;
    fn save_favorites(&self, records: &[FavoriteRecord]) -> Result<(), PersistenceError>;
}

pub trait FilterStore: Send + Sync {
    fn load_filters(&self) -> Result<Vec<FilterSpec>, PersistenceError>;
    fn save_filters(&self, filters: &[FilterSpec]) -> Result<(), PersistenceError>;
}

/// Stores favorites and user filters as JSON files.
pub struct JsonFileStore {
    favorites_path: PathBuf,
    filters_path: PathBuf,
    io_lock: Mutex<()>,
}

impl JsonFileStore {
    pub fn new(favorites_path: PathBuf, filters_path: PathBuf) -> Self {
        Self {
            favorites_path,
            filters_path,
            io_lock: Mutex::new(()),
        }
    }

    pub fn in_data_dir() -> Self {
        Self::new(config::favorites_path(), config::filters_path())
    }

    fn read<T: DeserializeOwned>(&self, path: &Path) -> Result<Vec<T>, PersistenceError> {
        let _guard = self.io_lock.lock().unwrap_or_else(|p| p.into_inner());
        let data = match std::fs::read_to_string(path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => {
                return Err(PersistenceError::Io {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };
        serde_json::from_str(&data).map_err(|source| PersistenceError::Format {
            path: path.to_path_buf(),
            source,
        })
    }

    fn write<T: Serialize>(&self, path: &Path, items: &[T]) -> Result<(), PersistenceError> {
        let data = serde_json::to_string_pretty(items).map_err(|source| PersistenceError::Format {
            path: path.to_path_buf(),
            source,
        })?;
        let _guard = self.io_lock.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|source| PersistenceError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        std::fs::write(path, data).map_err(|source| PersistenceError::Io {
            path: path.to_path_buf(),
            source,
        })
    }
}

impl FavoritesStore for JsonFileStore {
    fn load_favorites(&self) -> Result<Vec<FavoriteRecord>, PersistenceError> {
        self.read(&self.favorites_path)
    }

    fn save_favorites(&self, records: &[FavoriteRecord]) -> Result<(), PersistenceError> {
        self.write(&self.favorites_path, records)
    }
}

impl FilterStore for JsonFileStore {
    fn load_filters(&self) -> Result<Vec<FilterSpec>, PersistenceError> {
        self.read(&self.filters_path)
    }

    fn save_filters(&self, filters: &[FilterSpec]) -> Result<(), PersistenceError> {
        self.write(&self.filters_path, filters)
    }
}
