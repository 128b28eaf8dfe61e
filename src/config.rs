use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::PersistenceError;

/// Rows requested from the backend per page
pub const DEFAULT_BATCH_SIZE: u32 = 100;

/// Upper bound accepted for `batch_size`
pub const MAX_BATCH_SIZE: u32 = 1000;

/// Concurrent metadata probes
pub const DEFAULT_ENRICHMENT_WORKERS: usize = 4;

/// How the paging cursor advances after a page containing favorites.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OffsetPolicy {
    /// Only rows published into the main (non-favorite) block move the cursor.
    #[default]
    NonFavoriteRows,
    /// Every row returned by the backend moves the cursor.
    AllRows,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchSettings {
    pub match_case: bool,
    pub match_path: bool,
    pub match_whole_word: bool,
    pub use_regex: bool,
    /// Everything sort code, 1 = name ascending .. 26 = date run descending
    pub sort: u32,
    pub hide_empty_results: bool,
    pub batch_size: u32,
    pub offset_policy: OffsetPolicy,
    pub enrichment_workers: usize,
    pub everything_path: Option<PathBuf>,
    pub es_path: Option<PathBuf>,
    pub es_instance: String,
    pub import_filters: bool,
}

impl Default for SearchSettings {
    fn default() -> Self {
        Self {
            match_case: false,
            match_path: false,
            match_whole_word: false,
            use_regex: false,
            sort: 1,
            hide_empty_results: true,
            batch_size: DEFAULT_BATCH_SIZE,
            offset_policy: OffsetPolicy::default(),
            enrichment_workers: DEFAULT_ENRICHMENT_WORKERS,
            everything_path: None,
            es_path: None,
            es_instance: String::new(),
            import_filters: false,
        }
    }
}

impl SearchSettings {
    pub fn effective_batch_size(&self) -> u32 {
        self.batch_size.clamp(1, MAX_BATCH_SIZE)
    }

    /// Whether switching from `self` to `other` invalidates published results.
    pub fn requires_requery(&self, other: &SearchSettings) -> bool {
        self.match_case != other.match_case
            || self.match_path != other.match_path
            || self.match_whole_word != other.match_whole_word
            || self.use_regex != other.use_regex
            || self.sort != other.sort
            || self.hide_empty_results != other.hide_empty_results
            || self.effective_batch_size() != other.effective_batch_size()
            || self.offset_policy != other.offset_policy
    }
}

/// Data directory
pub fn data_dir() -> PathBuf {
    let mut p = dirs::data_local_dir().unwrap_or_else(|| PathBuf::from("."));
    p.push("StarQuery");
    std::fs::create_dir_all(&p).ok();
    p
}

pub fn settings_path() -> PathBuf {
    data_dir().join("settings.json")
}

pub fn favorites_path() -> PathBuf {
    data_dir().join("favorites.json")
}

pub fn filters_path() -> PathBuf {
    data_dir().join("filters.json")
}

/// Reads settings, falling back to defaults when the file is missing or broken.
pub fn load_settings(path: &Path) -> SearchSettings {
    let data = match std::fs::read_to_string(path) {
        Ok(data) => data,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return SearchSettings::default(),
        Err(e) => {
            warn!("cannot read settings {}: {}", path.display(), e);
            return SearchSettings::default();
        }
    };
    match serde_json::from_str(&data) {
        Ok(settings) => settings,
        Err(e) => {
            warn!("ignoring malformed settings {}: {}", path.display(), e);
            SearchSettings::default()
        }
    }
}

pub fn save_settings(path: &Path, settings: &SearchSettings) -> Result<(), PersistenceError> {
    let data = serde_json::to_string_pretty(settings).map_err(|source| PersistenceError::Format {
        path: path.to_path_buf(),
        source,
    })?;
    std::fs::write(path, data).map_err(|source| PersistenceError::Io {
        path: path.to_path_buf(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_settings_fill_in_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, r#"{ "match_case": true, "offset_policy": "all_rows" }"#).unwrap();

        let settings = load_settings(&path);
        assert!(settings.match_case);
        assert_eq!(settings.offset_policy, OffsetPolicy::AllRows);
        assert_eq!(settings.batch_size, DEFAULT_BATCH_SIZE);
        assert!(settings.hide_empty_results);
    }

    #[test]
    fn broken_settings_fall_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, "{ not json").unwrap();
        assert_eq!(load_settings(&path), SearchSettings::default());
        assert_eq!(load_settings(&dir.path().join("missing.json")), SearchSettings::default());
    }

    #[test]
    fn settings_round_trip_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        let settings = SearchSettings {
            use_regex: true,
            sort: 14,
            ..Default::default()
        };
        save_settings(&path, &settings).unwrap();
        assert_eq!(load_settings(&path), settings);
    }

    #[test]
    fn batch_size_is_clamped() {
        let mut settings = SearchSettings {
            batch_size: 0,
            ..Default::default()
        };
        assert_eq!(settings.effective_batch_size(), 1);
        settings.batch_size = 50_000;
        assert_eq!(settings.effective_batch_size(), MAX_BATCH_SIZE);
    }

    #[test]
    fn only_query_affecting_changes_require_requery() {
        let base = SearchSettings::default();
        let workers = SearchSettings {
            enrichment_workers: 9,
            ..Default::default()
        };
        assert!(!base.requires_requery(&workers));

        let sorted = SearchSettings {
            sort: 2,
            ..Default::default()
        };
        assert!(base.requires_requery(&sorted));
    }
}
