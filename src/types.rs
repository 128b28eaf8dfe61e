use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Mutex;

use serde::Serialize;

use crate::filters::FilterSpec;

/// Case-insensitive identity of a path.
///
/// Built from the lowercased string itself rather than from a runtime hash
/// code, so equal keys compare equal byte for byte.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PathKey(String);

impl PathKey {
    pub fn new(path: &str) -> Self {
        Self(path.to_lowercase())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PathKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortField {
    Name,
    Path,
    Size,
    Extension,
    TypeName,
    DateCreated,
    DateModified,
    Attributes,
    FileListFilename,
    RunCount,
    DateRecentlyChanged,
    DateAccessed,
    DateRun,
}

impl SortField {
    const ORDER: [SortField; 13] = [
        Self::Name,
        Self::Path,
        Self::Size,
        Self::Extension,
        Self::TypeName,
        Self::DateCreated,
        Self::DateModified,
        Self::Attributes,
        Self::FileListFilename,
        Self::RunCount,
        Self::DateRecentlyChanged,
        Self::DateAccessed,
        Self::DateRun,
    ];

    /// Column name understood by Everything.exe `-sort`
    pub fn label(&self) -> &'static str {
        match self {
            Self::Name => "Name",
            Self::Path => "Path",
            Self::Size => "Size",
            Self::Extension => "Extension",
            Self::TypeName => "Type name",
            Self::DateCreated => "Date created",
            Self::DateModified => "Date modified",
            Self::Attributes => "Attributes",
            Self::FileListFilename => "File list filename",
            Self::RunCount => "Run count",
            Self::DateRecentlyChanged => "Date recently changed",
            Self::DateAccessed => "Date accessed",
            Self::DateRun => "Date run",
        }
    }

    /// Sort name understood by es.exe `-sort`
    pub fn es_name(&self) -> &'static str {
        match self {
            Self::Name => "name",
            Self::Path => "path",
            Self::Size => "size",
            Self::Extension => "extension",
            Self::TypeName => "type-name",
            Self::DateCreated => "date-created",
            Self::DateModified => "date-modified",
            Self::Attributes => "attributes",
            Self::FileListFilename => "file-list-file-name",
            Self::RunCount => "run-count",
            Self::DateRecentlyChanged => "date-recently-changed",
            Self::DateAccessed => "date-accessed",
            Self::DateRun => "date-run",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SortKey {
    pub field: SortField,
    pub ascending: bool,
}

impl SortKey {
    /// Decodes an Everything sort code: pairs of codes per field starting at
    /// 1, odd codes ascending. Out of range codes are clamped.
    pub fn from_code(code: u32) -> Self {
        let code = code.clamp(1, 26);
        Self {
            field: SortField::ORDER[((code - 1) / 2) as usize],
            ascending: code % 2 == 1,
        }
    }

    pub fn es_argument(&self) -> String {
        let direction = if self.ascending { "ascending" } else { "descending" };
        format!("{}-{}", self.field.es_name(), direction)
    }
}

impl Default for SortKey {
    fn default() -> Self {
        Self::from_code(1)
    }
}

/// Match flags sent with one backend request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct QueryFlags {
    pub match_case: bool,
    pub match_path: bool,
    pub match_whole_word: bool,
    pub use_regex: bool,
    pub sort: SortKey,
}

/// Term + filter + paging cursor. Replaced wholesale whenever the term or the
/// filter changes; only the cursor moves within one generation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryState {
    pub term: String,
    pub filter: FilterSpec,
    pub offset: u32,
}

impl QueryState {
    pub fn new(term: impl Into<String>, filter: FilterSpec) -> Self {
        Self {
            term: term.into(),
            filter,
            offset: 0,
        }
    }

    pub fn search_expression(&self) -> String {
        join_expression(&self.filter.search_prefix, &self.term)
    }
}

/// Filter prefix and user term joined by one space; an empty prefix is omitted.
pub fn join_expression(prefix: &str, term: &str) -> String {
    if prefix.is_empty() {
        term.to_string()
    } else {
        format!("{} {}", prefix, term)
    }
}

/// One backend request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendRequest {
    pub expression: String,
    /// User term alone, used for highlight markup
    pub term: String,
    pub flags: QueryFlags,
    pub offset: u32,
    pub limit: u32,
}

/// One row as returned by the backend, before favorites are merged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawMatch {
    pub path: String,
    pub is_dir: bool,
    pub highlighted_name: String,
    pub highlighted_path: String,
}

impl RawMatch {
    pub fn plain(path: impl Into<String>, is_dir: bool) -> Self {
        let path = path.into();
        let (parent, name) = split_path(&path);
        Self {
            highlighted_name: name.to_string(),
            highlighted_path: parent.to_string(),
            path,
            is_dir,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResultPage {
    pub entries: Vec<RawMatch>,
    pub total_available: u32,
}

/// Display metadata populated by enrichment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResultMetadata {
    pub size_display: String,
    pub modified_display: String,
    pub icon: Option<&'static str>,
}

impl ResultMetadata {
    /// Degraded state for paths that could not be probed.
    pub fn unavailable() -> Self {
        Self {
            size_display: String::new(),
            modified_display: "N/A".to_string(),
            icon: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Metadata {
    #[default]
    Unfetched,
    Fetched(ResultMetadata),
}

/// A published search result.
///
/// Identity is the case-insensitive path; metadata is presentation state and
/// takes no part in equality.
#[derive(Debug)]
pub struct SearchResult {
    key: PathKey,
    pub path: String,
    pub name: String,
    pub parent: String,
    pub is_directory: bool,
    pub highlighted_name: String,
    pub highlighted_path: String,
    pub is_favorite: bool,
    metadata: Mutex<Metadata>,
}

impl SearchResult {
    pub fn from_raw(raw: RawMatch, is_favorite: bool) -> Self {
        let (parent, name) = split_path(&raw.path);
        Self {
            key: PathKey::new(&raw.path),
            name: name.to_string(),
            parent: parent.to_string(),
            path: raw.path,
            is_directory: raw.is_dir,
            highlighted_name: raw.highlighted_name,
            highlighted_path: raw.highlighted_path,
            is_favorite,
            metadata: Mutex::new(Metadata::Unfetched),
        }
    }

    pub fn key(&self) -> &PathKey {
        &self.key
    }

    pub fn metadata(&self) -> Metadata {
        self.metadata
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn set_metadata(&self, metadata: ResultMetadata) {
        let mut slot = self
            .metadata
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *slot = Metadata::Fetched(metadata);
    }
}

impl PartialEq for SearchResult {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key
    }
}

impl Eq for SearchResult {}

impl Hash for SearchResult {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.key.hash(state);
    }
}

/// Splits a Windows or POSIX path into (parent, file name).
pub fn split_path(path: &str) -> (&str, &str) {
    let trimmed = path.trim_end_matches(['\\', '/']);
    match trimmed.rfind(['\\', '/']) {
        Some(idx) => (&trimmed[..idx], &trimmed[idx + 1..]),
        None => ("", trimmed),
    }
}
