use std::path::PathBuf;

use thiserror::Error;

/// Failures of a backend query. Recovered at the coordinator boundary and
/// turned into a status, never propagated further.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SearchError {
    /// Everything is not running, or its IPC window could not be reached.
    #[error("Everything backend unavailable: {0}")]
    BackendUnavailable(String),

    /// The expression was refused, e.g. an invalid regular expression.
    #[error("query rejected: {0}")]
    QueryRejected(String),
}

/// Failures of a single metadata probe.
#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("access denied: {}", .0.display())]
    AccessDenied(PathBuf),

    #[error("I/O error probing {}: {source}", path.display())]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
}

impl ProbeError {
    pub fn from_io(path: PathBuf, source: std::io::Error) -> Self {
        if source.kind() == std::io::ErrorKind::PermissionDenied {
            Self::AccessDenied(path)
        } else {
            Self::Io { path, source }
        }
    }
}

/// Favorites or filter definitions could not be read or written.
#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("malformed data in {}: {source}", path.display())]
    Format {
        path: PathBuf,
        source: serde_json::Error,
    },
}
