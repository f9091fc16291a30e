//! Error types for the artifact store

use std::fmt;
use std::io;
use std::path::PathBuf;

#[derive(Debug)]
pub enum StoreError {
    /// No committed entry exists for the key
    NotFound { key: String },
    /// The key cannot be mapped to a location under the store root
    InvalidKey { key: String },
    Io { path: PathBuf, source: io::Error },
    /// A tree walk failed at `path`
    Walk { path: PathBuf, source: io::Error },
    /// A purge could not remove `path`; `removed` entries were removed anyway
    Purge {
        removed: u64,
        path: PathBuf,
        source: io::Error,
    },
}

impl StoreError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        StoreError::Io {
            path: path.into(),
            source,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound { .. })
    }
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreError::NotFound { key } => write!(f, "entry not found: {}", key),
            StoreError::InvalidKey { key } => write!(f, "invalid entry key: {:?}", key),
            StoreError::Io { path, source } => write!(f, "{}: {}", path.display(), source),
            StoreError::Walk { path, source } => {
                write!(f, "cannot walk {}: {}", path.display(), source)
            }
            StoreError::Purge {
                removed,
                path,
                source,
            } => write!(
                f,
                "cannot remove {} ({} entries removed): {}",
                path.display(),
                removed,
                source
            ),
        }
    }
}

impl std::error::Error for StoreError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            StoreError::Io { source, .. }
            | StoreError::Walk { source, .. }
            | StoreError::Purge { source, .. } => Some(source),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;
