use thiserror::Error;

use crate::core::PackageId;
use crate::ports::{RepositoryError, StorageError};

/// Why a load or reload did not publish a new generation.
#[derive(Debug, Error)]
pub enum LoadError {
    /// Storage kept failing, or failed with a non-retryable error
    #[error("storage failed after {attempts} attempt(s): {source}")]
    Storage {
        attempts: u32,
        #[source]
        source: StorageError,
    },

    #[error("corrupt package: {0}")]
    Corrupt(String),

    /// Only raised under `index_policy = "fail"`
    #[error("spatial index build failed for layer `{layer}`: {message}")]
    IndexBuild { layer: String, message: String },

    #[error("load cancelled")]
    Cancelled,

    #[error("package `{0}` was removed")]
    Removed(PackageId),

    #[error("package `{0}` is not registered")]
    NotRegistered(PackageId),

    #[error("internal error: {0}")]
    Internal(String),
}

impl From<RepositoryError> for LoadError {
    fn from(err: RepositoryError) -> Self {
        match err {
            RepositoryError::IndexBuild { layer, message } => Self::IndexBuild { layer, message },
            RepositoryError::Corrupt(msg) | RepositoryError::Query(msg) => Self::Corrupt(msg),
            RepositoryError::Io(e) => Self::Corrupt(e.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_storage_error_message_includes_source() {
        let err = LoadError::Storage {
            attempts: 3,
            source: StorageError::Transient("503 slow down".into()),
        };
        let msg = err.to_string();
        assert!(msg.contains("3 attempt"));
        assert!(msg.contains("503 slow down"));
    }

    #[test]
    fn test_repository_errors_map_to_corrupt() {
        let err: LoadError = RepositoryError::Corrupt("bad header".into()).into();
        assert!(matches!(err, LoadError::Corrupt(ref m) if m == "bad header"));

        let err: LoadError = RepositoryError::IndexBuild {
            layer: "zones".into(),
            message: "disk full".into(),
        }
        .into();
        assert!(matches!(err, LoadError::IndexBuild { .. }));
    }
}
