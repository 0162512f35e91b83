use std::future::Future;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWriteExt};

use crate::core::ObjectInfo;

/// Boxed byte stream returned by [`StorageAccess::reader`].
pub type ByteStream = Box<dyn AsyncRead + Send + Unpin>;

/// Storage-related errors
#[derive(Debug, Error)]
pub enum StorageError {
    /// Retryable failure (timeout, throttling, connection reset)
    #[error("transient storage failure: {0}")]
    Transient(String),

    #[error("object `{0}` not found")]
    NotFound(String),

    #[error("IO error for `{key}`")]
    Io {
        key: String,
        #[source]
        source: std::io::Error,
    },
}

impl StorageError {
    /// Whether a load should retry after this error.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Transient(_) => true,
            Self::NotFound(_) => false,
            Self::Io { source, .. } => matches!(
                source.kind(),
                std::io::ErrorKind::Interrupted
                    | std::io::ErrorKind::TimedOut
                    | std::io::ErrorKind::WouldBlock
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::UnexpectedEof
            ),
        }
    }

    pub fn io(key: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            key: key.into(),
            source,
        }
    }
}

/// Local disk, object storage or plain HTTP holding package files.
pub trait StorageAccess: Send + Sync + 'static {
    /// List every package object currently stored.
    fn list(&self) -> impl Future<Output = Result<Vec<ObjectInfo>, StorageError>> + Send;

    /// Open a byte stream over an object.
    fn reader(&self, key: &str) -> impl Future<Output = Result<ByteStream, StorageError>> + Send;

    fn exists(&self, key: &str) -> impl Future<Output = Result<bool, StorageError>> + Send;

    /// Current version of one object, `None` when it no longer exists.
    ///
    /// The default checks [`exists`](Self::exists) and then searches a full
    /// listing; backends with a cheap per-object lookup should override it.
    fn stat(&self, key: &str) -> impl Future<Output = Result<Option<ObjectInfo>, StorageError>> + Send {
        async move {
            if !self.exists(key).await? {
                return Ok(None);
            }
            Ok(self.list().await?.into_iter().find(|o| o.key == key))
        }
    }

    /// Path of the object on local disk, when it can be opened in place.
    fn local_path(&self, _key: &str) -> Option<PathBuf> {
        None
    }

    /// Map a watched filesystem path back to its storage key.
    fn key_for_path(&self, _path: &Path) -> Option<String> {
        None
    }

    /// Copy an object to `destination`.
    ///
    /// Streams into a `.part` sibling and renames it into place, so a
    /// destination never holds a partially written package.
    fn download(
        &self,
        key: &str,
        destination: &Path,
    ) -> impl Future<Output = Result<(), StorageError>> + Send {
        async move {
            let mut reader = self.reader(key).await?;

            let partial = destination.with_extension("part");
            if let Some(parent) = destination.parent() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|e| StorageError::io(key, e))?;
            }

            let copy = async {
                let mut file = tokio::fs::File::create(&partial).await?;
                tokio::io::copy(&mut reader, &mut file).await?;
                file.flush().await?;
                tokio::fs::rename(&partial, destination).await
            };

            if let Err(e) = copy.await {
                let _ = tokio::fs::remove_file(&partial).await;
                return Err(StorageError::io(key, e));
            }
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Error, ErrorKind};

    #[test]
    fn test_retryable_classification() {
        assert!(StorageError::Transient("503".into()).is_retryable());
        assert!(!StorageError::NotFound("a.gpkg".into()).is_retryable());
        assert!(StorageError::io("a", Error::new(ErrorKind::TimedOut, "slow")).is_retryable());
        assert!(!StorageError::io("a", Error::new(ErrorKind::PermissionDenied, "no")).is_retryable());
    }

    #[test]
    fn test_error_display() {
        let err = StorageError::io("eu/zones.gpkg", Error::new(ErrorKind::NotFound, "gone"));
        assert!(err.to_string().contains("eu/zones.gpkg"));
    }
}
