//! Filesystem-backed storage.
//!
//! Keys are `/`-separated paths relative to one of the storage roots.
//! Packages are opened in place, so `download` is never needed for them.

use std::path::{Path, PathBuf};
use std::time::Instant;

use jwalk::WalkDir;

use crate::core::{ObjectInfo, is_package_key};
use crate::ports::{ByteStream, StorageAccess, StorageError};
use crate::utils::fingerprint::file_version;
use crate::utils::fs_path::{is_contained_key, key_under_root};
use crate::utils::normalize_path;

/// Local directories holding package files.
#[derive(Debug, Clone)]
pub struct LocalStorage {
    roots: Vec<PathBuf>,
}

impl LocalStorage {
    /// Roots are normalized; when two roots hold the same key the first wins.
    pub fn new(roots: impl IntoIterator<Item = PathBuf>) -> Self {
        Self {
            roots: roots.into_iter().map(|r| normalize_path(&r)).collect(),
        }
    }

    pub fn roots(&self) -> &[PathBuf] {
        &self.roots
    }

    fn resolve(&self, key: &str) -> Option<PathBuf> {
        if !is_contained_key(key) {
            return None;
        }
        let mut candidates = self.roots.iter().map(|root| root.join(key));
        let first = candidates.next()?;
        if first.exists() {
            return Some(first);
        }
        candidates.find(|p| p.exists()).or(Some(first))
    }

    /// Blocking directory walk over every root.
    fn scan(roots: &[PathBuf]) -> Result<Vec<ObjectInfo>, StorageError> {
        let mut seen = rustc_hash::FxHashSet::default();
        let mut objects = Vec::new();

        for root in roots {
            if !root.is_dir() {
                crate::debug!("storage"; "skipping missing root {}", root.display());
                continue;
            }

            for entry in WalkDir::new(root).skip_hidden(true) {
                let entry = entry.map_err(|e| {
                    StorageError::io(root.display().to_string(), std::io::Error::other(e))
                })?;
                let path = entry.path();
                if !entry.file_type().is_file() {
                    continue;
                }
                let Some(key) = key_under_root(root, &path).filter(|k| is_package_key(k)) else {
                    continue;
                };
                if !seen.insert(key.clone()) {
                    continue;
                }

                let meta = std::fs::metadata(&path).map_err(|e| StorageError::io(&key, e))?;
                objects.push(object_info(key, &meta));
            }
        }

        objects.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(objects)
    }
}

fn object_info(key: String, meta: &std::fs::Metadata) -> ObjectInfo {
    let modified = meta.modified().ok();
    let mut info = ObjectInfo::new(key, meta.len()).with_etag(file_version(meta.len(), modified));
    info.last_modified = modified;
    info
}

impl StorageAccess for LocalStorage {
    async fn list(&self) -> Result<Vec<ObjectInfo>, StorageError> {
        let roots = self.roots.clone();
        let start = Instant::now();
        let result = tokio::task::spawn_blocking(move || Self::scan(&roots))
            .await
            .map_err(|e| StorageError::Transient(format!("listing task failed: {e}")))?;
        crate::debug!("storage"; "listed {} roots in {:?}", self.roots.len(), start.elapsed());
        result
    }

    async fn reader(&self, key: &str) -> Result<ByteStream, StorageError> {
        let path = self
            .resolve(key)
            .ok_or_else(|| StorageError::NotFound(key.to_string()))?;
        match tokio::fs::File::open(&path).await {
            Ok(file) => Ok(Box::new(file)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(StorageError::NotFound(key.to_string()))
            }
            Err(e) => Err(StorageError::io(key, e)),
        }
    }

    async fn exists(&self, key: &str) -> Result<bool, StorageError> {
        let Some(path) = self.resolve(key) else {
            return Ok(false);
        };
        tokio::fs::try_exists(&path)
            .await
            .map_err(|e| StorageError::io(key, e))
    }

    async fn stat(&self, key: &str) -> Result<Option<ObjectInfo>, StorageError> {
        let Some(path) = self.resolve(key) else {
            return Ok(None);
        };
        match tokio::fs::metadata(&path).await {
            Ok(meta) if meta.is_file() => Ok(Some(object_info(key.to_string(), &meta))),
            Ok(_) => Ok(None),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StorageError::io(key, e)),
        }
    }

    fn local_path(&self, key: &str) -> Option<PathBuf> {
        self.resolve(key)
    }

    fn key_for_path(&self, path: &Path) -> Option<String> {
        let path = normalize_path(path);
        self.roots
            .iter()
            .find_map(|root| key_under_root(root, &path))
    }
}
