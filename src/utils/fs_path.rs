//! Path normalization and storage-key helpers.

use std::path::{Component, Path, PathBuf};

/// Normalize a file system path to absolute form.
///
/// Tries `canonicalize()` first (resolves symlinks, `.`, `..`). A path that
/// no longer exists (a deleted package) is canonicalized through its parent
/// so it still matches roots that were canonicalized while it existed.
pub fn normalize_path(path: &Path) -> PathBuf {
    if let Ok(canonical) = path.canonicalize() {
        return canonical;
    }

    if let (Some(parent), Some(name)) = (path.parent(), path.file_name())
        && let Ok(parent) = parent.canonicalize()
    {
        return parent.join(name);
    }

    if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir().map_or_else(|_| path.to_path_buf(), |cwd| cwd.join(path))
    }
}

/// Relative `/`-separated key of `path` under `root`.
///
/// Returns `None` when the path is outside the root or is the root itself.
pub fn key_under_root(root: &Path, path: &Path) -> Option<String> {
    let relative = path.strip_prefix(root).ok()?;
    let parts: Vec<&str> = relative
        .components()
        .map(|c| match c {
            Component::Normal(part) => part.to_str(),
            _ => None,
        })
        .collect::<Option<_>>()?;

    (!parts.is_empty()).then(|| parts.join("/"))
}

/// Whether a storage key stays inside its root when joined onto it.
pub fn is_contained_key(key: &str) -> bool {
    !key.is_empty()
        && Path::new(key)
            .components()
            .all(|c| matches!(c, Component::Normal(_)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_path_relative_becomes_absolute() {
        assert!(normalize_path(Path::new("relative/path/file.gpkg")).is_absolute());
    }

    #[test]
    fn test_normalize_path_deleted_file_keeps_canonical_parent() {
        let temp = tempfile::TempDir::new().unwrap();
        let gone = temp.path().join("gone.gpkg");
        let normalized = normalize_path(&gone);
        assert_eq!(normalized, temp.path().canonicalize().unwrap().join("gone.gpkg"));
    }

    #[test]
    fn test_key_under_root() {
        let root = Path::new("/srv/data");
        assert_eq!(
            key_under_root(root, Path::new("/srv/data/eu/zones.gpkg")).as_deref(),
            Some("eu/zones.gpkg")
        );
        assert_eq!(key_under_root(root, Path::new("/srv/other/a.gpkg")), None);
        assert_eq!(key_under_root(root, Path::new("/srv/data")), None);
    }

    #[test]
    fn test_is_contained_key() {
        assert!(is_contained_key("eu/zones.gpkg"));
        assert!(!is_contained_key("../secret.gpkg"));
        assert!(!is_contained_key("/etc/a.gpkg"));
        assert!(!is_contained_key(""));
    }
}
