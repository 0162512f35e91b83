use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};

/// File extension of recognized package files (matched case-insensitively).
pub const PACKAGE_EXTENSION: &str = "gpkg";

/// Check whether a path names a package file.
///
/// Requires a non-empty file stem and an extension equal to
/// [`PACKAGE_EXTENSION`] ignoring ASCII case. `data.gpkg.bak`, a bare `gpkg`
/// and a hidden `.gpkg` are all rejected.
pub fn is_package_file(path: &Path) -> bool {
    let Some(ext) = path.extension().and_then(|e| e.to_str()) else {
        return false;
    };
    let has_stem = path
        .file_stem()
        .and_then(|s| s.to_str())
        .is_some_and(|s| !s.is_empty());

    has_stem && ext.eq_ignore_ascii_case(PACKAGE_EXTENSION)
}

/// Check whether a storage key names a package the registry tracks.
///
/// On top of [`is_package_file`], no `/`-separated component may be hidden
/// (start with `.`): staging directories such as `.staging/zones.gpkg` are
/// neither listed nor loaded from change events.
pub fn is_package_key(key: &str) -> bool {
    let key = key.replace('\\', "/");
    let visible = key
        .split('/')
        .filter(|part| !part.is_empty() && *part != ".")
        .all(|part| !part.starts_with('.'));
    visible && is_package_file(Path::new(&key))
}

/// Stable identity of a package, derived from its storage key.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PackageId(String);

impl PackageId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Derive the id from a storage key.
    ///
    /// `regions/Europe.GPKG` becomes `regions/Europe`. Backslashes are
    /// normalized so keys produced on Windows map to the same id.
    pub fn from_key(key: &str) -> Self {
        let key = key.replace('\\', "/");
        let key = key.trim_start_matches("./").trim_start_matches('/');
        let suffix_len = PACKAGE_EXTENSION.len() + 1;

        let stripped = match key.len().checked_sub(suffix_len) {
            Some(cut)
                if key.is_char_boundary(cut)
                    && key[cut..].eq_ignore_ascii_case(&format!(".{PACKAGE_EXTENSION}")) =>
            {
                &key[..cut]
            }
            _ => key,
        };

        Self(stripped.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// File-name-safe form of the id, for cache files.
    pub fn file_safe(&self) -> String {
        self.0
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect()
    }
}

impl fmt::Display for PackageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PackageId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}
