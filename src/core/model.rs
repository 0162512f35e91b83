use std::fmt;
use std::time::SystemTime;

use serde::{Deserialize, Serialize};

use super::PackageId;

/// Spatial reference system identifier (EPSG code).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Srid(pub u32);

impl Srid {
    pub const WGS84: Srid = Srid(4326);
    pub const WEB_MERCATOR: Srid = Srid(3857);
}

impl fmt::Display for Srid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EPSG:{}", self.0)
    }
}

/// A point in a given reference system.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinate {
    pub x: f64,
    pub y: f64,
    pub srid: Srid,
}

impl Coordinate {
    pub fn new(x: f64, y: f64, srid: Srid) -> Self {
        Self { x, y, srid }
    }
}

/// A feature table inside a package.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Layer {
    pub name: String,
    pub geometry_column: String,
    pub srid: Srid,
    pub has_spatial_index: bool,
}

impl Layer {
    pub fn new(name: impl Into<String>, geometry_column: impl Into<String>, srid: Srid) -> Self {
        Self {
            name: name.into(),
            geometry_column: geometry_column.into(),
            srid,
            has_spatial_index: false,
        }
    }
}

/// Attribute columns of a matched feature.
pub type Attributes = serde_json::Map<String, serde_json::Value>;

/// One feature matched by a point query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Feature {
    pub package_id: PackageId,
    pub layer: String,
    pub attributes: Attributes,
    /// GeoJSON geometry, present only when the request asked for it.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub geometry: Option<serde_json::Value>,
}

/// One entry of a storage listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectInfo {
    pub key: String,
    pub size: u64,
    pub last_modified: Option<SystemTime>,
    pub etag: Option<String>,
}

impl ObjectInfo {
    pub fn new(key: impl Into<String>, size: u64) -> Self {
        Self {
            key: key.into(),
            size,
            last_modified: None,
            etag: None,
        }
    }

    pub fn with_etag(mut self, etag: impl Into<String>) -> Self {
        self.etag = Some(etag.into());
        self
    }

    pub fn with_last_modified(mut self, at: SystemTime) -> Self {
        self.last_modified = Some(at);
        self
    }

    /// Whether two listings describe the same stored bytes.
    ///
    /// Etags decide when both sides carry one; otherwise size and
    /// modification time must both match.
    pub fn same_version(&self, other: &ObjectInfo) -> bool {
        if let (Some(a), Some(b)) = (&self.etag, &other.etag) {
            return a == b;
        }
        self.size == other.size
            && self.last_modified.is_some()
            && self.last_modified == other.last_modified
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_same_version_prefers_etag() {
        let t = SystemTime::UNIX_EPOCH + Duration::from_secs(10);
        let a = ObjectInfo::new("a.gpkg", 10).with_etag("x").with_last_modified(t);
        let b = ObjectInfo::new("a.gpkg", 99).with_etag("x");
        assert!(a.same_version(&b));

        let c = ObjectInfo::new("a.gpkg", 10).with_etag("y").with_last_modified(t);
        assert!(!a.same_version(&c));
    }

    #[test]
    fn test_same_version_falls_back_to_mtime_and_size() {
        let t = SystemTime::UNIX_EPOCH + Duration::from_secs(10);
        let a = ObjectInfo::new("a.gpkg", 10).with_last_modified(t);
        assert!(a.same_version(&ObjectInfo::new("a.gpkg", 10).with_last_modified(t)));
        assert!(!a.same_version(&ObjectInfo::new("a.gpkg", 11).with_last_modified(t)));

        // Nothing to compare: treat as changed.
        let bare = ObjectInfo::new("a.gpkg", 10);
        assert!(!bare.same_version(&bare.clone()));
    }
}
