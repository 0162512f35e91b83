//! Query Dispatcher
//!
//! Answers point queries against the registry's published generations.
//! Each package is queried on its own blocking task against the one
//! snapshot taken at the start of the call; a failure in one package is
//! reported for that package and never aborts the others.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::{Coordinate, Feature, PackageId, Srid};

mod dispatcher;


pub use dispatcher::QueryDispatcher;

/// A point lookup, optionally restricted to one package.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryRequest {
    pub coordinate: Coordinate,
    #[serde(default)]
    pub package_id: Option<PackageId>,
    #[serde(default)]
    pub include_geometry: bool,
}

impl QueryRequest {
    pub fn new(coordinate: Coordinate) -> Self {
        Self {
            coordinate,
            package_id: None,
            include_geometry: false,
        }
    }

    pub fn in_package(mut self, id: impl Into<PackageId>) -> Self {
        self.package_id = Some(id.into());
        self
    }

    pub fn with_geometry(mut self) -> Self {
        self.include_geometry = true;
        self
    }
}

/// Merged result of a point query.
///
/// `features` are grouped by package in ascending id order. Inside a
/// package, groups follow the layer order the repository enumerated at load
/// time, and each layer's features keep the order its `query_point`
/// returned them in. Nothing is re-sorted by attribute or geometry.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct QueryResponse {
    pub features: Vec<Feature>,
    pub package_errors: Vec<PackageError>,
    /// Layers whose SRID the request coordinate cannot be reprojected to
    pub skipped_layers: Vec<SkippedLayer>,
    pub packages_queried: usize,
}

impl QueryResponse {
    /// No package failed and no layer was skipped.
    pub fn is_complete(&self) -> bool {
        self.package_errors.is_empty() && self.skipped_layers.is_empty()
    }
}

/// A package whose sub-query failed; its features are not in the response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PackageError {
    pub package_id: PackageId,
    pub generation: u64,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SkippedLayer {
    pub package_id: PackageId,
    pub layer: String,
    pub from: Srid,
    pub to: Srid,
}

/// Whole-call failures. Per-package problems are in [`QueryResponse`].
#[derive(Debug, Error, PartialEq, Eq)]
pub enum QueryError {
    #[error("package `{0}` is not registered")]
    PackageNotFound(PackageId),

    /// Registered but no generation has been published
    #[error("package `{0}` has no loaded generation")]
    PackageUnavailable(PackageId),

    #[error("query cancelled")]
    Cancelled,
}
