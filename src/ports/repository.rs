use std::path::Path;

use thiserror::Error;

use crate::core::{Coordinate, Feature, Layer, PackageId};

/// Package-level errors reported by a repository
#[derive(Debug, Error)]
pub enum RepositoryError {
    /// Bytes could not be opened or parsed as a package
    #[error("corrupt package: {0}")]
    Corrupt(String),

    #[error("spatial index build failed for layer `{layer}`: {message}")]
    IndexBuild { layer: String, message: String },

    #[error("query failed: {0}")]
    Query(String),

    #[error("IO error")]
    Io(#[from] std::io::Error),
}

/// Opens package files and executes queries inside one package.
///
/// Every method may block on disk or SQL work; callers run them on the
/// blocking thread pool. A `Connection` is owned by exactly one published
/// handle and is passed back to [`close`](Self::close) once no query holds it.
pub trait PackageRepository: Send + Sync + 'static {
    type Connection: Send + Sync + 'static;

    fn open(&self, id: &PackageId, path: &Path) -> Result<Self::Connection, RepositoryError>;

    fn close(&self, conn: Self::Connection);

    /// Feature layers in the package's native order.
    fn layers(&self, conn: &Self::Connection) -> Result<Vec<Layer>, RepositoryError>;

    fn has_spatial_index(&self, conn: &Self::Connection, layer: &Layer) -> Result<bool, RepositoryError>;

    fn create_spatial_index(&self, conn: &Self::Connection, layer: &Layer) -> Result<(), RepositoryError>;

    /// Features of `layer` whose geometry contains `point`.
    ///
    /// The point is already expressed in the layer's SRID.
    fn query_point(
        &self,
        conn: &Self::Connection,
        layer: &Layer,
        point: &Coordinate,
        include_geometry: bool,
    ) -> Result<Vec<Feature>, RepositoryError>;
}
