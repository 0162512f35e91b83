use thiserror::Error;

use crate::core::{Coordinate, Srid};

#[derive(Debug, Clone, Error, PartialEq)]
pub enum TransformError {
    #[error("no transform from {from} to {to}")]
    Unsupported { from: Srid, to: Srid },

    #[error("transform failed: {0}")]
    Failed(String),
}

/// Reprojects coordinates between reference systems.
pub trait CoordinateTransformer: Send + Sync + 'static {
    fn is_supported(&self, from: Srid, to: Srid) -> bool;

    fn transform(&self, coord: &Coordinate, to: Srid) -> Result<Coordinate, TransformError>;
}
