//! Collaborator capabilities the core calls but does not implement.
//!
//! - [`StorageAccess`]: list and fetch raw package bytes
//! - [`PackageRepository`]: open packages, enumerate layers, run point queries
//! - [`CoordinateTransformer`]: reproject a coordinate between SRIDs
//! - [`MetricsSink`]: fire-and-forget counters, durations and gauges

mod metrics;
mod repository;
mod storage;
mod transform;

pub use metrics::{MetricsSink, NoopMetrics, StorageOp};
pub use repository::{PackageRepository, RepositoryError};
pub use storage::{ByteStream, StorageAccess, StorageError};
pub use transform::{CoordinateTransformer, TransformError};
