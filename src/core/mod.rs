//! Shared data model.
//!
//! - `id`: package identity and package-file recognition
//! - `change`: watcher output (`Operation`, `ChangeEvent`)
//! - `model`: coordinates, layers, features, storage object info
//! - `status`: package lifecycle states

mod change;
mod id;
mod model;
mod status;

pub use change::{ChangeEvent, Operation};
pub use id::{PACKAGE_EXTENSION, PackageId, is_package_file, is_package_key};
pub use model::{Attributes, Coordinate, Feature, Layer, ObjectInfo, Srid};
pub use status::PackageStatus;
