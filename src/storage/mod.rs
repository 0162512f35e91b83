//! Concrete [`StorageAccess`](crate::ports::StorageAccess) backends.

mod local;

pub use local::LocalStorage;
