//! gpkg-registry - hot-reloading GeoPackage registry.
//!
//! A debounced change watcher feeds a concurrent package registry that
//! loads, reloads and unloads per-package query handles while queries are
//! in flight; a dispatcher fans point queries out over the published
//! generations.
//!
//! Storage, package parsing, reprojection and metrics sinks are supplied
//! through the traits in [`ports`].

pub mod logger;

pub mod config;
pub mod core;
pub mod ports;
pub mod query;
pub mod registry;
pub mod service;
pub mod storage;
pub mod utils;
pub mod watcher;

#[cfg(test)]
mod testing;

pub use config::ServiceConfig;
pub use query::{QueryDispatcher, QueryRequest, QueryResponse};
pub use registry::{PackageRegistry, Snapshot};
pub use service::Service;
