//! Small pure helpers shared across modules.
//!
//! - [`fs_path`]: path normalization, storage keys under a root
//! - [`fingerprint`]: FxHash-based version fingerprints

pub mod fingerprint;
pub mod fs_path;

pub use fs_path::normalize_path;
