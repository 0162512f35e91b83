//! Cheap version fingerprints using FxHash.

use rustc_hash::FxHasher;
use std::hash::Hasher;
use std::time::SystemTime;

/// Compute 64-bit hash from byte data.
#[inline]
pub fn compute<T: AsRef<[u8]> + ?Sized>(data: &T) -> u64 {
    let mut hasher = FxHasher::default();
    hasher.write(data.as_ref());
    hasher.finish()
}

/// Etag-like fingerprint of a file version from its size and mtime.
///
/// Avoids reading package bytes, which can be gigabytes.
pub fn file_version(size: u64, modified: Option<SystemTime>) -> String {
    let nanos = modified
        .and_then(|t| t.duration_since(SystemTime::UNIX_EPOCH).ok())
        .map_or(0, |d| d.as_nanos());
    format!("{:016x}", compute(format!("{size}:{nanos}").as_bytes()))
}
