use std::time::Duration;

use crate::core::PackageId;

/// Storage operations reported to [`MetricsSink::storage_operation`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageOp {
    List,
    Download,
    Stat,
}

impl StorageOp {
    pub fn label(self) -> &'static str {
        match self {
            Self::List => "list",
            Self::Download => "download",
            Self::Stat => "stat",
        }
    }
}

/// Receives counters, durations and gauges. Nothing it returns is consumed.
pub trait MetricsSink: Send + Sync + 'static {
    fn query_completed(&self, package: &PackageId, elapsed: Duration, ok: bool);

    fn storage_operation(&self, op: StorageOp, elapsed: Duration, ok: bool);

    /// `loaded`: registered packages with a published handle.
    fn package_gauges(&self, loaded: usize, ready: usize);
}

/// Sink that drops everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetrics;

impl MetricsSink for NoopMetrics {
    fn query_completed(&self, _package: &PackageId, _elapsed: Duration, _ok: bool) {}

    fn storage_operation(&self, _op: StorageOp, _elapsed: Duration, _ok: bool) {}

    fn package_gauges(&self, _loaded: usize, _ready: usize) {}
}
