use serde::Serialize;

/// Lifecycle state of a registered package.
///
/// ```text
/// Discovered -> Loading -> Ready | Failed
/// Ready -> Reloading -> Ready (generation + 1) | Failed (generation unchanged)
/// any -> Removed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PackageStatus {
    Discovered,
    Loading,
    Ready,
    Reloading,
    Failed,
    Removed,
}

impl PackageStatus {
    pub fn label(self) -> &'static str {
        match self {
            Self::Discovered => "discovered",
            Self::Loading => "loading",
            Self::Ready => "ready",
            Self::Reloading => "reloading",
            Self::Failed => "failed",
            Self::Removed => "removed",
        }
    }
}
