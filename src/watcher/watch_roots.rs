use std::path::{Path, PathBuf};

use notify::{RecursiveMode, Watcher};
use rustc_hash::FxHashSet;

use super::WatchError;

/// Tracks which configured roots are currently observed.
///
/// A root that is missing at startup, or deleted later, is picked up again
/// by [`maintain`](Self::maintain) once it exists. Packages inside a root
/// that reappears are not replayed as events; the registry's periodic
/// reconciliation covers them.
pub(super) struct WatchRoots {
    desired: Vec<PathBuf>,
    attached: FxHashSet<PathBuf>,
}

impl WatchRoots {
    pub(super) fn new(paths: Vec<PathBuf>) -> Self {
        let mut seen = FxHashSet::default();
        let desired = paths.into_iter().filter(|p| seen.insert(p.clone())).collect();
        Self {
            desired,
            attached: FxHashSet::default(),
        }
    }

    /// Try every root once. Returns one setup error per root left detached.
    pub(super) fn attach_all<W: Watcher>(&mut self, watcher: &mut W) -> Vec<WatchError> {
        let mut errors = Vec::new();
        for path in &self.desired {
            match watch(watcher, path) {
                Ok(()) => {
                    self.attached.insert(path.clone());
                }
                Err(source) => errors.push(WatchError::Setup {
                    path: path.clone(),
                    source,
                }),
            }
        }
        errors
    }

    pub(super) fn attached_count(&self) -> usize {
        self.attached.len()
    }

    /// Forget roots that vanished and attach roots that (re)appeared.
    pub(super) fn maintain<W: Watcher>(&mut self, watcher: &mut W) {
        self.attached.retain(|path| {
            let alive = path.is_dir();
            if !alive {
                crate::log!("watch"; "lost watch root {}", path.display());
            }
            alive
        });

        for path in &self.desired {
            if self.attached.contains(path) || !path.is_dir() {
                continue;
            }
            match watch(watcher, path) {
                Ok(()) => {
                    self.attached.insert(path.clone());
                    crate::log!("watch"; "attached watch root {}", path.display());
                }
                Err(e) => crate::debug!("watch"; "{} not attachable yet: {}", path.display(), e),
            }
        }
    }
}

fn watch<W: Watcher>(watcher: &mut W, path: &Path) -> notify::Result<()> {
    watcher.watch(path, RecursiveMode::Recursive)
}
