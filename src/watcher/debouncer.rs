use std::path::PathBuf;
use std::time::{Duration, Instant};

use rustc_hash::FxHashMap;

use crate::core::{ChangeEvent, Operation};

/// A raw change waiting out its quiet period.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) struct PendingChange {
    pub(super) operation: Operation,
    pub(super) last_seen: Instant,
}

/// Pure debouncer: coalescing and quiet-period gating, no clock access.
///
/// Callers pass `now` explicitly. The watcher shares one instance between
/// the raw-event consumer and the resolver behind a mutex.
#[derive(Debug, Default)]
pub(super) struct Debouncer {
    pub(super) pending: FxHashMap<PathBuf, PendingChange>,
}

impl Debouncer {
    pub(super) fn new() -> Self {
        Self::default()
    }

    /// Record a raw operation, restarting the path's quiet period.
    pub(super) fn record(&mut self, path: PathBuf, operation: Operation, now: Instant) {
        match self.pending.get_mut(&path) {
            Some(existing) => {
                let resolved = existing.operation.coalesce(operation);
                if resolved != existing.operation {
                    crate::debug!("watch"; "coalesce {}->{}: {}",
                        existing.operation.label(), resolved.label(), path.display());
                }
                existing.operation = resolved;
                existing.last_seen = now;
            }
            None => {
                crate::debug!("watch"; "pending {}: {}", operation.label(), path.display());
                self.pending.insert(
                    path,
                    PendingChange {
                        operation,
                        last_seen: now,
                    },
                );
            }
        }
    }

    /// Remove and return every change quiet for at least `window`.
    ///
    /// Order across paths is unspecified.
    pub(super) fn take_expired(&mut self, now: Instant, window: Duration) -> Vec<ChangeEvent> {
        let expired: Vec<PathBuf> = self
            .pending
            .iter()
            .filter(|(_, change)| now.saturating_duration_since(change.last_seen) >= window)
            .map(|(path, _)| path.clone())
            .collect();

        expired
            .into_iter()
            .filter_map(|path| {
                let change = self.pending.remove(&path)?;
                Some(ChangeEvent::new(path, change.operation))
            })
            .collect()
    }

    pub(super) fn len(&self) -> usize {
        self.pending.len()
    }

    pub(super) fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}
