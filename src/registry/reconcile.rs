//! Full reconciliation against a storage listing.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::task::JoinHandle;

use super::entry::Command;
use super::retry::with_retry;
use super::{LoadError, PackageRegistry};
use crate::core::{ObjectInfo, PackageId, PackageStatus, is_package_key};
use crate::ports::{PackageRepository, StorageAccess, StorageOp};

/// What a reconciliation pass scheduled.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    /// Keys seen for the first time, or never successfully loaded
    pub loaded: usize,
    /// Packages whose stored version moved past the published one
    pub reloaded: usize,
    /// Packages no longer listed
    pub removed: usize,
    pub unchanged: usize,
}

impl ReconcileReport {
    pub fn scheduled(&self) -> usize {
        self.loaded + self.reloaded + self.removed
    }
}

impl<S: StorageAccess, R: PackageRepository> PackageRegistry<S, R> {
    /// Compare the registry against `listing` and schedule transitions.
    ///
    /// Returns immediately; use [`wait_idle`](Self::wait_idle) to wait for
    /// the scheduled work. Keys rejected by [`is_package_key`] are ignored, and
    /// when two keys map to the same id the first one listed wins.
    pub fn reconcile(&self, listing: Vec<ObjectInfo>) -> ReconcileReport {
        let mut listed: BTreeMap<PackageId, ObjectInfo> = BTreeMap::new();
        for info in listing {
            if !is_package_key(&info.key) {
                continue;
            }
            listed.entry(PackageId::from_key(&info.key)).or_insert(info);
        }

        let mut report = ReconcileReport::default();

        let stale: Vec<PackageId> = self
            .inner
            .entries
            .iter()
            .filter(|entry| !listed.contains_key(entry.key()))
            .map(|entry| entry.key().clone())
            .collect();
        for id in stale {
            if self.inner.submit(&id, None, Command::Remove { reply: None }) {
                report.removed += 1;
            }
        }

        for (id, info) in listed {
            let current = self.inner.entries.get(&id).map(|e| Arc::clone(e.value()));
            let published = current.as_ref().is_some_and(|e| e.has_handle());

            let up_to_date = current.as_ref().is_some_and(|entry| {
                let state = entry.state.lock();
                published
                    && matches!(state.status, PackageStatus::Ready | PackageStatus::Reloading)
                    && state.version.as_ref().is_some_and(|v| v.same_version(&info))
            });
            if up_to_date {
                report.unchanged += 1;
                continue;
            }

            let key = info.key.clone();
            let command = Command::Load {
                version: Some(info),
                force: false,
                reply: None,
            };
            if self.inner.submit(&id, Some(&key), command) {
                if published {
                    report.reloaded += 1;
                } else {
                    report.loaded += 1;
                }
            }
        }

        crate::debug!(
            "registry";
            "reconcile: {} new, {} changed, {} removed, {} unchanged",
            report.loaded, report.reloaded, report.removed, report.unchanged
        );
        report
    }

    /// List storage (with retry) and reconcile against the result.
    pub async fn refresh(&self) -> Result<ReconcileReport, LoadError> {
        let inner = &self.inner;
        let listing = with_retry(
            &inner.config.retry,
            &inner.cancel,
            inner.metrics.as_ref(),
            StorageOp::List,
            "",
            || inner.storage.list(),
        )
        .await?;
        Ok(self.reconcile(listing))
    }

    /// Periodically [`refresh`](Self::refresh) until the registry closes.
    pub fn spawn_reconciler(&self, interval: Duration) -> JoinHandle<()> {
        let registry = self.clone();
        tokio::spawn(async move {
            let cancel = registry.inner.cancel.clone();
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // First tick completes immediately; startup already reconciled.
            ticker.tick().await;

            loop {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => match registry.refresh().await {
                        Ok(report) if report.scheduled() > 0 => crate::log!(
                            "registry";
                            "reconcile scheduled {} new, {} changed, {} removed",
                            report.loaded, report.reloaded, report.removed
                        ),
                        Ok(_) => {}
                        Err(e) => crate::log!("registry"; "reconcile failed: {}", e),
                    },
                }
            }
        })
    }
}
