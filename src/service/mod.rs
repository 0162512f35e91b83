//! Service - wires the watcher, registry and dispatcher together
//!
//! # Responsibility
//!
//! A thin orchestrator: it starts the change watcher with the registry as
//! its handler, populates the registry from storage, waits for the first
//! generation of every package, and optionally runs periodic
//! reconciliation. Lifecycle logic lives in `registry/`.
//!
//! ```text
//! ChangeWatcher ──on_change──► PackageRegistry ◄──snapshots── QueryDispatcher
//!                                    ▲
//!                     periodic refresh (reconcile_secs)
//! ```

use std::sync::Arc;

use anyhow::{Context, Result};
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::ServiceConfig;
use crate::core::PackageStatus;
use crate::ports::{CoordinateTransformer, MetricsSink, PackageRepository, StorageAccess};
use crate::query::QueryDispatcher;
use crate::registry::PackageRegistry;
use crate::watcher::ChangeWatcher;


/// Running service. Dropping it cancels everything it started.
pub struct Service<S, R: PackageRepository, T> {
    registry: PackageRegistry<S, R>,
    dispatcher: QueryDispatcher<S, R, T>,
    watcher: Mutex<Option<ChangeWatcher>>,
    reconciler: Mutex<Option<JoinHandle<()>>>,
    cancel: CancellationToken,
}

impl<S, R, T> Service<S, R, T>
where
    S: StorageAccess,
    R: PackageRepository,
    T: CoordinateTransformer,
{
    /// Start watching, populate and start reconciling.
    ///
    /// The watcher attaches before storage is listed, so a package written
    /// during startup is picked up by one or the other. A failed initial listing is logged and left to the next change or
    /// reconciliation. Fails only on invalid configuration or when no watch
    /// root can be observed.
    pub async fn start(
        config: ServiceConfig,
        storage: Arc<S>,
        repository: Arc<R>,
        transformer: Arc<T>,
        metrics: Arc<dyn MetricsSink>,
    ) -> Result<Self> {
        config.validate().context("invalid service configuration")?;

        let cancel = CancellationToken::new();
        let registry = PackageRegistry::new(
            storage,
            repository,
            Arc::clone(&metrics),
            config.registry.clone(),
            cancel.clone(),
        );

        // Watcher first: changes made while the initial listing runs are
        // queued behind it instead of falling between listing and attach.
        let watcher = if config.watch.roots.is_empty() {
            crate::debug!("service"; "no watch roots configured");
            None
        } else {
            let watcher = ChangeWatcher::start(
                config.watch.roots.clone(),
                &config.watch,
                Arc::new(registry.clone()),
                cancel.clone(),
            )
            .context("failed to start change watcher")?;
            Some(watcher)
        };

        match registry.refresh().await {
            Ok(report) => crate::debug!("service"; "initial listing: {} package(s)", report.loaded),
            Err(e) => crate::log!("service"; "initial listing failed: {}", e),
        }
        registry.wait_idle().await;
        log_population(&registry);

        let reconciler = config.registry.reconcile_interval().map(|interval| {
            crate::debug!("service"; "reconciling every {:?}", interval);
            registry.spawn_reconciler(interval)
        });

        let dispatcher = QueryDispatcher::new(registry.clone(), transformer, metrics);
        Ok(Self {
            registry,
            dispatcher,
            watcher: Mutex::new(watcher),
            reconciler: Mutex::new(reconciler),
            cancel,
        })
    }

    pub fn registry(&self) -> &PackageRegistry<S, R> {
        &self.registry
    }

    pub fn dispatcher(&self) -> &QueryDispatcher<S, R, T> {
        &self.dispatcher
    }

    /// Token cancelled on shutdown, for pairing with query calls.
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_shut_down(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Stop the watcher, the reconciler and every registry worker.
    /// Idempotent.
    pub async fn shutdown(&self) {
        if !self.cancel.is_cancelled() {
            crate::log!("service"; "shutting down");
        }
        self.cancel.cancel();

        let watcher = self.watcher.lock().take();
        if let Some(watcher) = watcher {
            watcher.shutdown().await;
        }
        let reconciler = self.reconciler.lock().take();
        if let Some(reconciler) = reconciler {
            let _ = reconciler.await;
        }
    }
}

impl<S, R: PackageRepository, T> Drop for Service<S, R, T> {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

fn log_population<S: StorageAccess, R: PackageRepository>(registry: &PackageRegistry<S, R>) {
    let infos = registry.list();
    let ready = infos.iter().filter(|i| i.status == PackageStatus::Ready).count();
    crate::log!("service"; "{} of {} package(s) ready", ready, infos.len());
    for info in infos.iter().filter(|i| i.status == PackageStatus::Failed) {
        crate::log!(
            "service";
            "{} failed: {}",
            info.id,
            info.last_error.as_deref().unwrap_or("unknown error")
        );
    }
}
