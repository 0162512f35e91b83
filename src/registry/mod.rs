//! Package Registry
//!
//! Owns the authoritative set of packages and runs every state transition.
//!
//! ```text
//! reconcile / on_change_event / load / reload / remove
//!                 │ submit
//!                 ▼
//!   DashMap<PackageId, Arc<Entry>> ──► per-id worker (serialized)
//!                                         │ download → open → layers → indexes
//!                                         ▼
//!                           ArcSwapOption<PackageHandle>  ◄── get() / snapshots()
//! ```
//!
//! The map lock only covers structural changes. Package content is reached
//! through an atomically swapped handle, so readers never wait on a reload,
//! and a replaced handle is closed when its last [`Snapshot`] drops.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;

use crate::core::{ChangeEvent, Operation, PackageId, PackageStatus, is_package_key};
use crate::ports::{MetricsSink, PackageRepository, StorageAccess};
use crate::watcher::{ChangeHandler, HandlerError};

mod entry;
mod error;
mod handle;
mod reconcile;
mod retry;
mod worker;


pub use crate::config::RegistrySectionConfig as RegistryConfig;
pub use entry::PackageInfo;
pub use error::LoadError;
pub use handle::{PackageHandle, Snapshot};
pub use reconcile::ReconcileReport;

use entry::{Command, Entry};

/// Registry of hot-reloadable packages. Cheap to clone.
pub struct PackageRegistry<S, R: PackageRepository> {
    inner: Arc<Inner<S, R>>,
}

impl<S, R: PackageRepository> Clone for PackageRegistry<S, R> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

struct Inner<S, R: PackageRepository> {
    storage: Arc<S>,
    repository: Arc<R>,
    metrics: Arc<dyn MetricsSink>,
    config: RegistryConfig,
    entries: DashMap<PackageId, Arc<Entry<R>>>,
    incarnations: AtomicU64,
    /// Commands queued or running across all workers
    in_flight: watch::Sender<usize>,
    cancel: CancellationToken,
}

impl<S, R: PackageRepository> Drop for Inner<S, R> {
    fn drop(&mut self) {
        // Workers only hold a weak reference; this ends them.
        self.cancel.cancel();
    }
}

impl<S: StorageAccess, R: PackageRepository> PackageRegistry<S, R> {
    /// Create an empty registry. Workers stop when `cancel` fires or the
    /// last clone is dropped.
    pub fn new(
        storage: Arc<S>,
        repository: Arc<R>,
        metrics: Arc<dyn MetricsSink>,
        config: RegistryConfig,
        cancel: CancellationToken,
    ) -> Self {
        let (in_flight, _) = watch::channel(0);
        Self {
            inner: Arc::new(Inner {
                storage,
                repository,
                metrics,
                config,
                entries: DashMap::new(),
                incarnations: AtomicU64::new(0),
                in_flight,
                cancel: cancel.child_token(),
            }),
        }
    }

    pub fn storage(&self) -> &Arc<S> {
        &self.inner.storage
    }

    pub fn repository(&self) -> &Arc<R> {
        &self.inner.repository
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.inner.config
    }

    /// Track `key` as `Discovered` without loading it.
    ///
    /// Must be called inside a tokio runtime.
    pub fn discover(&self, key: &str) -> PackageId {
        let id = PackageId::from_key(key);
        self.inner.entry_or_insert(&id, key);
        id
    }

    /// Load a registered package, or reload it when its stored version
    /// changed since the published generation. Returns the generation now
    /// serving queries.
    pub async fn load(&self, id: &PackageId) -> Result<u64, LoadError> {
        self.submit_load(id, false).await
    }

    /// Reload a registered package even when its stored version looks unchanged.
    pub async fn reload(&self, id: &PackageId) -> Result<u64, LoadError> {
        self.submit_load(id, true).await
    }

    async fn submit_load(&self, id: &PackageId, force: bool) -> Result<u64, LoadError> {
        let (reply, rx) = oneshot::channel();
        let command = Command::Load {
            version: None,
            force,
            reply: Some(reply),
        };
        if !self.inner.submit(id, None, command) {
            return Err(LoadError::NotRegistered(id.clone()));
        }
        match rx.await {
            Ok(result) => result,
            Err(_) if self.inner.cancel.is_cancelled() => Err(LoadError::Cancelled),
            Err(_) => Err(LoadError::Removed(id.clone())),
        }
    }

    /// Remove a package. Returns `false` if it was not registered.
    ///
    /// Queries already holding a snapshot finish against it.
    pub async fn remove(&self, id: &PackageId) -> bool {
        let (reply, rx) = oneshot::channel();
        if !self.inner.submit(id, None, Command::Remove { reply: Some(reply) }) {
            return false;
        }
        let _ = rx.await;
        true
    }

    /// React to a resolved filesystem change. Only enqueues work.
    pub fn on_change_event(&self, event: ChangeEvent) -> Result<(), HandlerError> {
        if self.inner.cancel.is_cancelled() {
            return Err(HandlerError::Closed);
        }
        let key = self
            .inner
            .storage
            .key_for_path(&event.path)
            .ok_or_else(|| HandlerError::UnmappedPath(event.path.clone()))?;
        // Same rule as listings, or reconciliation would undo the event
        if !is_package_key(&key) {
            crate::debug!("registry"; "ignoring {} ({})", key, event.operation.label());
            return Ok(());
        }
        let id = PackageId::from_key(&key);

        crate::debug!("registry"; "{} {} ({})", event.operation.label(), id, key);
        match event.operation {
            // Modify of an untracked package is a missed create
            Operation::Create | Operation::Modify => {
                let command = Command::Load {
                    version: None,
                    force: false,
                    reply: None,
                };
                self.inner.submit(&id, Some(&key), command);
            }
            Operation::Delete => {
                self.inner.submit(&id, None, Command::Remove { reply: None });
            }
        }
        Ok(())
    }

    /// Snapshot of the generation currently published for `id`.
    ///
    /// Never waits on an in-progress reload. A `Failed` package with a
    /// previous generation still returns that generation.
    pub fn get(&self, id: &PackageId) -> Option<Snapshot<R>> {
        let entry = self.inner.entries.get(id)?;
        entry.handle.load_full().map(Snapshot::new)
    }

    /// Snapshots of every package with a published generation, by id.
    pub fn snapshots(&self) -> Vec<Snapshot<R>> {
        let mut snapshots: Vec<Snapshot<R>> = self
            .inner
            .entries
            .iter()
            .filter_map(|entry| entry.handle.load_full().map(Snapshot::new))
            .collect();
        snapshots.sort_by(|a, b| a.id().cmp(b.id()));
        snapshots
    }

    pub fn status(&self, id: &PackageId) -> Option<PackageInfo> {
        let entry = self.inner.entries.get(id).map(|e| Arc::clone(e.value()))?;
        Some(entry.info())
    }

    /// Metadata of every registered package, by id.
    pub fn list(&self) -> Vec<PackageInfo> {
        let entries: Vec<Arc<Entry<R>>> =
            self.inner.entries.iter().map(|e| Arc::clone(e.value())).collect();
        let mut infos: Vec<PackageInfo> = entries.iter().map(|e| e.info()).collect();
        infos.sort_by(|a, b| a.id.cmp(&b.id));
        infos
    }

    pub fn len(&self) -> usize {
        self.inner.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.entries.is_empty()
    }

    /// Resolves once no transition is queued or running, or on shutdown.
    pub async fn wait_idle(&self) {
        let mut rx = self.inner.in_flight.subscribe();
        tokio::select! {
            _ = rx.wait_for(|n| *n == 0) => {}
            _ = self.inner.cancel.cancelled() => {}
        }
    }

    /// Stop every worker. In-progress transitions revert. Idempotent.
    pub fn close(&self) {
        self.inner.cancel.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.cancel.is_cancelled()
    }
}

impl<S: StorageAccess, R: PackageRepository> ChangeHandler for PackageRegistry<S, R> {
    fn on_change(&self, event: ChangeEvent) -> Result<(), HandlerError> {
        self.on_change_event(event)
    }
}

impl<S: StorageAccess, R: PackageRepository> Inner<S, R> {
    /// Queue `command` on the worker for `id`.
    ///
    /// Loads with a `key` register the package if needed; everything else
    /// only reaches an existing entry. Returns `false` if nothing was queued.
    fn submit(self: &Arc<Self>, id: &PackageId, key: Option<&str>, mut command: Command) -> bool {
        loop {
            let entry = match (&command, key) {
                (Command::Load { .. }, Some(key)) => {
                    let entry = self.entry_or_insert(id, key);
                    entry.state.lock().source_key = key.to_string();
                    entry
                }
                _ => match self.entries.get(id) {
                    Some(entry) => Arc::clone(entry.value()),
                    None => return false,
                },
            };

            self.in_flight.send_modify(|n| *n += 1);
            match entry.tx.send(command) {
                Ok(()) => return true,
                Err(mpsc::error::SendError(returned)) => {
                    // Worker already evicted this entry; retry on a fresh one.
                    self.finish_one();
                    self.entries.remove_if(id, |_, e| Arc::ptr_eq(e, &entry));
                    command = returned;
                }
            }
        }
    }

    fn entry_or_insert(self: &Arc<Self>, id: &PackageId, key: &str) -> Arc<Entry<R>> {
        if let Some(entry) = self.entries.get(id) {
            return Arc::clone(entry.value());
        }

        let mut spawned = None;
        let entry = {
            let slot = self.entries.entry(id.clone()).or_insert_with(|| {
                let (tx, rx) = mpsc::unbounded_channel();
                let incarnation = self.incarnations.fetch_add(1, Ordering::Relaxed);
                let entry = Arc::new(Entry::new(id.clone(), incarnation, key.to_string(), tx));
                spawned = Some((Arc::clone(&entry), rx));
                entry
            });
            Arc::clone(slot.value())
        };

        if let Some((entry, rx)) = spawned {
            crate::debug!("registry"; "discovered {} ({})", id, key);
            tokio::spawn(worker::run(
                Arc::downgrade(self),
                entry,
                rx,
                self.cancel.clone(),
            ));
        }
        entry
    }

    fn finish_one(&self) {
        self.in_flight.send_modify(|n| *n = n.saturating_sub(1));
    }

    fn cache_path(&self, entry: &Entry<R>, generation: u64) -> PathBuf {
        self.config.cache_dir.join(format!(
            "{}.{}.{}.gpkg",
            entry.id.file_safe(),
            entry.incarnation,
            generation
        ))
    }

    fn report_gauges(&self) {
        let (mut loaded, mut ready) = (0, 0);
        for entry in self.entries.iter() {
            if entry.has_handle() {
                loaded += 1;
            }
            if entry.state.lock().status == PackageStatus::Ready {
                ready += 1;
            }
        }
        self.metrics.package_gauges(loaded, ready);
    }
}
