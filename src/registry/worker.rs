//! Per-package serialized worker.
//!
//! One task per registered id drains that id's command queue in order, so
//! at most one transition per package is ever in flight. Everything slow
//! (storage, open, index builds) happens here, off the published state.

use std::path::PathBuf;
use std::sync::{Arc, Weak};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::entry::{Command, Entry};
use super::handle::{PackageHandle, release_off_thread};
use super::retry::with_retry;
use super::{Inner, LoadError};
use crate::config::IndexPolicy;
use crate::core::{Layer, ObjectInfo, PackageId, PackageStatus};
use crate::ports::{PackageRepository, RepositoryError, StorageAccess, StorageOp};

/// Result of one load/reload transition.
enum Outcome {
    Published(u64),
    /// Stored version matches the published generation
    Unchanged(u64),
    /// The object no longer exists in storage
    Vanished,
    Failed(LoadError),
    Cancelled,
}

/// Staged work that has not touched published state yet.
enum Staged<R: PackageRepository> {
    Ready(PackageHandle<R>, ObjectInfo),
    Unchanged,
    Vanished,
}

pub(super) async fn run<S: StorageAccess, R: PackageRepository>(
    inner: Weak<Inner<S, R>>,
    entry: Arc<Entry<R>>,
    mut rx: mpsc::UnboundedReceiver<Command>,
    cancel: CancellationToken,
) {
    loop {
        let command = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            command = rx.recv() => match command {
                Some(command) => command,
                None => break,
            },
        };
        let Some(inner) = inner.upgrade() else { break };

        let evicted = match command {
            Command::Load {
                version,
                force,
                reply,
            } => {
                let (result, evicted) = match inner.transition(&entry, version, force).await {
                    Outcome::Published(generation) | Outcome::Unchanged(generation) => {
                        (Ok(generation), false)
                    }
                    Outcome::Failed(err) => (Err(err), false),
                    Outcome::Cancelled => (Err(LoadError::Cancelled), false),
                    Outcome::Vanished => {
                        inner.evict(&entry, &mut rx);
                        (Err(LoadError::Removed(entry.id.clone())), true)
                    }
                };
                if let Some(reply) = reply {
                    let _ = reply.send(result);
                }
                evicted
            }
            Command::Remove { reply } => {
                inner.evict(&entry, &mut rx);
                if let Some(reply) = reply {
                    let _ = reply.send(());
                }
                true
            }
        };

        inner.report_gauges();
        inner.finish_one();
        if evicted {
            break;
        }
    }
    crate::debug!("registry"; "worker for {} stopped", entry.id);
}

impl<S: StorageAccess, R: PackageRepository> Inner<S, R> {
    async fn transition(&self, entry: &Entry<R>, hint: Option<ObjectInfo>, force: bool) -> Outcome {
        let reloading = entry.has_handle();
        let (key, prior_status, generation, recorded) = {
            let mut state = entry.state.lock();
            let prior = state.status;
            state.status = if reloading {
                PackageStatus::Reloading
            } else {
                PackageStatus::Loading
            };
            let recorded = if force || !reloading {
                None
            } else {
                state.version.clone()
            };
            (state.source_key.clone(), prior, state.generation + 1, recorded)
        };

        let staged = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(LoadError::Cancelled),
            staged = self.stage(entry, &key, generation, hint, recorded) => staged,
        };

        match staged {
            Ok(Staged::Ready(handle, version)) => Outcome::Published(self.publish(entry, handle, version)),
            Ok(Staged::Unchanged) => {
                let mut state = entry.state.lock();
                state.status = PackageStatus::Ready;
                state.last_error = None;
                crate::debug!("registry"; "{} unchanged at generation {}", entry.id, state.generation);
                Outcome::Unchanged(state.generation)
            }
            Ok(Staged::Vanished) => Outcome::Vanished,
            Err(LoadError::Cancelled) => {
                self.discard_download(entry, &key, generation);
                entry.state.lock().status = prior_status;
                crate::log!("registry"; "{} load cancelled, status back to {}", entry.id, prior_status.label());
                Outcome::Cancelled
            }
            Err(err) => {
                self.discard_download(entry, &key, generation);
                let mut state = entry.state.lock();
                state.status = PackageStatus::Failed;
                state.last_error = Some(err.to_string());
                if reloading {
                    crate::log!(
                        "registry";
                        "{} reload failed, still serving generation {}: {}",
                        entry.id, state.generation, err
                    );
                } else {
                    crate::log!("registry"; "{} load failed: {}", entry.id, err);
                }
                Outcome::Failed(err)
            }
        }
    }

    /// Fetch and open the next generation without touching published state.
    async fn stage(
        &self,
        entry: &Entry<R>,
        key: &str,
        generation: u64,
        hint: Option<ObjectInfo>,
        recorded: Option<ObjectInfo>,
    ) -> Result<Staged<R>, LoadError> {
        let retry = &self.config.retry;
        let version = match hint {
            Some(version) => version,
            None => {
                let stat = with_retry(retry, &self.cancel, self.metrics.as_ref(), StorageOp::Stat, key, || {
                    self.storage.stat(key)
                })
                .await?;
                match stat {
                    Some(version) => version,
                    None => return Ok(Staged::Vanished),
                }
            }
        };
        if recorded.is_some_and(|r| r.same_version(&version)) {
            return Ok(Staged::Unchanged);
        }

        let (path, owned_file) = match self.storage.local_path(key) {
            Some(path) => (path, None),
            None => {
                let destination = self.cache_path(entry, generation);
                with_retry(retry, &self.cancel, self.metrics.as_ref(), StorageOp::Download, key, || {
                    self.storage.download(key, &destination)
                })
                .await?;
                (destination.clone(), Some(destination))
            }
        };

        let repository = Arc::clone(&self.repository);
        let id = entry.id.clone();
        let source_key = key.to_string();
        let policy = self.config.index_policy;
        let handle = tokio::task::spawn_blocking(move || {
            open_package(repository, id, source_key, generation, path, owned_file, policy)
        })
        .await
        .map_err(|e| LoadError::Internal(format!("load task failed: {e}")))??;

        Ok(Staged::Ready(handle, version))
    }

    /// Swap in the new generation. The previous one closes once its last
    /// snapshot drops.
    fn publish(&self, entry: &Entry<R>, handle: PackageHandle<R>, version: ObjectInfo) -> u64 {
        let generation = handle.generation();
        let layers = handle.layers().len();

        let previous = {
            let mut state = entry.state.lock();
            let previous = entry.handle.swap(Some(Arc::new(handle)));
            state.status = PackageStatus::Ready;
            state.generation = generation;
            state.last_error = None;
            state.version = Some(version);
            previous
        };
        crate::log!("registry"; "{} ready: generation {}, {} layer(s)", entry.id, generation, layers);

        release_off_thread(previous);
        generation
    }

    /// Mark removed, drop from the map and forward anything queued behind
    /// the removal to a fresh entry.
    fn evict(self: &Arc<Self>, entry: &Arc<Entry<R>>, rx: &mut mpsc::UnboundedReceiver<Command>) {
        let key = {
            let mut state = entry.state.lock();
            state.status = PackageStatus::Removed;
            state.source_key.clone()
        };
        self.entries.remove_if(&entry.id, |_, e| Arc::ptr_eq(e, entry));
        release_off_thread(entry.handle.swap(None));
        crate::log!("registry"; "removed {}", entry.id);

        rx.close();
        while let Ok(command) = rx.try_recv() {
            self.submit(&entry.id, Some(&key), command);
            self.finish_one();
        }
    }

    fn discard_download(&self, entry: &Entry<R>, key: &str, generation: u64) {
        if self.storage.local_path(key).is_some() {
            return;
        }
        let destination = self.cache_path(entry, generation);
        for path in [destination.with_extension("part"), destination] {
            let _ = std::fs::remove_file(path);
        }
    }
}

/// Open, enumerate and index one generation. Blocking.
fn open_package<R: PackageRepository>(
    repository: Arc<R>,
    id: PackageId,
    source_key: String,
    generation: u64,
    path: PathBuf,
    owned_file: Option<PathBuf>,
    policy: IndexPolicy,
) -> Result<PackageHandle<R>, LoadError> {
    let conn = repository.open(&id, &path)?;
    // From here on, dropping the handle closes the connection.
    let mut handle = PackageHandle::new(id, generation, source_key, Arc::clone(&repository), conn, owned_file);

    let mut layers = repository.layers(handle.connection())?;
    for layer in &mut layers {
        layer.has_spatial_index = ensure_index(repository.as_ref(), &handle, layer, policy)?;
    }
    handle.layers = layers;
    Ok(handle)
}

fn ensure_index<R: PackageRepository>(
    repository: &R,
    handle: &PackageHandle<R>,
    layer: &Layer,
    policy: IndexPolicy,
) -> Result<bool, LoadError> {
    let conn = handle.connection();
    match repository.has_spatial_index(conn, layer) {
        Ok(true) => return Ok(true),
        Ok(false) => {}
        Err(e) => crate::debug!("registry"; "{}: index check on `{}` failed: {}", handle.id(), layer.name, e),
    }

    let Err(err) = repository.create_spatial_index(conn, layer) else {
        crate::debug!("registry"; "{}: built spatial index for `{}`", handle.id(), layer.name);
        return Ok(true);
    };
    match policy {
        IndexPolicy::Degrade => {
            crate::log!(
                "registry";
                "{}: serving layer `{}` without spatial index: {}",
                handle.id(), layer.name, err
            );
            Ok(false)
        }
        IndexPolicy::Fail => Err(LoadError::IndexBuild {
            layer: layer.name.clone(),
            message: match err {
                RepositoryError::IndexBuild { message, .. } => message,
                other => other.to_string(),
            },
        }),
    }
}
