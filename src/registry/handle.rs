use std::fmt;
use std::ops::Deref;
use std::path::PathBuf;
use std::sync::Arc;

use crate::core::{Layer, PackageId};
use crate::ports::PackageRepository;

/// One opened, query-ready generation of a package.
///
/// Owned by its registry entry. Queries borrow it through [`Snapshot`];
/// the connection is closed when the last reference drops, so a replaced
/// generation stays valid until every query reading it has finished.
pub struct PackageHandle<R: PackageRepository> {
    id: PackageId,
    generation: u64,
    source_key: String,
    pub(super) layers: Vec<Layer>,
    conn: Option<R::Connection>,
    repository: Arc<R>,
    /// Downloaded copy deleted together with the handle
    owned_file: Option<PathBuf>,
}

impl<R: PackageRepository> PackageHandle<R> {
    pub(super) fn new(
        id: PackageId,
        generation: u64,
        source_key: String,
        repository: Arc<R>,
        conn: R::Connection,
        owned_file: Option<PathBuf>,
    ) -> Self {
        Self {
            id,
            generation,
            source_key,
            layers: Vec::new(),
            conn: Some(conn),
            repository,
            owned_file,
        }
    }

    pub fn id(&self) -> &PackageId {
        &self.id
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn source_key(&self) -> &str {
        &self.source_key
    }

    /// Layers in the package's native order, fully enumerated.
    pub fn layers(&self) -> &[Layer] {
        &self.layers
    }

    pub fn repository(&self) -> &R {
        &self.repository
    }

    pub fn connection(&self) -> &R::Connection {
        match &self.conn {
            Some(conn) => conn,
            None => unreachable!("connection is only taken on drop"),
        }
    }
}

impl<R: PackageRepository> Drop for PackageHandle<R> {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.repository.close(conn);
        }
        if let Some(file) = self.owned_file.take()
            && let Err(e) = std::fs::remove_file(&file)
            && e.kind() != std::io::ErrorKind::NotFound
        {
            crate::log!("registry"; "failed to remove {}: {}", file.display(), e);
        }
        crate::debug!("registry"; "released {} generation {}", self.id, self.generation);
    }
}

impl<R: PackageRepository> fmt::Debug for PackageHandle<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PackageHandle")
            .field("id", &self.id)
            .field("generation", &self.generation)
            .field("layers", &self.layers.len())
            .finish_non_exhaustive()
    }
}

/// Closing may block on the repository, so the last local reference is
/// dropped on the blocking pool.
pub(super) fn release_off_thread<R: PackageRepository>(handle: Option<Arc<PackageHandle<R>>>) {
    if let Some(handle) = handle {
        tokio::task::spawn_blocking(move || drop(handle));
    }
}

/// Borrowed, reference-counted view of one generation.
///
/// Holding a snapshot keeps that generation alive; dropping it (or calling
/// [`release`](Self::release)) gives the reference back.
pub struct Snapshot<R: PackageRepository> {
    handle: Arc<PackageHandle<R>>,
}

impl<R: PackageRepository> Snapshot<R> {
    pub(super) fn new(handle: Arc<PackageHandle<R>>) -> Self {
        Self { handle }
    }

    /// Give the reference back explicitly.
    ///
    /// Runs the close in place if this was the last reference; async
    /// callers use [`release_in_background`](Self::release_in_background).
    pub fn release(self) {}

    /// Give the reference back from the blocking pool, so a close it
    /// triggers never runs on an async worker. Must be called inside a
    /// tokio runtime.
    pub fn release_in_background(self) {
        release_off_thread(Some(self.handle));
    }

    /// References currently held on this generation, the registry's included
    /// while it is still published.
    pub fn holders(&self) -> usize {
        Arc::strong_count(&self.handle)
    }
}

impl<R: PackageRepository> Deref for Snapshot<R> {
    type Target = PackageHandle<R>;

    fn deref(&self) -> &Self::Target {
        &self.handle
    }
}

impl<R: PackageRepository> Clone for Snapshot<R> {
    fn clone(&self) -> Self {
        Self {
            handle: Arc::clone(&self.handle),
        }
    }
}

impl<R: PackageRepository> fmt::Debug for Snapshot<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Snapshot").field(&*self.handle).finish()
    }
}
