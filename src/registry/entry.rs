use std::time::SystemTime;

use arc_swap::ArcSwapOption;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};

use super::LoadError;
use super::handle::PackageHandle;
use crate::core::{Layer, ObjectInfo, PackageId, PackageStatus};
use crate::ports::PackageRepository;

pub(super) type LoadReply = oneshot::Sender<Result<u64, LoadError>>;

/// Work for a package's serialized worker.
#[derive(Debug)]
pub(super) enum Command {
    /// Load, or reload when a handle is already published.
    ///
    /// `version` comes from a storage listing (looked up when absent); a
    /// version matching the published handle's skips the reload unless
    /// `force` is set.
    Load {
        version: Option<ObjectInfo>,
        force: bool,
        reply: Option<LoadReply>,
    },
    Remove {
        reply: Option<oneshot::Sender<()>>,
    },
}

/// Mutable metadata of a package, short lock only.
#[derive(Debug)]
pub(super) struct EntryState {
    pub(super) source_key: String,
    pub(super) status: PackageStatus,
    /// Generation of the published handle, 0 before the first publish
    pub(super) generation: u64,
    pub(super) last_error: Option<String>,
    /// Storage version of the published handle
    pub(super) version: Option<ObjectInfo>,
}

/// Registry entry: metadata, published handle and the worker queue.
pub(super) struct Entry<R: PackageRepository> {
    pub(super) id: PackageId,
    /// Distinguishes a re-discovered package from its removed predecessor
    pub(super) incarnation: u64,
    pub(super) handle: ArcSwapOption<PackageHandle<R>>,
    pub(super) state: Mutex<EntryState>,
    pub(super) tx: mpsc::UnboundedSender<Command>,
}

impl<R: PackageRepository> Entry<R> {
    pub(super) fn new(
        id: PackageId,
        incarnation: u64,
        source_key: String,
        tx: mpsc::UnboundedSender<Command>,
    ) -> Self {
        Self {
            id,
            incarnation,
            handle: ArcSwapOption::empty(),
            state: Mutex::new(EntryState {
                source_key,
                status: PackageStatus::Discovered,
                generation: 0,
                last_error: None,
                version: None,
            }),
            tx,
        }
    }

    pub(super) fn has_handle(&self) -> bool {
        self.handle.load().is_some()
    }

    pub(super) fn info(&self) -> PackageInfo {
        // Publication swaps the handle under the state lock
        let state = self.state.lock();
        let handle = self.handle.load_full();
        PackageInfo {
            id: self.id.clone(),
            source_key: state.source_key.clone(),
            status: state.status,
            generation: state.generation,
            layers: handle.as_ref().map(|h| h.layers().to_vec()).unwrap_or_default(),
            has_handle: handle.is_some(),
            last_error: state.last_error.clone(),
            last_modified: state.version.as_ref().and_then(|v| v.last_modified),
            etag: state.version.as_ref().and_then(|v| v.etag.clone()),
        }
    }
}

/// Read-only view of a package's registry metadata.
#[derive(Debug, Clone, Serialize)]
pub struct PackageInfo {
    pub id: PackageId,
    pub source_key: String,
    pub status: PackageStatus,
    pub generation: u64,
    pub layers: Vec<Layer>,
    /// A generation is published and serving queries
    pub has_handle: bool,
    pub last_error: Option<String>,
    #[serde(skip)]
    pub last_modified: Option<SystemTime>,
    pub etag: Option<String>,
}
