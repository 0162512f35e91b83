//! In-memory collaborators for tests.
//!
//! Package files are small JSON documents ([`PackageDoc`]) so the fake
//! repository can parse real bytes from real paths: a download, a local
//! file and a corrupt replacement all go through the same code as in
//! production.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::thread::ThreadId;
use std::time::{Duration, SystemTime};

use parking_lot::{Condvar, Mutex};
use rustc_hash::{FxHashMap, FxHashSet};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::config::RegistrySectionConfig;
use crate::core::{Attributes, Coordinate, Feature, Layer, ObjectInfo, PackageId, Srid};
use crate::ports::{
    ByteStream, CoordinateTransformer, MetricsSink, PackageRepository, RepositoryError,
    StorageAccess, StorageError, StorageOp, TransformError,
};
use crate::registry::PackageRegistry;

// ============================================================================
// Package documents
// ============================================================================

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PackageDoc {
    pub layers: Vec<LayerDoc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LayerDoc {
    pub name: String,
    pub srid: u32,
    pub indexed: bool,
    pub features: Vec<FeatureDoc>,
}

/// Axis-aligned box feature.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeatureDoc {
    pub bbox: [f64; 4],
    pub attributes: Attributes,
}

impl PackageDoc {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an indexed layer whose features are `(bbox, name)` boxes.
    pub fn layer(mut self, name: &str, srid: Srid, boxes: &[([f64; 4], &str)]) -> Self {
        let features = boxes
            .iter()
            .map(|(bbox, label)| {
                let mut attributes = Attributes::new();
                attributes.insert("name".into(), serde_json::Value::from(*label));
                FeatureDoc {
                    bbox: *bbox,
                    attributes,
                }
            })
            .collect();
        self.layers.push(LayerDoc {
            name: name.into(),
            srid: srid.0,
            indexed: true,
            features,
        });
        self
    }

    /// Mark the most recently added layer as lacking a spatial index.
    pub fn unindexed(mut self) -> Self {
        if let Some(layer) = self.layers.last_mut() {
            layer.indexed = false;
        }
        self
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        serde_json::to_vec(self).unwrap()
    }
}

/// Single-layer package with one 10x10 box at the origin.
pub fn simple_package(layer: &str) -> Vec<u8> {
    PackageDoc::new()
        .layer(layer, Srid::WGS84, &[([0.0, 0.0, 10.0, 10.0], layer)])
        .to_bytes()
}

// ============================================================================
// MemoryStorage
// ============================================================================

/// Remote-like storage: nothing is on local disk, every load downloads.
#[derive(Default)]
pub struct MemoryStorage {
    objects: Mutex<BTreeMap<String, (ObjectInfo, Vec<u8>)>>,
    versions: AtomicU64,
    /// Transient failures to inject into the next downloads
    failing_downloads: AtomicU32,
    downloads: AtomicU32,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store (or replace) an object under a fresh etag.
    pub fn put(&self, key: &str, bytes: Vec<u8>) {
        let version = self.versions.fetch_add(1, Ordering::SeqCst) + 1;
        let info = ObjectInfo::new(key, bytes.len() as u64)
            .with_etag(format!("v{version}"))
            .with_last_modified(SystemTime::UNIX_EPOCH + Duration::from_secs(version));
        self.objects.lock().insert(key.to_string(), (info, bytes));
    }

    pub fn delete(&self, key: &str) {
        self.objects.lock().remove(key);
    }

    pub fn fail_next_downloads(&self, count: u32) {
        self.failing_downloads.store(count, Ordering::SeqCst);
    }

    pub fn download_attempts(&self) -> u32 {
        self.downloads.load(Ordering::SeqCst)
    }

    fn bytes(&self, key: &str) -> Result<Vec<u8>, StorageError> {
        self.objects
            .lock()
            .get(key)
            .map(|(_, bytes)| bytes.clone())
            .ok_or_else(|| StorageError::NotFound(key.to_string()))
    }
}

impl StorageAccess for MemoryStorage {
    async fn list(&self) -> Result<Vec<ObjectInfo>, StorageError> {
        Ok(self.objects.lock().values().map(|(info, _)| info.clone()).collect())
    }

    async fn reader(&self, key: &str) -> Result<ByteStream, StorageError> {
        self.downloads.fetch_add(1, Ordering::SeqCst);
        let injected = self
            .failing_downloads
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(StorageError::Transient("503 slow down".into()));
        }
        Ok(Box::new(std::io::Cursor::new(self.bytes(key)?)))
    }

    async fn exists(&self, key: &str) -> Result<bool, StorageError> {
        Ok(self.objects.lock().contains_key(key))
    }
}

// ============================================================================
// FakeRepository
// ============================================================================

/// Blocks callers until released.
#[derive(Default)]
pub struct Gate {
    open: Mutex<bool>,
    cond: Condvar,
}

impl Gate {
    pub fn wait(&self) {
        let mut open = self.open.lock();
        while !*open {
            self.cond.wait(&mut open);
        }
    }

    pub fn release(&self) {
        *self.open.lock() = true;
        self.cond.notify_all();
    }
}

pub struct FakeConnection {
    id: PackageId,
    doc: PackageDoc,
    built_indexes: Mutex<FxHashSet<String>>,
}

/// Repository over [`PackageDoc`] files with failure and blocking hooks.
#[derive(Default)]
pub struct FakeRepository {
    open_gate: Mutex<Option<Arc<Gate>>>,
    failing_indexes: Mutex<FxHashSet<String>>,
    failing_queries: Mutex<FxHashSet<PackageId>>,
    opens_started: AtomicUsize,
    active_opens: Mutex<FxHashMap<PackageId, usize>>,
    max_concurrent_opens: AtomicUsize,
    closed: AtomicUsize,
    close_threads: Mutex<Vec<ThreadId>>,
    index_builds: AtomicUsize,
}

impl FakeRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every following `open` blocks until the returned gate is released.
    pub fn hold_opens(&self) -> Arc<Gate> {
        let gate = Arc::new(Gate::default());
        *self.open_gate.lock() = Some(Arc::clone(&gate));
        gate
    }

    pub fn stop_holding(&self) {
        if let Some(gate) = self.open_gate.lock().take() {
            gate.release();
        }
    }

    pub fn fail_index_for(&self, layer: &str) {
        self.failing_indexes.lock().insert(layer.to_string());
    }

    pub fn fail_queries_for(&self, id: &PackageId) {
        self.failing_queries.lock().insert(id.clone());
    }

    pub fn opens_started(&self) -> usize {
        self.opens_started.load(Ordering::SeqCst)
    }

    /// Highest number of simultaneous opens seen for a single id.
    pub fn max_concurrent_opens(&self) -> usize {
        self.max_concurrent_opens.load(Ordering::SeqCst)
    }

    pub fn closed(&self) -> usize {
        self.closed.load(Ordering::SeqCst)
    }

    /// Threads each `close` ran on, in order.
    pub fn close_threads(&self) -> Vec<ThreadId> {
        self.close_threads.lock().clone()
    }

    pub fn index_builds(&self) -> usize {
        self.index_builds.load(Ordering::SeqCst)
    }

    fn enter(&self, id: &PackageId) {
        let mut active = self.active_opens.lock();
        let count = active.entry(id.clone()).or_default();
        *count += 1;
        self.max_concurrent_opens.fetch_max(*count, Ordering::SeqCst);
    }

    fn exit(&self, id: &PackageId) {
        if let Some(count) = self.active_opens.lock().get_mut(id) {
            *count -= 1;
        }
    }
}

impl PackageRepository for FakeRepository {
    type Connection = FakeConnection;

    fn open(&self, id: &PackageId, path: &Path) -> Result<FakeConnection, RepositoryError> {
        self.enter(id);
        self.opens_started.fetch_add(1, Ordering::SeqCst);
        let gate = self.open_gate.lock().clone();
        if let Some(gate) = gate {
            gate.wait();
        }
        // Widen the window in which overlapping opens would be observed.
        std::thread::sleep(Duration::from_millis(2));

        let result = std::fs::read(path)
            .map_err(RepositoryError::Io)
            .and_then(|bytes| {
                serde_json::from_slice::<PackageDoc>(&bytes)
                    .map_err(|e| RepositoryError::Corrupt(e.to_string()))
            });
        self.exit(id);

        Ok(FakeConnection {
            id: id.clone(),
            doc: result?,
            built_indexes: Mutex::new(FxHashSet::default()),
        })
    }

    fn close(&self, _conn: FakeConnection) {
        self.close_threads.lock().push(std::thread::current().id());
        self.closed.fetch_add(1, Ordering::SeqCst);
    }

    fn layers(&self, conn: &FakeConnection) -> Result<Vec<Layer>, RepositoryError> {
        Ok(conn
            .doc
            .layers
            .iter()
            .map(|l| Layer::new(&l.name, "geom", Srid(l.srid)))
            .collect())
    }

    fn has_spatial_index(&self, conn: &FakeConnection, layer: &Layer) -> Result<bool, RepositoryError> {
        let declared = conn
            .doc
            .layers
            .iter()
            .any(|l| l.name == layer.name && l.indexed);
        Ok(declared || conn.built_indexes.lock().contains(&layer.name))
    }

    fn create_spatial_index(&self, conn: &FakeConnection, layer: &Layer) -> Result<(), RepositoryError> {
        if self.failing_indexes.lock().contains(&layer.name) {
            return Err(RepositoryError::IndexBuild {
                layer: layer.name.clone(),
                message: "disk full".into(),
            });
        }
        self.index_builds.fetch_add(1, Ordering::SeqCst);
        conn.built_indexes.lock().insert(layer.name.clone());
        Ok(())
    }

    fn query_point(
        &self,
        conn: &FakeConnection,
        layer: &Layer,
        point: &Coordinate,
        _include_geometry: bool,
    ) -> Result<Vec<Feature>, RepositoryError> {
        if self.failing_queries.lock().contains(&conn.id) {
            return Err(RepositoryError::Query("database is locked".into()));
        }
        let Some(doc) = conn.doc.layers.iter().find(|l| l.name == layer.name) else {
            return Err(RepositoryError::Query(format!("no such table: {}", layer.name)));
        };

        Ok(doc
            .features
            .iter()
            .filter(|f| {
                let [min_x, min_y, max_x, max_y] = f.bbox;
                (min_x..=max_x).contains(&point.x) && (min_y..=max_y).contains(&point.y)
            })
            .map(|f| Feature {
                package_id: conn.id.clone(),
                layer: layer.name.clone(),
                attributes: f.attributes.clone(),
                // Always returned so the dispatcher's stripping is observable
                geometry: Some(bbox_geometry(f.bbox)),
            })
            .collect())
    }
}

fn bbox_geometry([min_x, min_y, max_x, max_y]: [f64; 4]) -> serde_json::Value {
    serde_json::json!({
        "type": "Polygon",
        "coordinates": [[[min_x, min_y], [max_x, min_y], [max_x, max_y], [min_x, max_y], [min_x, min_y]]],
    })
}

// ============================================================================
// Transformer and metrics
// ============================================================================

/// Supports only the pairs it was given, as a scale on both axes.
#[derive(Default)]
pub struct TableTransformer {
    scales: FxHashMap<(Srid, Srid), f64>,
    /// Advertised as supported, but every transform fails
    broken: FxHashSet<(Srid, Srid)>,
    gate: Option<Arc<Gate>>,
    calls: AtomicUsize,
    last_thread: Mutex<Option<ThreadId>>,
}

impl TableTransformer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_pair(mut self, from: Srid, to: Srid, scale: f64) -> Self {
        self.scales.insert((from, to), scale);
        self
    }

    pub fn with_broken_pair(mut self, from: Srid, to: Srid) -> Self {
        self.broken.insert((from, to));
        self
    }

    /// Every transform blocks until `gate` is released.
    pub fn held_by(mut self, gate: Arc<Gate>) -> Self {
        self.gate = Some(gate);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Thread the most recent transform ran on.
    pub fn last_thread(&self) -> Option<ThreadId> {
        *self.last_thread.lock()
    }
}

impl CoordinateTransformer for TableTransformer {
    fn is_supported(&self, from: Srid, to: Srid) -> bool {
        from == to || self.scales.contains_key(&(from, to)) || self.broken.contains(&(from, to))
    }

    fn transform(&self, coord: &Coordinate, to: Srid) -> Result<Coordinate, TransformError> {
        *self.last_thread.lock() = Some(std::thread::current().id());
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(gate) = &self.gate {
            gate.wait();
        }
        if self.broken.contains(&(coord.srid, to)) {
            return Err(TransformError::Failed("grid file missing".into()));
        }
        let scale = self
            .scales
            .get(&(coord.srid, to))
            .ok_or(TransformError::Unsupported { from: coord.srid, to })?;
        Ok(Coordinate::new(coord.x * scale, coord.y * scale, to))
    }
}

#[derive(Default)]
pub struct RecordingMetrics {
    pub queries: Mutex<Vec<(PackageId, bool)>>,
    pub storage_ops: Mutex<Vec<(StorageOp, bool)>>,
    pub gauges: Mutex<Option<(usize, usize)>>,
}

impl MetricsSink for RecordingMetrics {
    fn query_completed(&self, package: &PackageId, _elapsed: Duration, ok: bool) {
        self.queries.lock().push((package.clone(), ok));
    }

    fn storage_operation(&self, op: StorageOp, _elapsed: Duration, ok: bool) {
        self.storage_ops.lock().push((op, ok));
    }

    fn package_gauges(&self, loaded: usize, ready: usize) {
        *self.gauges.lock() = Some((loaded, ready));
    }
}

// ============================================================================
// Registry fixtures
// ============================================================================

pub struct Fixture {
    pub storage: Arc<MemoryStorage>,
    pub repository: Arc<FakeRepository>,
    pub metrics: Arc<RecordingMetrics>,
    pub registry: PackageRegistry<MemoryStorage, FakeRepository>,
    pub cancel: CancellationToken,
    pub cache: tempfile::TempDir,
}

impl Fixture {
    pub fn new() -> Self {
        Self::with_config(|_| {})
    }

    /// Registry over fresh fakes, with fast retries and a temporary cache.
    pub fn with_config(adjust: impl FnOnce(&mut RegistrySectionConfig)) -> Self {
        let cache = tempfile::TempDir::new().unwrap();
        let mut config = RegistrySectionConfig {
            cache_dir: cache.path().to_path_buf(),
            ..Default::default()
        };
        config.retry.initial_backoff_ms = 1;
        config.retry.max_backoff_ms = 4;
        adjust(&mut config);

        let storage = Arc::new(MemoryStorage::new());
        let repository = Arc::new(FakeRepository::new());
        let metrics = Arc::new(RecordingMetrics::default());
        let cancel = CancellationToken::new();
        let registry = PackageRegistry::new(
            Arc::clone(&storage),
            Arc::clone(&repository),
            metrics.clone(),
            config,
            cancel.clone(),
        );

        Self {
            storage,
            repository,
            metrics,
            registry,
            cancel,
            cache,
        }
    }

    /// Put `packages` into storage and load them all.
    pub async fn populated(packages: &[(&str, Vec<u8>)]) -> Self {
        let fixture = Self::new();
        for (key, bytes) in packages {
            fixture.storage.put(key, bytes.clone());
        }
        fixture.registry.refresh().await.unwrap();
        fixture.registry.wait_idle().await;
        fixture
    }

    pub fn cache_files(&self) -> Vec<PathBuf> {
        let mut files: Vec<PathBuf> = std::fs::read_dir(self.cache.path())
            .unwrap()
            .map(|e| e.unwrap().path())
            .collect();
        files.sort();
        files
    }
}

/// Poll `condition` for up to five seconds.
pub async fn eventually(mut condition: impl FnMut() -> bool) -> bool {
    for _ in 0..500 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}
