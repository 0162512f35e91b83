use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Instant;

use rustc_hash::FxHashMap;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use super::{PackageError, QueryError, QueryRequest, QueryResponse, SkippedLayer};
use crate::core::{Coordinate, Feature, Layer, PackageId, Srid};
use crate::ports::{CoordinateTransformer, MetricsSink, PackageRepository, StorageAccess, TransformError};
use crate::registry::{PackageRegistry, Snapshot};

/// Fans point queries out over the registry's packages.
pub struct QueryDispatcher<S, R: PackageRepository, T> {
    registry: PackageRegistry<S, R>,
    transformer: Arc<T>,
    metrics: Arc<dyn MetricsSink>,
}

impl<S, R: PackageRepository, T> Clone for QueryDispatcher<S, R, T> {
    fn clone(&self) -> Self {
        Self {
            registry: self.registry.clone(),
            transformer: Arc::clone(&self.transformer),
            metrics: Arc::clone(&self.metrics),
        }
    }
}

/// Work for one package: its snapshot and the layers it can answer.
struct Plan<R: PackageRepository> {
    snapshot: Snapshot<R>,
    layers: Vec<(Layer, Coordinate)>,
}

enum SubQuery {
    Done(Vec<Feature>),
    Failed(String),
    Cancelled,
}

struct Finished {
    order: usize,
    id: PackageId,
    generation: u64,
    outcome: SubQuery,
}

impl<S, R, T> QueryDispatcher<S, R, T>
where
    S: StorageAccess,
    R: PackageRepository,
    T: CoordinateTransformer,
{
    pub fn new(registry: PackageRegistry<S, R>, transformer: Arc<T>, metrics: Arc<dyn MetricsSink>) -> Self {
        Self {
            registry,
            transformer,
            metrics,
        }
    }

    pub fn registry(&self) -> &PackageRegistry<S, R> {
        &self.registry
    }

    /// Query one package (`request.package_id`) or every package with a
    /// published generation.
    ///
    /// On cancellation, sub-queries that have not started are dropped and
    /// running ones stop at the next layer; their snapshots are released
    /// either way.
    pub async fn query_point(
        &self,
        request: &QueryRequest,
        cancel: &CancellationToken,
    ) -> Result<QueryResponse, QueryError> {
        if cancel.is_cancelled() {
            return Err(QueryError::Cancelled);
        }

        let snapshots = match &request.package_id {
            Some(id) => match self.registry.get(id) {
                Some(snapshot) => vec![snapshot],
                None if self.registry.status(id).is_some() => {
                    return Err(QueryError::PackageUnavailable(id.clone()));
                }
                None => return Err(QueryError::PackageNotFound(id.clone())),
            },
            None => self.registry.snapshots(),
        };

        let mut response = QueryResponse {
            packages_queried: snapshots.len(),
            ..Default::default()
        };
        let points = self.reproject_all(&request.coordinate, &snapshots);

        let mut pending = Vec::with_capacity(snapshots.len());
        for snapshot in snapshots {
            match plan(&snapshot, &points, &mut response.skipped_layers) {
                Ok(layers) => pending.push(Plan { snapshot, layers }),
                Err(error) => {
                    response.package_errors.push(error);
                    // May be the last reference to a replaced generation
                    snapshot.release_in_background();
                }
            }
        }

        let mut tasks = JoinSet::new();
        for (order, plan) in pending.into_iter().enumerate() {
            let include_geometry = request.include_geometry;
            let cancel = cancel.clone();
            let metrics = Arc::clone(&self.metrics);

            tasks.spawn_blocking(move || {
                let start = Instant::now();
                let outcome = panic::catch_unwind(AssertUnwindSafe(|| run_plan(&plan, include_geometry, &cancel)))
                    .unwrap_or_else(|_| SubQuery::Failed("sub-query panicked".to_string()));
                let finished = Finished {
                    order,
                    id: plan.snapshot.id().clone(),
                    generation: plan.snapshot.generation(),
                    outcome,
                };
                match &finished.outcome {
                    SubQuery::Done(_) => metrics.query_completed(&finished.id, start.elapsed(), true),
                    SubQuery::Failed(_) => metrics.query_completed(&finished.id, start.elapsed(), false),
                    SubQuery::Cancelled => {}
                }
                finished
            });
        }

        let mut finished = Vec::with_capacity(tasks.len());
        loop {
            let joined = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    tasks.abort_all();
                    return Err(QueryError::Cancelled);
                }
                joined = tasks.join_next() => joined,
            };
            match joined {
                None => break,
                Some(Ok(done)) => finished.push(done),
                // Panics are caught inside the task; only aborts land here.
                Some(Err(e)) => crate::debug!("query"; "sub-query task ended early: {}", e),
            }
        }

        finished.sort_by_key(|f| f.order);
        for done in finished {
            match done.outcome {
                SubQuery::Done(features) => {
                    response.features.extend(features.into_iter().map(|mut feature| {
                        if !request.include_geometry {
                            feature.geometry = None;
                        }
                        feature
                    }));
                }
                SubQuery::Failed(message) => {
                    crate::log!("query"; "{} (generation {}) failed: {}", done.id, done.generation, message);
                    response.package_errors.push(PackageError {
                        package_id: done.id,
                        generation: done.generation,
                        message,
                    });
                }
                SubQuery::Cancelled => return Err(QueryError::Cancelled),
            }
        }
        response.package_errors.sort_by(|a, b| a.package_id.cmp(&b.package_id));

        crate::debug!(
            "query";
            "point ({}, {}) {}: {} feature(s) from {} package(s)",
            request.coordinate.x, request.coordinate.y, request.coordinate.srid,
            response.features.len(), response.packages_queried
        );
        Ok(response)
    }

    /// The request point in every SRID any targeted layer uses, transformed
    /// once per distinct pair.
    fn reproject_all(
        &self,
        source: &Coordinate,
        snapshots: &[Snapshot<R>],
    ) -> FxHashMap<Srid, Result<Coordinate, TransformError>> {
        let mut points = FxHashMap::default();
        for layer in snapshots.iter().flat_map(|s| s.layers()) {
            points
                .entry(layer.srid)
                .or_insert_with(|| self.reproject(source, layer.srid));
        }
        points
    }

    fn reproject(&self, source: &Coordinate, target: Srid) -> Result<Coordinate, TransformError> {
        if source.srid == target {
            return Ok(*source);
        }
        if !self.transformer.is_supported(source.srid, target) {
            return Err(TransformError::Unsupported {
                from: source.srid,
                to: target,
            });
        }
        self.transformer.transform(source, target)
    }
}

/// Pair each layer with its reprojected point. Unsupported pairs skip the
/// layer; a failed transform fails the package.
fn plan<R: PackageRepository>(
    snapshot: &Snapshot<R>,
    points: &FxHashMap<Srid, Result<Coordinate, TransformError>>,
    skipped: &mut Vec<SkippedLayer>,
) -> Result<Vec<(Layer, Coordinate)>, PackageError> {
    let mut layers = Vec::with_capacity(snapshot.layers().len());
    for layer in snapshot.layers() {
        match points.get(&layer.srid) {
            Some(Ok(point)) => layers.push((layer.clone(), *point)),
            Some(Err(TransformError::Unsupported { from, to })) => {
                crate::debug!("query"; "{}: skipping `{}`, no transform {} -> {}", snapshot.id(), layer.name, from, to);
                skipped.push(SkippedLayer {
                    package_id: snapshot.id().clone(),
                    layer: layer.name.clone(),
                    from: *from,
                    to: *to,
                });
            }
            Some(Err(e)) => {
                return Err(PackageError {
                    package_id: snapshot.id().clone(),
                    generation: snapshot.generation(),
                    message: e.to_string(),
                });
            }
            None => {}
        }
    }
    Ok(layers)
}

/// Blocking: query every planned layer of one snapshot.
fn run_plan<R: PackageRepository>(plan: &Plan<R>, include_geometry: bool, cancel: &CancellationToken) -> SubQuery {
    let snapshot = &plan.snapshot;
    let mut features = Vec::new();
    for (layer, point) in &plan.layers {
        if cancel.is_cancelled() {
            return SubQuery::Cancelled;
        }
        match snapshot
            .repository()
            .query_point(snapshot.connection(), layer, point, include_geometry)
        {
            Ok(found) => features.extend(found),
            Err(e) => return SubQuery::Failed(format!("layer `{}`: {}", layer.name, e)),
        }
    }
    SubQuery::Done(features)
}
