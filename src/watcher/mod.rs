//! Change Watcher
//!
//! Turns noisy raw filesystem notifications into one [`ChangeEvent`] per
//! package file per quiet period.
//!
//! Architecture:
//! ```text
//! notify thread → ingest task → Debouncer (shared, mutex) ← resolver task → ChangeHandler
//! ```
//!
//! The ingest task records raw operations as they arrive. The resolver wakes
//! on a fixed tick, independent of the debounce window, and hands every
//! change quiet for at least the window to the handler.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use notify::RecommendedWatcher;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::WatchConfig;
use crate::core::ChangeEvent;
use crate::utils::normalize_path;

// Raw notify event -> per-path operations on package files.
mod classify;
// Pure coalescing and quiet-period timing.
mod debouncer;
// Watch root attach/re-attach lifecycle.
mod watch_roots;


use debouncer::Debouncer;
use watch_roots::WatchRoots;

const RAW_CHANNEL_BUFFER: usize = 256;

/// Watcher setup errors
#[derive(Debug, Error)]
pub enum WatchError {
    /// A configured root cannot be observed; other roots are unaffected
    #[error("cannot watch `{path}`")]
    Setup {
        path: PathBuf,
        #[source]
        source: notify::Error,
    },

    /// Not a single root could be observed
    #[error("no watch root could be established")]
    NoRoots,

    #[error("failed to create watcher")]
    Notify(#[from] notify::Error),
}

/// The receiving side's reaction to a change failed.
#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("path `{0}` does not map to a storage key")]
    UnmappedPath(PathBuf),

    #[error("handler is shut down")]
    Closed,
}

/// Receives resolved change events.
///
/// Called from the resolver loop, so implementations only enqueue work.
/// Failures are logged by the watcher and the event is not retried.
pub trait ChangeHandler: Send + Sync + 'static {
    fn on_change(&self, event: ChangeEvent) -> Result<(), HandlerError>;
}

impl<F> ChangeHandler for F
where
    F: Fn(ChangeEvent) -> Result<(), HandlerError> + Send + Sync + 'static,
{
    fn on_change(&self, event: ChangeEvent) -> Result<(), HandlerError> {
        self(event)
    }
}

/// Running watcher. Dropping it stops observation.
pub struct ChangeWatcher {
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
    pending: Arc<Mutex<Debouncer>>,
}

impl ChangeWatcher {
    /// Start observing `roots`.
    ///
    /// Roots that cannot be observed are logged and skipped (and re-attached
    /// later if they appear). Fails only when no root at all is observable.
    /// Must be called inside a tokio runtime.
    pub fn start<H: ChangeHandler>(
        roots: Vec<PathBuf>,
        config: &WatchConfig,
        handler: Arc<H>,
        cancel: CancellationToken,
    ) -> Result<Self, WatchError> {
        // notify does not support async: bridge through a std channel
        let (notify_tx, notify_rx) = std::sync::mpsc::channel();
        let mut watcher = notify::recommended_watcher(move |res| {
            let _ = notify_tx.send(res);
        })?;

        let roots: Vec<PathBuf> = roots.iter().map(|r| normalize_path(r)).collect();
        let mut watch_roots = WatchRoots::new(roots);
        for err in watch_roots.attach_all(&mut watcher) {
            crate::log!("watch"; "{}: {}", err, error_source(&err));
        }
        if watch_roots.attached_count() == 0 {
            return Err(WatchError::NoRoots);
        }
        crate::debug!("watch"; "watching {} root(s)", watch_roots.attached_count());

        let cancel = cancel.child_token();
        let pending = Arc::new(Mutex::new(Debouncer::new()));
        let (raw_tx, raw_rx) = mpsc::channel::<notify::Event>(RAW_CHANNEL_BUFFER);

        std::thread::spawn(move || {
            while let Ok(result) = notify_rx.recv() {
                match result {
                    Ok(event) => {
                        if raw_tx.blocking_send(event).is_err() {
                            break; // Receiver dropped
                        }
                    }
                    Err(e) => crate::log!("watch"; "notify error: {}", e),
                }
            }
        });

        let ingest = tokio::spawn(ingest_loop(raw_rx, Arc::clone(&pending), cancel.clone()));
        let resolver = tokio::spawn(resolve_loop(
            ResolverState {
                watcher,
                watch_roots,
                debounce: config.debounce(),
                tick: config.tick(),
            },
            Arc::clone(&pending),
            handler,
            cancel.clone(),
        ));

        Ok(Self {
            cancel,
            tasks: vec![ingest, resolver],
            pending,
        })
    }

    /// Stop observation and both loops. Idempotent.
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    pub fn is_stopped(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Stop and wait for both loops to exit.
    pub async fn shutdown(mut self) {
        self.stop();
        for task in self.tasks.drain(..) {
            let _ = task.await;
        }
    }

    /// Number of paths still inside their quiet period.
    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }
}

impl Drop for ChangeWatcher {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

fn error_source(err: &WatchError) -> String {
    std::error::Error::source(err).map_or_else(String::new, |s| s.to_string())
}

async fn ingest_loop(
    mut raw_rx: mpsc::Receiver<notify::Event>,
    pending: Arc<Mutex<Debouncer>>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            event = raw_rx.recv() => {
                let Some(event) = event else { break };
                let ops = classify::raw_operations(&event);
                if ops.is_empty() {
                    continue;
                }
                crate::debug!("watch"; "raw notify: {:?} {:?}", event.kind, event.paths);

                let now = Instant::now();
                let mut debouncer = pending.lock();
                for (path, op) in ops {
                    debouncer.record(path, op, now);
                }
            }
        }
    }
    crate::debug!("watch"; "ingest stopped");
}

/// Resolver-owned state. Owning the notify watcher here ties its lifetime
/// to the resolver loop.
struct ResolverState {
    watcher: RecommendedWatcher,
    watch_roots: WatchRoots,
    debounce: Duration,
    tick: Duration,
}

async fn resolve_loop<H: ChangeHandler>(
    mut state: ResolverState,
    pending: Arc<Mutex<Debouncer>>,
    handler: Arc<H>,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(state.tick);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                state.watch_roots.maintain(&mut state.watcher);

                // Lock released before dispatch.
                let ready = {
                    let mut debouncer = pending.lock();
                    if debouncer.is_empty() {
                        continue;
                    }
                    debouncer.take_expired(Instant::now(), state.debounce)
                };

                for event in ready {
                    dispatch(handler.as_ref(), event);
                }
            }
        }
    }
    crate::debug!("watch"; "resolver stopped");
}

fn dispatch<H: ChangeHandler>(handler: &H, event: ChangeEvent) {
    crate::debug!("watch"; "{}: {}", event.operation.label(), event.path.display());
    let path = event.path.clone();
    if let Err(e) = handler.on_change(event) {
        crate::log!("watch"; "handler failed for {}: {}", path.display(), e);
    }
}
