//! `[watch]` section configuration.
//!
//! # Example
//!
//! ```toml
//! [watch]
//! roots = ["data", "/srv/shared/packages"]
//! debounce_ms = 500           # quiet period after the last change to a file
//! tick_ms = 100               # how often pending changes are checked
//! ```

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Change watcher settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WatchConfig {
    /// Directories observed recursively for package changes.
    pub roots: Vec<PathBuf>,

    /// Quiet time after the last raw event on a path before it resolves.
    pub debounce_ms: u64,

    /// Resolver tick, independent of the debounce window.
    pub tick_ms: u64,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            roots: Vec::new(),
            debounce_ms: 500,
            tick_ms: 100,
        }
    }
}

impl WatchConfig {
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_ms)
    }
}
