//! Service configuration loaded from TOML.
//!
//! # Module Structure
//!
//! ```text
//! config/
//! ├── section/       # Configuration section definitions
//! │   ├── registry   # [registry], [registry.retry]
//! │   └── watch      # [watch]
//! ├── error          # ConfigError
//! └── mod.rs         # ServiceConfig (this file)
//! ```
//!
//! Relative paths (`watch.roots`, `registry.cache_dir`) are resolved against
//! the directory holding the config file.

mod error;
pub mod section;

pub use error::ConfigError;
pub use section::{IndexPolicy, RegistrySectionConfig, RetryConfig, WatchConfig};

use serde::{Deserialize, Serialize};
use std::{
    fs,
    path::{Path, PathBuf},
};

// ============================================================================
// root configuration
// ============================================================================

/// Root configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Directory relative paths are resolved against (internal use only)
    #[serde(skip)]
    pub root: PathBuf,

    /// Change watcher settings
    #[serde(default)]
    pub watch: WatchConfig,

    /// Registry lifecycle settings
    #[serde(default)]
    pub registry: RegistrySectionConfig,
}

impl ServiceConfig {
    /// Load, resolve and validate a config file.
    pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
        let content =
            fs::read_to_string(path).map_err(|err| ConfigError::Io(path.to_path_buf(), err))?;

        let (mut config, ignored) = Self::parse_with_ignored(&content)?;
        if !ignored.is_empty() {
            crate::log!("config"; "ignoring unknown fields in {}: {}", path.display(), ignored.join(", "));
        }

        let root = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        config.set_root(&root);
        config.validate()?;
        Ok(config)
    }

    /// Parse TOML content without resolving paths.
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let (config, _) = Self::parse_with_ignored(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Parse TOML content, collecting any unknown fields.
    fn parse_with_ignored(content: &str) -> Result<(Self, Vec<String>), ConfigError> {
        let mut ignored = Vec::new();
        let deserializer = toml::Deserializer::new(content);
        let config = serde_ignored::deserialize(deserializer, |path: serde_ignored::Path| {
            ignored.push(path.to_string());
        })?;
        Ok((config, ignored))
    }

    /// Set the base directory and resolve relative paths against it.
    pub fn set_root(&mut self, root: &Path) {
        self.root = root.to_path_buf();
        for dir in &mut self.watch.roots {
            *dir = resolve(root, dir);
        }
        self.registry.cache_dir = resolve(root, &self.registry.cache_dir);
    }

    /// Reject values the watcher or registry cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let fail = |msg: &str| Err(ConfigError::Validation(msg.to_string()));

        if self.watch.debounce_ms == 0 {
            return fail("watch.debounce_ms must be greater than 0");
        }
        if self.watch.tick_ms == 0 {
            return fail("watch.tick_ms must be greater than 0");
        }

        let retry = &self.registry.retry;
        if retry.max_attempts == 0 {
            return fail("registry.retry.max_attempts must be at least 1");
        }
        if !retry.multiplier.is_finite() || retry.multiplier < 1.0 {
            return fail("registry.retry.multiplier must be >= 1.0");
        }
        if retry.initial_backoff_ms > retry.max_backoff_ms {
            return fail("registry.retry.initial_backoff_ms exceeds max_backoff_ms");
        }
        Ok(())
    }
}

fn resolve(root: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        root.join(path)
    }
}

// ============================================================================
// Test Helpers (available to all modules via `use crate::config::test_*`)
// ============================================================================

/// Parse config content, failing on unknown fields.
#[cfg(test)]
pub fn test_parse_config(content: &str) -> ServiceConfig {
    let (parsed, ignored) = ServiceConfig::parse_with_ignored(content).unwrap();
    assert!(
        ignored.is_empty(),
        "test config has unknown fields: {:?}",
        ignored
    );
    parsed
}

// ============================================================================
// tests
// ============================================================================
