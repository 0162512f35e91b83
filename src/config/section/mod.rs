//! Configuration section definitions.

mod registry;
mod watch;

pub use registry::{IndexPolicy, RegistrySectionConfig, RetryConfig};
pub use watch::WatchConfig;
