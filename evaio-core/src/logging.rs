//! Log output setup.
//!
//! The backend itself only emits `tracing` events. Embedders that have no
//! subscriber of their own can install a formatted one here; `RUST_LOG`
//! overrides the configured level when set.

use tracing_subscriber::EnvFilter;

use crate::config::{LogConfig, LogFormat};

/// Install a global `fmt` subscriber. Returns `false` if one was already set.
pub fn init(config: &LogConfig) -> bool {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.level.as_str()));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true);

    let result = match config.format {
        LogFormat::Full => builder.try_init(),
        LogFormat::Compact => builder.compact().try_init(),
    };
    result.is_ok()
}
