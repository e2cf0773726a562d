//! `tracing` setup and the bridge from [`LogLevel`] to `tracing` events.
//!
//! Everything goes to stderr so stdout stays parseable for `--json` output.

use tracing_subscriber::EnvFilter;

use crate::models::LogLevel;

/// Install the global subscriber. `RUST_LOG` overrides `level` when set.
///
/// Safe to call more than once; later calls are ignored.
pub fn init(level: LogLevel) {
    let default = match level {
        LogLevel::Trace => "trace",
        LogLevel::Debug => "debug",
        LogLevel::Info => "info",
        LogLevel::Warn => "warn",
        LogLevel::Error | LogLevel::Critical => "error",
        LogLevel::Off => "off",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .compact()
        .try_init();
}

/// Emit `message` as a `tracing` event at the closest matching level.
pub(crate) fn emit(level: LogLevel, plugin: Option<&str>, message: &str) {
    let plugin = plugin.unwrap_or("core");
    match level {
        LogLevel::Trace => tracing::trace!(plugin, "{}", message),
        LogLevel::Debug => tracing::debug!(plugin, "{}", message),
        LogLevel::Info => tracing::info!(plugin, "{}", message),
        LogLevel::Warn => tracing::warn!(plugin, "{}", message),
        LogLevel::Error => tracing::error!(plugin, "{}", message),
        LogLevel::Critical => tracing::error!(plugin, critical = true, "{}", message),
        LogLevel::Off => {}
    }
}
