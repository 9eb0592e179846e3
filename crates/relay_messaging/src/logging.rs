//! Tracing setup for processes that host a hub.
//!
//! The library itself only emits `tracing` events. Binaries and tests pick
//! a sink here: the console, or a daily-rotated file. `RUST_LOG` always
//! wins over the filter passed in.

use std::path::Path;

use anyhow::{Context, Result};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::{EnvFilter, Layer, Registry, fmt, prelude::*};

/// Default filter when `RUST_LOG` is unset.
pub const DEFAULT_FILTER: &str = "info,relay_messaging=debug,relay_fsm=info";

/// File name prefix of the rotated log files.
pub const LOG_FILE_PREFIX: &str = "relay";

fn env_filter(fallback: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback))
}

/// Install `layer` under `filter` as the global subscriber.
fn install<L>(layer: L, filter: &str) -> Result<()>
where
    L: Layer<Registry> + Send + Sync + 'static,
{
    tracing_subscriber::registry()
        .with(layer.with_filter(env_filter(filter)))
        .try_init()
        .context("Failed to initialize logging")
}

fn file_layer<W>(writer: W) -> impl Layer<Registry> + Send + Sync + 'static
where
    W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
{
    fmt::layer().with_target(true).with_ansi(false).with_writer(writer)
}

/// Compact console logging.
pub fn init_logging(filter: &str) -> Result<()> {
    install(fmt::layer().with_target(false).compact(), filter)
}

/// Log to `<logs_dir>/relay.<date>`, rotated daily.
///
/// Keep the returned guard alive; dropping it flushes pending writes.
pub fn init_logging_to_dir(logs_dir: &Path, filter: &str) -> Result<WorkerGuard> {
    std::fs::create_dir_all(logs_dir)
        .with_context(|| format!("creating log directory {}", logs_dir.display()))?;

    let appender = tracing_appender::rolling::daily(logs_dir, LOG_FILE_PREFIX);
    let (writer, guard) = tracing_appender::non_blocking(appender);
    install(file_layer(writer), filter)?;
    Ok(guard)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_logging_to_dir_creates_directory() {
        let tmp = tempfile::tempdir().expect("Failed to create tempdir");
        let logs_dir = tmp.path().join("nested").join("logs");
        assert!(!logs_dir.exists());

        // Only one global subscriber per process; the directory is created
        // either way.
        let result = init_logging_to_dir(&logs_dir, "warn");
        assert!(logs_dir.exists());
        drop(result);
    }

    #[test]
    fn test_second_init_is_an_error_not_a_panic() {
        let tmp = tempfile::tempdir().expect("Failed to create tempdir");
        let _first = init_logging_to_dir(&tmp.path().join("a"), "info");

        let err = init_logging(DEFAULT_FILTER).unwrap_err();
        assert!(err.to_string().contains("logging"), "unexpected error: {err}");
    }

    #[test]
    fn test_env_filter_fallback() {
        for f in ["info", "debug", DEFAULT_FILTER, "relay_fsm=trace,warn"] {
            drop(env_filter(f));
        }
    }
}
