//! Tracing setup for the driver.
//!
//! A rotated file appender plus an env-filtered fmt layer, initialized
//! once per process.

use std::path::Path;
use std::sync::OnceLock;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

use crate::error::{CoreError, CoreResult};

static LOG_GUARD: OnceLock<WorkerGuard> = OnceLock::new();

/// Initialize process-wide logging, writing to `<log_dir>/ctnrd.log`.
///
/// Safe to call more than once; only the first call installs the
/// subscriber; later calls are no-ops.
pub fn init_logging(log_dir: &Path) -> CoreResult<()> {
    std::fs::create_dir_all(log_dir)?;

    let file_appender = tracing_appender::rolling::never(log_dir, "ctnrd.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(non_blocking)
        .with_ansi(false)
        .finish();

    if tracing::subscriber::set_global_default(subscriber).is_err() {
        // Another part of the process already installed a subscriber; not
        // an error for a library crate.
        return Ok(());
    }

    LOG_GUARD.set(guard).map_err(|_| {
        CoreError::Internal("logging already initialized from a different path".into())
    })?;

    Ok(())
}
