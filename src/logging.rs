//! Logging setup for the command-line front end.
//!
//! Journald on Linux when available, otherwise a daily-rolling file. The
//! library only emits `tracing` events and never installs a subscriber.

use anyhow::Result;
use std::path::PathBuf;
use std::sync::OnceLock;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Environment variable holding the filter directive, e.g. `PRISMSORT_LOG=debug`
/// or `PRISMSORT_LOG=prismsort::duplicates=trace`.
pub const LOG_ENV: &str = "PRISMSORT_LOG";

static GUARD: OnceLock<WorkerGuard> = OnceLock::new();

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Default directory for the file backend.
pub fn default_log_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("prismsort")
        .join("logs")
}

/// Initialize the logging system. Call once at startup.
pub fn init(log_dir: Option<PathBuf>) -> Result<()> {
    #[cfg(target_os = "linux")]
    {
        if let Ok(journald_layer) = tracing_journald::layer() {
            tracing_subscriber::registry()
                .with(env_filter())
                .with(journald_layer)
                .try_init()?;

            tracing::debug!("Logging initialized with journald backend");
            return Ok(());
        }
    }

    let log_dir = log_dir.unwrap_or_else(default_log_dir);
    std::fs::create_dir_all(&log_dir)?;

    let file_appender = tracing_appender::rolling::daily(&log_dir, "prismsort.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
    // Dropping the guard would stop the writer thread
    let _ = GUARD.set(guard);

    tracing_subscriber::registry()
        .with(env_filter())
        .with(fmt::layer().with_writer(non_blocking).with_ansi(false))
        .try_init()?;

    tracing::debug!("Logging initialized with file backend at {:?}", log_dir);
    Ok(())
}
