//! File logging
//!
//! The dashboard owns the terminal, so log output goes to a daily rolling
//! file only. `RUST_LOG` overrides the level picked from `-v`.

use std::path::PathBuf;

use anyhow::{Context, Result};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Keeps the background writer alive; logs are flushed when it drops
pub struct LogGuard {
    _file_guard: WorkerGuard,
    pub log_dir: PathBuf,
}

pub fn init_logging(log_dir: Option<PathBuf>, verbosity: u8) -> Result<LogGuard> {
    let log_dir = log_dir.unwrap_or_else(default_log_dir);
    std::fs::create_dir_all(&log_dir)
        .with_context(|| format!("cannot create log directory {}", log_dir.display()))?;

    let file_appender = tracing_appender::rolling::daily(&log_dir, "recomposable.log");
    let (non_blocking, file_guard) = tracing_appender::non_blocking(file_appender);

    let level = match verbosity {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("recomposable={level},recomposable_core={level}")));

    let file_layer = fmt::layer()
        .with_writer(non_blocking)
        .with_ansi(false)
        .with_target(true);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(file_layer)
        .try_init()
        .context("logging already initialized")?;

    tracing::debug!(log_dir = %log_dir.display(), verbosity, "logging initialized");

    Ok(LogGuard {
        _file_guard: file_guard,
        log_dir,
    })
}

/// `$XDG_STATE_HOME/recomposable` (or the platform equivalent), else the temp dir
pub fn default_log_dir() -> PathBuf {
    dirs::state_dir()
        .or_else(dirs::cache_dir)
        .unwrap_or_else(std::env::temp_dir)
        .join("recomposable")
}
