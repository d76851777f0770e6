//! Log output for the gateway process.
//!
//! `numgate start` runs for days and writes JSON lines to a rotating file so
//! sweeper passes and blocked sends can be searched later. Operator commands
//! (`send`, `sweep`, `release`) only print warnings to stderr, leaving stdout
//! clean for their JSON result.

use std::path::Path;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Prefix of the daily log files; the appender adds `.YYYY-MM-DD`.
pub const LOG_FILE_PREFIX: &str = "numgate.log";

/// Keeps the background log writer alive for the lifetime of `start`.
///
/// Hold it in `main` until shutdown finishes; dropping it early loses the
/// final sweep and drain messages.
pub struct LoggingGuard {
    _guard: WorkerGuard,
}

/// Install logging for the long-running gateway.
///
/// Creates `logs_dir` if needed and writes one file per day named
/// `numgate.log.YYYY-MM-DD`, plus human-readable lines on stderr. `RUST_LOG`
/// filters both; without it the gateway logs at `info`.
///
/// # Errors
///
/// Returns an error if the logs directory cannot be created.
pub fn init_production(logs_dir: &Path) -> anyhow::Result<LoggingGuard> {
    std::fs::create_dir_all(logs_dir).map_err(|e| {
        anyhow::anyhow!(
            "failed to create logs directory {}: {e}",
            logs_dir.display()
        )
    })?;

    let file_appender = tracing_appender::rolling::daily(logs_dir, LOG_FILE_PREFIX);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let json_layer = tracing_subscriber::fmt::layer()
        .json()
        .with_writer(non_blocking);

    let console_layer = tracing_subscriber::fmt::layer().with_writer(std::io::stderr);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(json_layer)
        .with(console_layer)
        .init();

    Ok(LoggingGuard { _guard: guard })
}

/// Install stderr-only logging for one-shot commands, at `warn` unless
/// `RUST_LOG` says otherwise.
pub fn init_cli() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}
