use std::path::{Path, PathBuf};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use crate::config::LoggingConfig;

/// Install the global subscriber: console output (plain or JSON) plus a
/// daily-rotated file when a log directory is configured and writable.
///
/// Returns false when another global subscriber was already installed; the
/// configured outputs are then not applied.
pub fn init_logging(config: &LoggingConfig) -> bool {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!("{},convoy=debug,sqlx=warn", config.level))
    });

    let log_dir: Option<PathBuf> = std::env::var("CONVOY_LOG_DIR")
        .ok()
        .map(PathBuf::from)
        .or_else(|| config.dir.clone());

    let file_layer = log_dir.as_deref().and_then(|dir| {
        // `rolling::daily` panics if it cannot create the first file
        if let Err(e) = check_writable(dir) {
            eprintln!(
                "Warning: Could not write to log directory {} ({}), file logging disabled",
                dir.display(),
                e
            );
            return None;
        }
        let file_appender = tracing_appender::rolling::daily(dir, "convoy.log");
        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
        // Lives for the rest of the process
        Box::leak(Box::new(guard));

        Some(
            tracing_subscriber::fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false)
                .with_target(true),
        )
    });

    let (json_layer, plain_layer) = if config.json {
        (
            Some(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_current_span(false)
                    .with_target(true),
            ),
            None,
        )
    } else {
        (
            None,
            Some(
                tracing_subscriber::fmt::layer()
                    .with_target(true)
                    .with_thread_ids(false)
                    .with_file(false)
                    .with_line_number(false),
            ),
        )
    };

    let file_logging_enabled = file_layer.is_some();
    if let Err(e) = tracing_subscriber::registry()
        .with(filter)
        .with(json_layer)
        .with(plain_layer)
        .with(file_layer)
        .try_init()
    {
        tracing::warn!(error = %e, "global subscriber already set, logging config not applied");
        eprintln!("Warning: logging already initialized ({}), convoy log settings ignored", e);
        return false;
    }

    if let (true, Some(dir)) = (file_logging_enabled, log_dir) {
        eprintln!("Logging to: {}/convoy.log", dir.display());
    }
    true
}

fn check_writable(dir: &Path) -> std::io::Result<()> {
    std::fs::create_dir_all(dir)?;
    let probe = dir.join(".convoy_write_test");
    std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&probe)?;
    let _ = std::fs::remove_file(&probe);
    Ok(())
}
