//! Structured logging using tracing.
//!
//! Console output is pretty for development or JSON for log aggregation, with
//! an optional JSON file layer rotated daily.

use anyhow::{anyhow, Context};
use std::path::Path;
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::{LogFormat, LoggingConfig};

/// Initialize structured logging.
///
/// The returned guard flushes the file layer on drop and must be held for
/// the life of the process.
pub fn init_logging(config: &LoggingConfig) -> anyhow::Result<Option<WorkerGuard>> {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.log_filter))
        .with_context(|| format!("Invalid log filter: {}", config.log_filter))?;

    let console = match config.format {
        LogFormat::Json => fmt::layer()
            .json()
            .with_current_span(true)
            .with_thread_ids(true)
            .with_file(true)
            .with_line_number(true)
            .boxed(),
        LogFormat::Pretty => fmt::layer()
            .pretty()
            .with_target(true)
            .with_thread_ids(true)
            .with_file(true)
            .with_line_number(true)
            .boxed(),
    };

    let (file_layer, guard) = match &config.log_file {
        Some(log_file) => {
            let (directory, prefix) = split_log_path(log_file)?;
            let appender = RollingFileAppender::new(Rotation::DAILY, directory, prefix);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer()
                .json()
                .with_current_span(true)
                .with_ansi(false)
                .with_thread_ids(true)
                .with_writer(writer);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(console)
        .with(file_layer)
        .try_init()
        .context("Failed to set global default subscriber")?;

    info!(
        service_name = %config.service_name,
        log_format = ?config.format,
        log_file = ?config.log_file,
        "Logging initialized"
    );
    Ok(guard)
}

fn split_log_path(log_file: &Path) -> anyhow::Result<(&Path, &std::ffi::OsStr)> {
    let prefix = log_file
        .file_name()
        .ok_or_else(|| anyhow!("Log file path has no file name: {}", log_file.display()))?;
    let directory = log_file
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    Ok((directory, prefix))
}

/// Initialize tracing for tests, writing through the test harness.
///
/// Safe to call from every test; only the first call installs a subscriber.
pub fn init_test_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .with_test_writer()
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ffi::OsStr;

    #[test]
    fn test_split_log_path() {
        let (dir, prefix) = split_log_path(Path::new("/var/log/eventflow.log")).unwrap();
        assert_eq!(dir, Path::new("/var/log"));
        assert_eq!(prefix, OsStr::new("eventflow.log"));

        let (dir, _) = split_log_path(Path::new("engine.log")).unwrap();
        assert_eq!(dir, Path::new("."));

        assert!(split_log_path(Path::new("/")).is_err());
    }

    #[test]
    fn test_init_logging_installs_once() {
        let dir = tempfile::tempdir().unwrap();
        let config = LoggingConfig {
            format: LogFormat::Json,
            log_file: Some(dir.path().join("engine.log")),
            ..LoggingConfig::default()
        };
        // Another test in this binary may already own the global subscriber.
        match init_logging(&config) {
            Ok(guard) => assert!(guard.is_some()),
            Err(e) => assert!(e.to_string().contains("global default subscriber")),
        }
    }
}
