//! Logging setup shared by Eventflow binaries and tests.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

pub mod logging;

pub use logging::{init_logging, init_test_tracing};

/// Output format of the console layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human readable, multi-line
    #[default]
    Pretty,
    /// One JSON object per event
    Json,
}

/// Configuration for initializing logging
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Service name attached to the startup event
    pub service_name: String,
    /// Filter directive (e.g., "info,eventflow_core=debug"), overridden by `RUST_LOG`
    pub log_filter: String,
    /// Console format
    pub format: LogFormat,
    /// Daily-rotated JSON log file, if any
    pub log_file: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            service_name: "eventflow".to_string(),
            log_filter: "info".to_string(),
            format: LogFormat::Pretty,
            log_file: None,
        }
    }
}

impl LoggingConfig {
    /// Config with the given filter directive
    pub fn with_filter(mut self, filter: impl Into<String>) -> Self {
        self.log_filter = filter.into();
        self
    }
}
