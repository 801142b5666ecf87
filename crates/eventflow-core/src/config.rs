use crate::domain::flow::{Flow, FlowDocument, DEFAULT_TTL_MS};
use crate::CoreError;
use eventflow_mapping::constants::{ConfigReader, FsResourceReader};
use eventflow_mapping::model::lookup_in;
use eventflow_mapping::{MappingEvaluator, PluginRegistry, Value};
use eventflow_monitoring::LoggingConfig;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::warn;

const ENV_DEFAULT_TTL_MS: &str = "EVENTFLOW_DEFAULT_TTL_MS";
const ENV_RESOURCE_ROOT: &str = "EVENTFLOW_RESOURCE_ROOT";
const ENV_CLASSPATH_ROOT: &str = "EVENTFLOW_CLASSPATH_ROOT";
const ENV_LOG_FILTER: &str = "EVENTFLOW_LOG_FILTER";

fn default_ttl_ms() -> u64 {
    DEFAULT_TTL_MS
}

fn default_classpath_root() -> PathBuf {
    PathBuf::from("resources")
}

fn default_config_values() -> serde_json::Value {
    serde_json::Value::Object(serde_json::Map::new())
}

fn default_log_filter() -> String {
    "info".to_string()
}

/// Engine-wide settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Time-to-live for flows that do not set one
    #[serde(default = "default_ttl_ms")]
    pub default_ttl_ms: u64,

    /// Base directory for `file(...)` constants
    #[serde(default)]
    pub resource_root: Option<PathBuf>,

    /// Base directory for `classpath(...)` constants
    #[serde(default = "default_classpath_root")]
    pub classpath_root: PathBuf,

    /// Values answering `map(config.key)`
    #[serde(default = "default_config_values")]
    pub config_values: serde_json::Value,

    /// Log filter directive
    #[serde(default = "default_log_filter")]
    pub log_filter: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_ttl_ms: default_ttl_ms(),
            resource_root: None,
            classpath_root: default_classpath_root(),
            config_values: default_config_values(),
            log_filter: default_log_filter(),
        }
    }
}

impl EngineConfig {
    /// Defaults overridden by `EVENTFLOW_*` environment variables
    pub fn load() -> Self {
        let mut config = Self::default();
        config.apply_overrides(|key| std::env::var(key).ok());
        config
    }

    /// Parse from JSON text, then apply environment overrides
    pub fn from_json(text: &str) -> Result<Self, CoreError> {
        let mut config: Self = serde_json::from_str(text)?;
        config.apply_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// Apply overrides read through `lookup`
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(raw) = lookup(ENV_DEFAULT_TTL_MS) {
            match raw.trim().parse::<u64>() {
                Ok(ttl) if ttl > 0 => self.default_ttl_ms = ttl,
                _ => warn!(variable = ENV_DEFAULT_TTL_MS, value = %raw, "Ignoring invalid override"),
            }
        }
        if let Some(root) = lookup(ENV_RESOURCE_ROOT).filter(|v| !v.trim().is_empty()) {
            self.resource_root = Some(PathBuf::from(root));
        }
        if let Some(root) = lookup(ENV_CLASSPATH_ROOT).filter(|v| !v.trim().is_empty()) {
            self.classpath_root = PathBuf::from(root);
        }
        if let Some(filter) = lookup(ENV_LOG_FILTER).filter(|v| !v.trim().is_empty()) {
            self.log_filter = filter;
        }
    }

    /// Reject settings the engine cannot run with
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.default_ttl_ms == 0 {
            return Err(CoreError::ConfigurationError(
                "default_ttl_ms must be positive".to_string(),
            ));
        }
        if !self.config_values.is_object() {
            return Err(CoreError::ConfigurationError(
                "config_values must be an object".to_string(),
            ));
        }
        Ok(())
    }

    /// Build a template, falling back to `default_ttl_ms` when the document sets no ttl
    pub fn flow_from_document(&self, document: FlowDocument) -> Flow {
        Flow::from_document(document, self.default_ttl_ms)
    }

    /// Resource reader rooted at the configured directories
    pub fn resource_reader(&self) -> FsResourceReader {
        FsResourceReader::new(self.resource_root.clone(), self.classpath_root.clone())
    }

    /// Logging settings carrying this configuration's filter
    pub fn logging(&self) -> LoggingConfig {
        LoggingConfig::default().with_filter(self.log_filter.clone())
    }

    /// Mapping evaluator wired to this configuration
    pub fn evaluator(&self, plugins: Arc<PluginRegistry>) -> MappingEvaluator {
        MappingEvaluator::new(plugins, Arc::new(self.clone()), Arc::new(self.resource_reader()))
    }
}

impl ConfigReader for EngineConfig {
    fn get_property(&self, key: &str) -> Option<Value> {
        lookup_in(&Value::from(self.config_values.clone()), key)
    }
}
