/// Configuration management for the process platform
///
/// Handles the platform descriptor (which engines to start) and the per-engine
/// configuration contract handed to the lifecycle controller. Defaults follow
/// ENV_VAR conventions so the binary can run in containers without a file.

use crate::error::{PlatformError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Main platform configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlatformConfig {
    /// Engines started when the platform boots, in declaration order
    pub engines: Vec<ProcessEngineConfig>,
}

/// Inbound configuration contract for a single process engine
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProcessEngineConfig {
    /// Unique engine name (e.g., "default")
    pub name: String,
    /// sqlx SQLite URL of the engine datastore (e.g., "sqlite://data/default.db")
    pub datasource: String,
    /// Whether this engine answers lookups for archives without an explicit target
    #[serde(default)]
    pub is_default: bool,
    /// Named engine properties
    #[serde(default)]
    pub properties: EngineProperties,
}

/// Named engine properties read by the lifecycle controller
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EngineProperties {
    /// Apply pending schema deltas during start
    pub auto_schema_update: bool,
    /// Whether the engine manages identities itself
    pub identity_used: bool,
    /// History level: none / activity / audit / full
    pub history: HistoryLevel,
    /// Start the job executor together with the engine
    pub activate_job_executor: bool,
    /// Optional prefix for every engine table
    pub table_prefix: Option<String>,
    /// Job executor tuning
    pub job_executor: JobExecutorSettings,
}

impl Default for EngineProperties {
    fn default() -> Self {
        Self {
            auto_schema_update: false,
            identity_used: true,
            history: HistoryLevel::Audit,
            activate_job_executor: false,
            table_prefix: None,
            job_executor: JobExecutorSettings::default(),
        }
    }
}

/// Acquisition tuning for the job executor
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct JobExecutorSettings {
    /// Maximum number of jobs locked by one acquisition cycle
    pub max_jobs_per_acquisition: u32,
    /// Poll interval between acquisition cycles
    pub wait_time_ms: u64,
    /// How long an acquired job stays locked to this executor
    pub lock_time_ms: u64,
}

/// Upper bound for `lock_time_ms`, one hundred years
pub const MAX_LOCK_TIME_MS: u64 = 100 * 365 * 24 * 60 * 60 * 1000;

impl JobExecutorSettings {
    /// Reject lock times an expiration timestamp cannot hold
    pub fn check_lock_time(lock_time_ms: u64) -> Result<()> {
        if lock_time_ms > MAX_LOCK_TIME_MS {
            return Err(PlatformError::Validation(format!(
                "lock_time_ms {} exceeds the maximum of {}",
                lock_time_ms, MAX_LOCK_TIME_MS
            )));
        }
        Ok(())
    }
}

impl Default for JobExecutorSettings {
    fn default() -> Self {
        Self {
            max_jobs_per_acquisition: 3,
            wait_time_ms: 5 * 1000,
            lock_time_ms: 5 * 60 * 1000,
        }
    }
}

/// History level controlling which history events reach the handler
///
/// Levels are cumulative: each level records everything the previous one does.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "lowercase")]
pub enum HistoryLevel {
    None,
    Activity,
    Audit,
    Full,
}

impl HistoryLevel {
    /// Lowercase name as used in descriptors
    pub fn as_str(&self) -> &'static str {
        match self {
            HistoryLevel::None => "none",
            HistoryLevel::Activity => "activity",
            HistoryLevel::Audit => "audit",
            HistoryLevel::Full => "full",
        }
    }
}

impl fmt::Display for HistoryLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for HistoryLevel {
    type Err = PlatformError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "none" => Ok(HistoryLevel::None),
            "activity" => Ok(HistoryLevel::Activity),
            "audit" => Ok(HistoryLevel::Audit),
            "full" => Ok(HistoryLevel::Full),
            other => Err(PlatformError::Validation(format!(
                "Unknown history level '{}', expected one of none, activity, audit, full",
                other
            ))),
        }
    }
}

impl ProcessEngineConfig {
    /// Engine configuration with default properties
    pub fn new(name: impl Into<String>, datasource: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            datasource: datasource.into(),
            is_default: false,
            properties: EngineProperties::default(),
        }
    }

    /// Engine backed by a private in-memory SQLite database
    pub fn in_memory(name: impl Into<String>) -> Self {
        let mut config = Self::new(name, "sqlite::memory:");
        config.properties.auto_schema_update = true;
        config
    }

    /// Mark as the platform default engine
    pub fn with_default(mut self, is_default: bool) -> Self {
        self.is_default = is_default;
        self
    }

    /// Set the history level
    pub fn with_history(mut self, history: HistoryLevel) -> Self {
        self.properties.history = history;
        self
    }

    /// Activate the job executor on start
    pub fn with_job_executor(mut self, activate: bool) -> Self {
        self.properties.activate_job_executor = activate;
        self
    }

    /// Prefix every engine table name
    pub fn with_table_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.properties.table_prefix = Some(prefix.into());
        self
    }

    /// Reject configurations the controller cannot start
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(PlatformError::Validation(
                "Process engine name must not be empty".to_string(),
            ));
        }
        if self.datasource.trim().is_empty() {
            return Err(PlatformError::Validation(format!(
                "Process engine '{}' has no datasource",
                self.name
            )));
        }
        if let Some(prefix) = &self.properties.table_prefix {
            if !prefix.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
                return Err(PlatformError::Validation(format!(
                    "Invalid table prefix '{}' for process engine '{}'",
                    prefix, self.name
                )));
            }
        }
        JobExecutorSettings::check_lock_time(self.properties.job_executor.lock_time_ms)?;
        if self.properties.job_executor.max_jobs_per_acquisition == 0 {
            return Err(PlatformError::Validation(format!(
                "Process engine '{}': max_jobs_per_acquisition must be at least 1",
                self.name
            )));
        }
        Ok(())
    }
}

impl PlatformConfig {
    /// Descriptor named by `BPM_PLATFORM_CONFIG`, else the environment defaults
    pub fn load() -> Result<Self> {
        match std::env::var("BPM_PLATFORM_CONFIG") {
            Ok(path) => Self::from_file(&path),
            Err(_) => Ok(Self::default()),
        }
    }

    /// Load a platform descriptor from a JSON file
    pub fn from_file(path: &str) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            PlatformError::Validation(format!("Failed to read platform descriptor '{}': {}", path, e))
        })?;
        let config: PlatformConfig = serde_json::from_str(&raw)?;
        for engine in &config.engines {
            engine.validate()?;
        }
        Ok(config)
    }
}

impl Default for PlatformConfig {
    /// Default configuration with ENV_VAR support for k8s/container deployment
    ///
    /// Without a descriptor a single default engine backed by
    /// `{BPM_DATA_DIR}/{name}.db` is configured.
    fn default() -> Self {
        let data_dir = std::env::var("BPM_DATA_DIR").unwrap_or_else(|_| "data".to_string());
        let name = std::env::var("BPM_DEFAULT_ENGINE").unwrap_or_else(|_| "default".to_string());

        let mut engine =
            ProcessEngineConfig::new(name.clone(), format!("sqlite://{}/{}.db", data_dir, name))
                .with_default(true);
        engine.properties.auto_schema_update = true;
        engine.properties.activate_job_executor = true;

        Self {
            engines: vec![engine],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_property_defaults() {
        let props = EngineProperties::default();

        assert!(!props.auto_schema_update);
        assert!(props.identity_used);
        assert!(!props.activate_job_executor);
        assert_eq!(props.history, HistoryLevel::Audit);
        assert_eq!(props.job_executor.max_jobs_per_acquisition, 3);
        assert_eq!(props.job_executor.wait_time_ms, 5_000);
        assert_eq!(props.job_executor.lock_time_ms, 300_000);
    }

    #[test]
    fn test_history_level_parsing_and_order() {
        assert_eq!("FULL".parse::<HistoryLevel>().unwrap(), HistoryLevel::Full);
        assert!("verbose".parse::<HistoryLevel>().unwrap_err().is_validation());
        assert!(HistoryLevel::Full > HistoryLevel::Audit);
        assert!(HistoryLevel::Activity > HistoryLevel::None);
    }

    #[test]
    fn test_descriptor_deserializes_with_defaults() {
        let raw = r#"{
            "engines": [
                { "name": "default", "datasource": "sqlite::memory:", "is_default": true,
                  "properties": { "history": "full", "job_executor": { "lock_time_ms": 1000 } } }
            ]
        }"#;

        let config: PlatformConfig = serde_json::from_str(raw).unwrap();
        let engine = &config.engines[0];
        assert!(engine.is_default);
        assert_eq!(engine.properties.history, HistoryLevel::Full);
        assert_eq!(engine.properties.job_executor.lock_time_ms, 1000);
        assert_eq!(engine.properties.job_executor.max_jobs_per_acquisition, 3);
        assert!(engine.properties.identity_used);
    }

    #[test]
    fn test_validation_rejects_bad_prefix() {
        let config = ProcessEngineConfig::in_memory("engine").with_table_prefix("act-");
        assert!(config.validate().unwrap_err().is_validation());

        let config = ProcessEngineConfig::in_memory("");
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validation_bounds_lock_time() {
        let mut config = ProcessEngineConfig::in_memory("engine");
        config.properties.job_executor.lock_time_ms = MAX_LOCK_TIME_MS;
        assert!(config.validate().is_ok());

        for lock_time_ms in [MAX_LOCK_TIME_MS + 1, 100_000_000_000_000_000, u64::MAX] {
            config.properties.job_executor.lock_time_ms = lock_time_ms;
            assert!(config.validate().unwrap_err().is_validation(), "{lock_time_ms}");
        }
    }
}
