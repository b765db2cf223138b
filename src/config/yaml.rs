//! YAML configuration parsing.
//!
//! Parses scheduler settings and DAG definitions from YAML files.

use std::collections::HashSet;
use std::path::Path;

use super::error::ConfigError;
use super::types::{DagConfig, SchedulerConfig};

/// Load and validate a configuration file.
pub fn load_config(path: impl AsRef<Path>) -> Result<SchedulerConfig, ConfigError> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::FileReadError {
        path: path.to_path_buf(),
        source,
    })?;
    SchedulerConfig::from_yaml_str(&content)
}

impl SchedulerConfig {
    /// Parse and validate configuration from a YAML string.
    pub fn from_yaml_str(yaml: &str) -> Result<Self, ConfigError> {
        let config: SchedulerConfig = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Check values that parse but cannot be used.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.tick_interval_secs == 0 {
            return Err(ConfigError::InvalidConfig(
                "tick_interval_secs must be greater than 0".into(),
            ));
        }
        if self.queue_capacity == 0 {
            return Err(ConfigError::InvalidConfig(
                "queue_capacity must be greater than 0".into(),
            ));
        }

        let mut seen = HashSet::new();
        for dag in &self.dags {
            if !seen.insert(dag.id.as_str()) {
                return Err(ConfigError::InvalidConfig(format!(
                    "duplicate DAG id: {}",
                    dag.id
                )));
            }
            validate_dag_config(dag)?;
        }
        Ok(())
    }
}

fn validate_dag_config(dag: &DagConfig) -> Result<(), ConfigError> {
    if dag.id.is_empty() {
        return Err(ConfigError::InvalidConfig("DAG id must not be empty".into()));
    }
    if dag.schedule.is_some() && dag.start.is_none() {
        return Err(ConfigError::InvalidConfig(format!(
            "DAG '{}' has a schedule but no start",
            dag.id
        )));
    }
    if dag.tasks.iter().any(|t| t.id.is_empty()) {
        return Err(ConfigError::InvalidConfig(format!(
            "DAG '{}' has a task with an empty id",
            dag.id
        )));
    }
    Ok(())
}
