//! Configuration error types.

use std::path::PathBuf;
use thiserror::Error;

use crate::core::dag::DagError;
use crate::core::schedule::ScheduleError;

/// Errors that can occur when loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read a specific file with context.
    #[error("failed to read file '{path}': {source}")]
    FileReadError {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Failed to parse YAML.
    #[error("YAML parse error: {0}")]
    YamlError(#[from] serde_yaml::Error),

    /// Invalid configuration value.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// A DAG's schedule expression could not be parsed.
    #[error("invalid schedule for DAG '{dag_id}': {source}")]
    InvalidSchedule {
        dag_id: String,
        #[source]
        source: ScheduleError,
    },

    /// A configured DAG failed structural validation.
    #[error("invalid DAG '{dag_id}': {source}")]
    InvalidDag {
        dag_id: String,
        #[source]
        source: DagError,
    },
}
