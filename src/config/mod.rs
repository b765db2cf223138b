//! Configuration loading and parsing.
//!
//! This module provides YAML-based configuration for scheduler settings,
//! storage selection and DAG definitions.

mod builder;
mod error;
mod types;
mod yaml;

pub use builder::{ConfiguredTask, build_dag, build_dags};
pub use error::ConfigError;
pub use types::{DagConfig, SchedulerConfig, StorageConfig, TaskConfig};
pub use yaml::load_config;
