//! Configuration type definitions.
//!
//! This module contains the YAML structures for scheduler settings, storage
//! selection and DAG definitions.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::scheduler::DEFAULT_QUEUE_CAPACITY;

/// Scheduler configuration (dagsched.yaml).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Seconds between scheduling passes.
    pub tick_interval_secs: u64,
    /// Maximum number of runs waiting in the queue.
    pub queue_capacity: usize,
    /// Default log filter when `RUST_LOG` is not set.
    pub log_level: String,
    /// Storage configuration.
    pub storage: StorageConfig,
    /// DAG definitions.
    pub dags: Vec<DagConfig>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval_secs: 1,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            log_level: "info".to_string(),
            storage: StorageConfig::default(),
            dags: Vec::new(),
        }
    }
}

impl SchedulerConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs(self.tick_interval_secs)
    }
}

/// Storage configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum StorageConfig {
    /// In-memory storage (default, non-persistent).
    #[serde(rename = "memory")]
    #[default]
    Memory,
    /// SQLite storage.
    #[serde(rename = "sqlite")]
    Sqlite {
        /// Path to the database file.
        path: String,
    },
}

/// DAG definition from YAML.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DagConfig {
    /// DAG identifier.
    pub id: String,
    /// Schedule expression such as `@every 1h`. Unscheduled when absent.
    pub schedule: Option<String>,
    /// First occurrence of the schedule. Required with `schedule`.
    pub start: Option<DateTime<Utc>>,
    /// Run every missed occurrence instead of only the latest.
    #[serde(default)]
    pub catch_up: bool,
    #[serde(default)]
    pub tags: Vec<String>,
    /// Tasks. The first one is the root.
    #[serde(default)]
    pub tasks: Vec<TaskConfig>,
}

/// Task definition from YAML.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskConfig {
    /// Task identifier, unique within the DAG.
    pub id: String,
    /// Message logged when the task executes.
    pub message: Option<String>,
    /// Ids of the tasks that run after this one.
    #[serde(default)]
    pub children: Vec<String>,
}
