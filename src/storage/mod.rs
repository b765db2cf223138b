//! Storage abstraction for persisting DAGs, task versions, runs and task
//! status.
//!
//! This module provides a trait-based storage abstraction with
//! pluggable backends (in-memory, SQLite).

mod memory;
#[cfg(feature = "sqlite")]
mod sqlite;

pub use memory::InMemoryStorage;
#[cfg(feature = "sqlite")]
pub use sqlite::SqliteStorage;

use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::core::dag::{Dag, DagError};
use crate::core::types::{DagId, TaskId};
use crate::scheduler::DagRunTaskStatus;

/// Crate version recorded next to stored rows.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Errors that can occur during storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// The requested item was not found.
    #[error("not found: {0}")]
    NotFound(String),

    /// A duplicate key was detected.
    #[error("duplicate key: {0}")]
    DuplicateKey(String),

    /// Storage lock was poisoned.
    #[error("storage lock poisoned")]
    LockPoisoned,

    /// A stored value could not be decoded.
    #[error("serialization error: {0}")]
    SerializationError(String),

    /// Generic storage error.
    #[error("storage error: {0}")]
    Other(String),
}

/// Tables known to the storage layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Table {
    Dags,
    DagTasks,
    DagRuns,
    DagRunTasks,
}

impl Table {
    pub fn as_str(&self) -> &'static str {
        match self {
            Table::Dags => "dags",
            Table::DagTasks => "dagtasks",
            Table::DagRuns => "dagruns",
            Table::DagRunTasks => "dagruntasks",
        }
    }
}

impl fmt::Display for Table {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Stored DAG metadata.
///
/// One row per DAG. The hashes tell whether the definition changed since the
/// row was last written.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredDag {
    pub dag_id: DagId,
    /// Start of the schedule, if any.
    pub start_ts: Option<DateTime<Utc>>,
    /// Schedule expression, if any.
    pub schedule: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: Option<DateTime<Utc>>,
    pub create_version: String,
    pub update_version: Option<String>,
    pub hash_dag_meta: String,
    pub hash_tasks: String,
    /// JSON of the DAG attributes.
    pub attributes: String,
}

impl StoredDag {
    /// Build a fresh row for `dag`, as first seen at `now`.
    pub fn from_dag(dag: &Dag, now: DateTime<Utc>) -> Result<Self, DagError> {
        let attributes = serde_json::to_string(dag.attr()).map_err(DagError::AttrSerialization)?;
        Ok(Self {
            dag_id: dag.id().clone(),
            start_ts: dag.schedule().map(|s| s.start_time()),
            schedule: dag.schedule().map(|s| s.to_string()),
            created_at: now,
            updated_at: None,
            create_version: VERSION.to_string(),
            update_version: None,
            hash_dag_meta: dag.hash_dag_meta()?,
            hash_tasks: dag.hash_tasks(),
            attributes,
        })
    }

    /// Merge a new definition into an existing row.
    ///
    /// Creation fields are kept from `self`, everything else comes from `new`.
    pub fn updated_with(&self, new: StoredDag) -> StoredDag {
        StoredDag {
            created_at: self.created_at,
            create_version: self.create_version.clone(),
            updated_at: Some(new.created_at),
            update_version: Some(new.create_version),
            ..new
        }
    }
}

/// One version of a task definition.
///
/// Every `(dag_id, task_id)` has at most one current row. Older versions are
/// kept with `is_current` cleared.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredDagTask {
    pub dag_id: DagId,
    pub task_id: TaskId,
    pub is_current: bool,
    pub inserted_at: DateTime<Utc>,
    pub version: String,
    pub task_type_name: String,
    /// Hex SHA-256 of the task fingerprint.
    pub task_body_hash: String,
    pub task_body_source: String,
}

impl StoredDagTask {
    /// Current rows for every task of `dag`, in breadth-first order.
    pub fn from_dag(dag: &Dag, now: DateTime<Utc>) -> Vec<Self> {
        dag.flatten()
            .iter()
            .map(|task| Self {
                dag_id: dag.id().clone(),
                task_id: TaskId::new(task.id()),
                is_current: true,
                inserted_at: now,
                version: VERSION.to_string(),
                task_type_name: task.type_name().to_string(),
                task_body_hash: hex::encode(Sha256::digest(task.fingerprint())),
                task_body_source: task.description().unwrap_or_default().to_string(),
            })
            .collect()
    }
}

/// A persisted DAG run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredDagRun {
    pub dag_id: DagId,
    pub at_time: DateTime<Utc>,
    pub inserted_at: DateTime<Utc>,
}

/// A persisted task of a DAG run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredDagRunTask {
    pub dag_id: DagId,
    pub at_time: DateTime<Utc>,
    pub task_id: TaskId,
    pub inserted_at: DateTime<Utc>,
    pub status: DagRunTaskStatus,
    pub status_updated_at: DateTime<Utc>,
    pub version: String,
}

/// Raw status columns of a DAG run task, as stored.
///
/// Left as text so that callers decide how to treat malformed rows.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskStatusRow {
    pub status: String,
    pub status_updated_at: String,
}

/// Storage trait for persisting scheduler state.
#[async_trait]
pub trait Storage: Send + Sync {
    // DAG operations

    /// Insert a DAG row, or update it keeping its creation fields.
    async fn upsert_dag(&self, dag: StoredDag) -> Result<(), StorageError>;

    /// Get a DAG row by ID.
    async fn read_dag(&self, dag_id: &DagId) -> Result<StoredDag, StorageError>;

    // Task version operations

    /// Store a new current version of every task whose body hash differs
    /// from its current row, outdating that row. Tasks with an unchanged
    /// hash are left alone. Either all rows are written or none.
    ///
    /// Returns the number of versions written.
    async fn insert_dag_tasks(&self, tasks: Vec<StoredDagTask>) -> Result<usize, StorageError>;

    /// Current version of a task.
    async fn read_dag_task(&self, dag_id: &DagId, task_id: &TaskId) -> Result<StoredDagTask, StorageError>;

    // Run operations

    /// Record a new run. Fails with `DuplicateKey` if the run exists.
    async fn insert_dag_run(&self, dag_id: &DagId, at_time: DateTime<Utc>) -> Result<(), StorageError>;

    /// Runs of a DAG, most recent `at_time` first.
    /// Returns at most `limit` runs.
    async fn read_dag_runs(&self, dag_id: &DagId, limit: usize) -> Result<Vec<StoredDagRun>, StorageError>;

    // Task operations

    /// Record a task of a run with status `SCHEDULED`.
    ///
    /// Returns the status timestamp as stored, to the microsecond.
    async fn insert_dag_run_task(
        &self,
        dag_id: &DagId,
        at_time: DateTime<Utc>,
        task_id: &TaskId,
    ) -> Result<DateTime<Utc>, StorageError>;

    /// Set the status of a run's task.
    async fn update_dag_run_task_status(
        &self,
        dag_id: &DagId,
        at_time: DateTime<Utc>,
        task_id: &TaskId,
        status: DagRunTaskStatus,
    ) -> Result<(), StorageError>;

    /// Raw status of a run's task.
    async fn read_dag_run_task_status(
        &self,
        dag_id: &DagId,
        at_time: DateTime<Utc>,
        task_id: &TaskId,
    ) -> Result<TaskStatusRow, StorageError>;

    /// All tasks of a run.
    async fn read_dag_run_tasks(
        &self,
        dag_id: &DagId,
        at_time: DateTime<Utc>,
    ) -> Result<Vec<StoredDagRunTask>, StorageError>;

    /// Number of rows in a table.
    async fn count(&self, table: Table) -> Result<usize, StorageError>;
}
