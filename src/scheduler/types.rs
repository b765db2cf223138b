//! Scheduler type definitions.
//!
//! This module contains run keys, task status, error types, state enums, and
//! command types for the scheduler.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::oneshot;

use crate::core::dag::DagError;
use crate::core::types::{DagId, TaskId, format_timestamp};
use crate::storage::StorageError;

use super::cache::CacheError;
use super::queue::QueueError;

/// One scheduled occurrence of a DAG.
///
/// Runs are identified by the DAG and the logical time they were scheduled
/// for, so inserting the same run twice is a conflict.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DagRun {
    pub dag_id: DagId,
    pub at_time: DateTime<Utc>,
}

impl DagRun {
    pub fn new(dag_id: impl Into<DagId>, at_time: DateTime<Utc>) -> Self {
        Self {
            dag_id: dag_id.into(),
            at_time,
        }
    }
}

impl fmt::Display for DagRun {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.dag_id, format_timestamp(self.at_time))
    }
}

/// A single task within a DAG run.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DagRunTask {
    pub dag_id: DagId,
    pub at_time: DateTime<Utc>,
    pub task_id: TaskId,
}

impl DagRunTask {
    pub fn new(dag_id: impl Into<DagId>, at_time: DateTime<Utc>, task_id: impl Into<TaskId>) -> Self {
        Self {
            dag_id: dag_id.into(),
            at_time,
            task_id: task_id.into(),
        }
    }
}

impl fmt::Display for DagRunTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}@{}/{}",
            self.dag_id,
            format_timestamp(self.at_time),
            self.task_id
        )
    }
}

/// Lifecycle status of a task within a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DagRunTaskStatus {
    /// Task is waiting to be picked up.
    Scheduled,
    /// Task is executing.
    Running,
    /// Task completed successfully.
    Success,
    /// Task failed.
    Failed,
}

impl DagRunTaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DagRunTaskStatus::Scheduled => "SCHEDULED",
            DagRunTaskStatus::Running => "RUNNING",
            DagRunTaskStatus::Success => "SUCCESS",
            DagRunTaskStatus::Failed => "FAILED",
        }
    }
}

impl fmt::Display for DagRunTaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when a status string is not recognized.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown task status: {0}")]
pub struct StatusParseError(pub String);

impl FromStr for DagRunTaskStatus {
    type Err = StatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "SCHEDULED" => Ok(DagRunTaskStatus::Scheduled),
            "RUNNING" => Ok(DagRunTaskStatus::Running),
            "SUCCESS" => Ok(DagRunTaskStatus::Success),
            "FAILED" => Ok(DagRunTaskStatus::Failed),
            other => Err(StatusParseError(other.to_string())),
        }
    }
}

/// Current status of a task within a run, as cached by the scheduler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DagRunTaskState {
    pub status: DagRunTaskStatus,
    pub status_updated_at: DateTime<Utc>,
}

/// Errors that can occur in the scheduler.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// DAG failed structural validation.
    #[error("invalid DAG '{dag_id}': {source}")]
    InvalidDag {
        dag_id: DagId,
        #[source]
        source: DagError,
    },

    /// A DAG with this id is already registered.
    #[error("DAG already registered: {0}")]
    DuplicateDag(DagId),

    /// DAG error other than validation.
    #[error("DAG error: {0}")]
    Dag(#[from] DagError),

    /// Storage error.
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// Run queue error.
    #[error("queue error: {0}")]
    Queue(#[from] QueueError),

    /// State cache error.
    #[error("cache error: {0}")]
    Cache(#[from] CacheError),

    /// Channel error.
    #[error("channel error: {0}")]
    ChannelError(String),
}

/// State of the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    /// Scheduler is stopped.
    Stopped,
    /// Scheduler is running.
    Running,
    /// Scheduler is paused.
    Paused,
}

/// Commands that can be sent to the scheduler.
pub(crate) enum SchedulerCommand {
    /// Run one scheduling pass immediately.
    Tick {
        response: oneshot::Sender<Result<TickReport, SchedulerError>>,
    },
    /// Pause the scheduler.
    Pause { response: oneshot::Sender<()> },
    /// Resume the scheduler.
    Resume { response: oneshot::Sender<()> },
    /// Shutdown the scheduler.
    Shutdown { response: oneshot::Sender<()> },
}

/// Outcome of one scheduling pass.
#[derive(Debug, Default)]
pub struct TickReport {
    /// Runs queued during the pass: runs held back earlier first, then new
    /// runs in DAG order.
    pub scheduled: Vec<DagRun>,
    /// New runs stored but held back because the queue was full.
    pub deferred: Vec<DagRun>,
    /// DAGs whose scheduling failed, with the error.
    pub failures: Vec<(DagId, SchedulerError)>,
}

impl TickReport {
    pub fn is_empty(&self) -> bool {
        self.scheduled.is_empty() && self.deferred.is_empty() && self.failures.is_empty()
    }
}
