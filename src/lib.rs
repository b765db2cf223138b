//! dagsched - A small DAG workflow scheduler.
//!
//! DAGs of tasks are registered with a [`Scheduler`], which decides when each
//! DAG is due according to its [`Schedule`], records the run in [`Storage`]
//! and queues it for workers. DAG definitions are versioned by content hash.

pub mod config;
pub mod core;
pub mod scheduler;
pub mod storage;
pub mod testing;

pub use config::{ConfigError, SchedulerConfig, StorageConfig, build_dags, load_config};
pub use core::dag::{Attr, Dag, DagBuilder, DagError, Node, NodeInfo};
pub use core::schedule::{FixedSchedule, Schedule, ScheduleError};
pub use core::task::{Task, TaskError};
pub use core::types::{DagId, TaskId};
pub use scheduler::{
    DagRun, DagRunTask, DagRunTaskState, DagRunTaskStatus, NextSchedules, RunQueue, Scheduler,
    SchedulerError, SchedulerHandle, SchedulerState, StateCache, TickReport,
};
#[cfg(feature = "sqlite")]
pub use storage::SqliteStorage;
pub use storage::{InMemoryStorage, Storage, StorageError, Table};
