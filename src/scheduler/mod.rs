//! DAG run scheduling.
//!
//! This module decides when DAG runs are due, persists them, hands them to
//! workers through a bounded queue and caches the status of their tasks.

pub mod cache;
mod engine;
mod handle;
mod queue;
mod types;

pub use cache::{CacheError, CacheKey, CacheValue, CacheableKey, StateCache};
pub use engine::{
    DEFAULT_QUEUE_CAPACITY, NextSchedules, Scheduler, next_schedule_for_dag_runs,
    should_be_scheduled, try_schedule_dag,
};
pub use handle::SchedulerHandle;
pub use queue::{QueueError, RunQueue};
pub use types::{
    DagRun, DagRunTask, DagRunTaskState, DagRunTaskStatus, SchedulerError, SchedulerState,
    StatusParseError, TickReport,
};
