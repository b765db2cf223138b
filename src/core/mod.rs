//! Core domain model: DAGs, tasks, schedules and identifiers.

pub mod dag;
pub mod schedule;
pub mod task;
pub mod types;
