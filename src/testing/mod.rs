//! Testing utilities for users of the dagsched library.
//!
//! This module provides helpers for building DAGs in tests:
//!
//! - [`StaticTask`]: A task that always succeeds with a fixed fingerprint
//! - [`empty_dag`]: A DAG without tasks
//! - [`chain_dag`]: A DAG whose tasks form a single chain
//! - [`hourly_schedule`]: A one-hour fixed schedule

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::core::dag::{Attr, Dag, DagBuilder, Node};
use crate::core::schedule::FixedSchedule;
use crate::core::task::{Task, TaskError};

/// A task that succeeds without doing anything.
///
/// The fingerprint is the id followed by an optional payload, so two tasks
/// with the same id hash differently when their payloads differ.
///
/// # Example
///
/// ```
/// use dagsched::testing::StaticTask;
/// use dagsched::Task;
///
/// let a = StaticTask::new("extract");
/// let b = StaticTask::new("extract").with_payload("v2");
/// assert_ne!(a.fingerprint(), b.fingerprint());
/// ```
pub struct StaticTask {
    id: String,
    payload: Vec<u8>,
    executions: Arc<AtomicUsize>,
}

impl StaticTask {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            payload: Vec::new(),
            executions: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Set the bytes appended to the fingerprint.
    pub fn with_payload(mut self, payload: impl AsRef<[u8]>) -> Self {
        self.payload = payload.as_ref().to_vec();
        self
    }

    /// How many times `execute` was called.
    pub fn executions(&self) -> usize {
        self.executions.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Task for StaticTask {
    fn id(&self) -> &str {
        &self.id
    }

    async fn execute(&self) -> Result<(), TaskError> {
        self.executions.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn fingerprint(&self) -> Vec<u8> {
        let mut bytes = self.id.as_bytes().to_vec();
        bytes.extend_from_slice(&self.payload);
        bytes
    }
}

/// One-hour schedule starting at `start`.
pub fn hourly_schedule(start: DateTime<Utc>) -> FixedSchedule {
    FixedSchedule::new(start, TimeDelta::hours(1)).expect("one hour is a valid interval")
}

/// A DAG without tasks or schedule.
pub fn empty_dag(id: &str) -> Dag {
    DagBuilder::new(id).build()
}

/// A DAG whose tasks run one after another in the given order.
///
/// The first task is the root. An empty list gives a DAG without tasks.
pub fn chain_dag(id: &str, task_ids: &[&str]) -> Dag {
    chain_builder(id, task_ids).build()
}

/// Like [`chain_dag`], with a schedule and attributes.
pub fn scheduled_chain_dag(
    id: &str,
    task_ids: &[&str],
    schedule: FixedSchedule,
    catch_up: bool,
) -> Dag {
    chain_builder(id, task_ids)
        .schedule(schedule)
        .attributes(Attr {
            catch_up,
            tags: Vec::new(),
        })
        .build()
}

fn chain_builder(id: &str, task_ids: &[&str]) -> DagBuilder {
    // built from the last task back, each node over its successor
    let root = task_ids.iter().rev().fold(None, |child: Option<Arc<Node>>, task_id| {
        Some(Node::with_children(
            StaticTask::new(*task_id),
            child.into_iter().collect(),
        ))
    });

    let builder = DagBuilder::new(id);
    match root {
        Some(root) => builder.root(root),
        None => builder,
    }
}
