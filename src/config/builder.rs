//! DAG builder from YAML configuration.
//!
//! This module converts [`DagConfig`] into [`Dag`] instances whose tasks log
//! their configured message when executed.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use tracing::info;

use crate::core::dag::{Attr, Dag, DagBuilder, DagError, Node, update_framed};
use crate::core::schedule::FixedSchedule;
use crate::core::task::{Task, TaskError};

use super::error::ConfigError;
use super::types::{DagConfig, SchedulerConfig, TaskConfig};
use crate::core::types::TaskId;

/// Task defined in configuration. Executing it logs its message.
#[derive(Debug, Clone)]
pub struct ConfiguredTask {
    id: String,
    message: Option<String>,
}

impl ConfiguredTask {
    pub fn new(id: impl Into<String>, message: Option<String>) -> Self {
        Self {
            id: id.into(),
            message,
        }
    }
}

#[async_trait]
impl Task for ConfiguredTask {
    fn id(&self) -> &str {
        &self.id
    }

    async fn execute(&self) -> Result<(), TaskError> {
        info!(task_id = %self.id, message = self.message.as_deref().unwrap_or(""), "Executing configured task");
        Ok(())
    }

    fn fingerprint(&self) -> Vec<u8> {
        let mut hasher = Sha256::new();
        update_framed(&mut hasher, self.id.as_bytes());
        match &self.message {
            Some(message) => {
                hasher.update([1u8]);
                update_framed(&mut hasher, message.as_bytes());
            }
            None => hasher.update([0u8]),
        }
        hasher.finalize().to_vec()
    }

    fn description(&self) -> Option<&str> {
        self.message.as_deref()
    }
}

/// Build a validated DAG from its configuration.
///
/// The first task is the root. Every other task must be reachable from it
/// through `children` links.
pub fn build_dag(config: &DagConfig) -> Result<Dag, ConfigError> {
    let mut builder = DagBuilder::new(config.id.clone()).attributes(Attr {
        catch_up: config.catch_up,
        tags: config.tags.clone(),
    });

    if let Some(expression) = &config.schedule {
        let start = config.start.ok_or_else(|| {
            ConfigError::InvalidConfig(format!("DAG '{}' has a schedule but no start", config.id))
        })?;
        let schedule =
            FixedSchedule::parse(expression, start).map_err(|source| ConfigError::InvalidSchedule {
                dag_id: config.id.clone(),
                source,
            })?;
        builder = builder.schedule(schedule);
    }

    let mut by_id: HashMap<&str, &TaskConfig> = HashMap::with_capacity(config.tasks.len());
    for task in &config.tasks {
        if by_id.insert(task.id.as_str(), task).is_some() {
            return Err(ConfigError::InvalidConfig(format!(
                "DAG '{}' defines task '{}' twice",
                config.id, task.id
            )));
        }
    }
    for task in &config.tasks {
        if let Some(child_id) = task.children.iter().find(|id| !by_id.contains_key(id.as_str())) {
            return Err(ConfigError::InvalidConfig(format!(
                "task '{}' in DAG '{}' has unknown child '{}'",
                task.id, config.id, child_id
            )));
        }
    }

    let nodes = build_nodes(config, &by_id)?;
    if let Some(root) = config.tasks.first().and_then(|first| nodes.get(first.id.as_str())) {
        builder = builder.root(Arc::clone(root));
    }
    let dag = builder.build();

    dag.validate().map_err(|source| ConfigError::InvalidDag {
        dag_id: config.id.clone(),
        source,
    })?;

    let reachable = dag.flatten().len();
    if reachable != config.tasks.len() {
        return Err(ConfigError::InvalidConfig(format!(
            "DAG '{}' has {} task(s) unreachable from '{}'",
            config.id,
            config.tasks.len() - reachable,
            config.tasks[0].id
        )));
    }

    Ok(dag)
}

/// Create the nodes of every task, children before their parents.
///
/// Depth-first over the `children` links with an explicit stack. Reaching a
/// task that is still being built means the links form a cycle.
fn build_nodes<'a>(
    config: &'a DagConfig,
    by_id: &HashMap<&'a str, &'a TaskConfig>,
) -> Result<HashMap<&'a str, Arc<Node>>, ConfigError> {
    let mut built: HashMap<&str, Arc<Node>> = HashMap::with_capacity(config.tasks.len());
    let mut in_progress: HashSet<&str> = HashSet::new();

    for task in &config.tasks {
        if built.contains_key(task.id.as_str()) {
            continue;
        }
        in_progress.insert(task.id.as_str());
        let mut stack: Vec<(&TaskConfig, usize)> = vec![(task, 0)];

        while let Some(frame) = stack.last_mut() {
            let (current, next) = *frame;
            if let Some(child_id) = current.children.get(next) {
                frame.1 += 1;
                let child_id = child_id.as_str();
                if built.contains_key(child_id) {
                    continue;
                }
                if !in_progress.insert(child_id) {
                    return Err(ConfigError::InvalidDag {
                        dag_id: config.id.clone(),
                        source: DagError::CycleDetected(TaskId::new(child_id)),
                    });
                }
                if let Some(child) = by_id.get(child_id) {
                    stack.push((*child, 0));
                }
            } else {
                stack.pop();
                in_progress.remove(current.id.as_str());
                let children = current
                    .children
                    .iter()
                    .filter_map(|id| built.get(id.as_str()).cloned())
                    .collect();
                let node = Node::with_children(
                    ConfiguredTask::new(current.id.clone(), current.message.clone()),
                    children,
                );
                built.insert(current.id.as_str(), node);
            }
        }
    }

    Ok(built)
}

/// Build every DAG of a configuration, in order.
pub fn build_dags(config: &SchedulerConfig) -> Result<Vec<Dag>, ConfigError> {
    config.dags.iter().map(build_dag).collect()
}
