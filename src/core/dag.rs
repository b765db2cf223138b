//! Directed Acyclic Graph (DAG) of tasks.
//!
//! A DAG is a graph of [`Node`]s hanging off an optional root, plus an
//! optional [`Schedule`] and scheduling [`Attr`]ibutes. Nodes own their
//! children from construction on, so graphs are built leaves first and can
//! never be closed into a cycle. A node reachable through several parents is
//! shared, not copied.
//!
//! Two hashes identify a DAG version: [`Dag::hash_dag_meta`] covers the
//! attributes and schedule, [`Dag::hash_tasks`] covers the task bodies.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

use super::schedule::Schedule;
use super::task::Task;
use super::types::{DagId, TaskId, format_timestamp};

/// Maximum number of nodes on any path from the root.
pub const MAX_RECURSION: usize = 1000;

/// Errors that can occur when working with DAGs.
#[derive(Debug, Error)]
pub enum DagError {
    /// A cycle was detected in a graph description.
    #[error("cycle detected involving task: {0}")]
    CycleDetected(TaskId),

    /// Two distinct nodes carry the same task id.
    #[error("duplicate task: {0}")]
    DuplicateTask(TaskId),

    /// The graph is deeper than allowed.
    #[error("DAG depth {depth} exceeds maximum of {max}")]
    TooDeep { depth: usize, max: usize },

    /// Task not found in the DAG.
    #[error("task not found: {0}")]
    TaskNotFound(TaskId),

    /// Attributes could not be serialized for hashing.
    #[error("cannot serialize DAG attributes: {0}")]
    AttrSerialization(#[source] serde_json::Error),
}

/// Scheduling attributes of a DAG.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Attr {
    /// Create a run for every missed occurrence since the last run.
    ///
    /// When false, missed occurrences are skipped and only the latest one
    /// is scheduled.
    pub catch_up: bool,

    /// Free-form labels.
    pub tags: Vec<String>,
}

/// A vertex of the task graph.
///
/// Children are fixed when the node is created.
pub struct Node {
    task: Arc<dyn Task>,
    children: Vec<Arc<Node>>,
}

impl Node {
    /// Create a leaf node.
    pub fn new(task: impl Task + 'static) -> Arc<Self> {
        Self::from_task(Arc::new(task), Vec::new())
    }

    /// Create a node over already built children, kept in the given order.
    pub fn with_children(task: impl Task + 'static, children: Vec<Arc<Node>>) -> Arc<Self> {
        Self::from_task(Arc::new(task), children)
    }

    /// Create a node from an already shared task.
    pub fn from_task(task: Arc<dyn Task>, children: Vec<Arc<Node>>) -> Arc<Self> {
        Arc::new(Self { task, children })
    }

    /// The task carried by this node.
    pub fn task(&self) -> &Arc<dyn Task> {
        &self.task
    }

    /// Id of the carried task.
    pub fn task_id(&self) -> TaskId {
        TaskId::new(self.task.id())
    }

    /// Direct children, in construction order.
    pub fn children(&self) -> &[Arc<Node>] {
        &self.children
    }
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node")
            .field("task", &self.task.id())
            .field("children", &self.children.len())
            .finish()
    }
}

/// A node together with the ids of its direct parents.
#[derive(Debug, Clone)]
pub struct NodeInfo {
    pub node: Arc<Node>,
    pub parents: Vec<TaskId>,
}

fn node_key(node: &Arc<Node>) -> *const Node {
    Arc::as_ptr(node)
}

/// Breadth-first walk of everything reachable from `root`.
///
/// Every node appears once, in discovery order, with all of its parents.
struct Traversal {
    order: Vec<Arc<Node>>,
    index: HashMap<*const Node, usize>,
    parents: Vec<Vec<usize>>,
    children: Vec<Vec<usize>>,
}

impl Traversal {
    fn walk(root: &Arc<Node>) -> Self {
        let mut walk = Self {
            order: vec![Arc::clone(root)],
            index: HashMap::from([(node_key(root), 0)]),
            parents: vec![Vec::new()],
            children: vec![Vec::new()],
        };
        let mut queue = VecDeque::from([0usize]);

        while let Some(current) = queue.pop_front() {
            let node = Arc::clone(&walk.order[current]);
            for child in node.children() {
                let idx = match walk.index.get(&node_key(child)) {
                    Some(idx) => *idx,
                    None => {
                        let idx = walk.order.len();
                        walk.index.insert(node_key(child), idx);
                        walk.order.push(Arc::clone(child));
                        walk.parents.push(Vec::new());
                        walk.children.push(Vec::new());
                        queue.push_back(idx);
                        idx
                    }
                };
                walk.parents[idx].push(current);
                walk.children[current].push(idx);
            }
        }

        walk
    }

    fn task_id(&self, idx: usize) -> TaskId {
        self.order[idx].task_id()
    }

    fn node_infos(&self) -> Vec<NodeInfo> {
        self.order
            .iter()
            .zip(&self.parents)
            .map(|(node, parents)| NodeInfo {
                node: Arc::clone(node),
                parents: parents.iter().map(|p| self.task_id(*p)).collect(),
            })
            .collect()
    }

    fn check_unique_ids(&self) -> Result<(), DagError> {
        let mut seen: HashMap<TaskId, usize> = HashMap::with_capacity(self.order.len());
        for idx in 0..self.order.len() {
            if seen.insert(self.task_id(idx), idx).is_some() {
                return Err(DagError::DuplicateTask(self.task_id(idx)));
            }
        }
        Ok(())
    }

    /// Number of nodes on the longest path, by Kahn's algorithm over the
    /// reachable subgraph.
    fn longest_path(&self) -> usize {
        let mut in_degree: Vec<usize> = self.parents.iter().map(Vec::len).collect();
        let mut depth = vec![1usize; self.order.len()];
        let mut queue: VecDeque<usize> = in_degree
            .iter()
            .enumerate()
            .filter(|(_, degree)| **degree == 0)
            .map(|(idx, _)| idx)
            .collect();
        while let Some(idx) = queue.pop_front() {
            for &child in &self.children[idx] {
                depth[child] = depth[child].max(depth[idx] + 1);
                in_degree[child] -= 1;
                if in_degree[child] == 0 {
                    queue.push_back(child);
                }
            }
        }

        depth.into_iter().max().unwrap_or(0)
    }
}

/// Feed `bytes` into `hasher` behind its length.
pub(crate) fn update_framed(hasher: &mut Sha256, bytes: &[u8]) {
    hasher.update((bytes.len() as u64).to_be_bytes());
    hasher.update(bytes);
}

/// A Directed Acyclic Graph of tasks with its schedule.
#[derive(Clone)]
pub struct Dag {
    id: DagId,
    schedule: Option<Arc<dyn Schedule>>,
    attr: Attr,
    root: Option<Arc<Node>>,
}

impl Dag {
    /// Get the DAG ID.
    pub fn id(&self) -> &DagId {
        &self.id
    }

    /// The schedule, if the DAG runs periodically.
    pub fn schedule(&self) -> Option<&Arc<dyn Schedule>> {
        self.schedule.as_ref()
    }

    /// Scheduling attributes.
    pub fn attr(&self) -> &Attr {
        &self.attr
    }

    /// Root node, if the DAG has any tasks.
    pub fn root(&self) -> Option<&Arc<Node>> {
        self.root.as_ref()
    }

    fn traversal(&self) -> Option<Traversal> {
        self.root.as_ref().map(Traversal::walk)
    }

    /// Check the structure of the DAG, reporting the first violation.
    ///
    /// A DAG without a root is valid.
    pub fn validate(&self) -> Result<(), DagError> {
        let Some(walk) = self.traversal() else {
            return Ok(());
        };
        walk.check_unique_ids()?;
        let depth = walk.longest_path();
        if depth > MAX_RECURSION {
            return Err(DagError::TooDeep {
                depth,
                max: MAX_RECURSION,
            });
        }
        Ok(())
    }

    /// True when task ids are unique and the depth is within
    /// [`MAX_RECURSION`].
    pub fn is_valid(&self) -> bool {
        self.validate().is_ok()
    }

    /// Find a task by id.
    pub fn get_task(&self, task_id: &str) -> Result<Arc<dyn Task>, DagError> {
        self.flatten()
            .into_iter()
            .find(|task| task.id() == task_id)
            .ok_or_else(|| DagError::TaskNotFound(TaskId::new(task_id)))
    }

    /// All tasks in breadth-first order.
    pub fn flatten(&self) -> Vec<Arc<dyn Task>> {
        self.traversal()
            .map(|walk| {
                walk.order
                    .iter()
                    .map(|node| Arc::clone(node.task()))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// All nodes in breadth-first order, each with its parents.
    pub fn flatten_nodes(&self) -> Vec<NodeInfo> {
        self.traversal()
            .map(|walk| walk.node_infos())
            .unwrap_or_default()
    }

    /// Map of every task id to the ids of its direct parents.
    ///
    /// The root maps to an empty list.
    pub fn task_parents(&self) -> HashMap<TaskId, Vec<TaskId>> {
        self.flatten_nodes()
            .into_iter()
            .map(|info| (info.node.task_id(), info.parents))
            .collect()
    }

    /// SHA-256 over the attributes, schedule expression and schedule start.
    pub fn hash_dag_meta(&self) -> Result<String, DagError> {
        let attr_json = serde_json::to_vec(&self.attr).map_err(DagError::AttrSerialization)?;
        let (schedule, start) = match &self.schedule {
            Some(schedule) => (
                schedule.to_string(),
                format_timestamp(schedule.start_time()),
            ),
            None => (String::new(), String::new()),
        };

        let mut hasher = Sha256::new();
        hasher.update(&attr_json);
        hasher.update(schedule.as_bytes());
        hasher.update(start.as_bytes());
        Ok(hex::encode(hasher.finalize()))
    }

    /// SHA-256 over every task id and fingerprint in breadth-first order.
    ///
    /// Each field is preceded by its length as a big-endian `u64`, so moving
    /// bytes between an id and a fingerprint changes the hash.
    pub fn hash_tasks(&self) -> String {
        let mut hasher = Sha256::new();
        match self.traversal() {
            None => hasher.update(b"NO TASKS"),
            Some(walk) => {
                for node in &walk.order {
                    update_framed(&mut hasher, node.task().id().as_bytes());
                    update_framed(&mut hasher, &node.task().fingerprint());
                }
            }
        }
        hex::encode(hasher.finalize())
    }
}

impl fmt::Debug for Dag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dag")
            .field("id", &self.id)
            .field("schedule", &self.schedule.as_ref().map(|s| s.to_string()))
            .field("attr", &self.attr)
            .field("root", &self.root.as_ref().map(|n| n.task_id()))
            .finish()
    }
}

impl fmt::Display for Dag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.schedule {
            Some(schedule) => writeln!(f, "Dag: {} ({})", self.id, schedule)?,
            None => writeln!(f, "Dag: {} (no schedule)", self.id)?,
        }
        writeln!(f, "Tasks:")?;
        for info in self.flatten_nodes() {
            if info.parents.is_empty() {
                writeln!(f, "  - {}", info.node.task_id())?;
            } else {
                let parents: Vec<&str> = info.parents.iter().map(TaskId::as_str).collect();
                writeln!(f, "  - {} <- {}", info.node.task_id(), parents.join(", "))?;
            }
        }
        Ok(())
    }
}

/// Builder for constructing DAGs fluently.
pub struct DagBuilder {
    dag: Dag,
}

impl DagBuilder {
    /// Create a new DAG builder.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            dag: Dag {
                id: DagId::new(id),
                schedule: None,
                attr: Attr::default(),
                root: None,
            },
        }
    }

    /// Set the root node.
    pub fn root(mut self, node: Arc<Node>) -> Self {
        self.dag.root = Some(node);
        self
    }

    /// Attach a schedule.
    pub fn schedule(mut self, schedule: impl Schedule + 'static) -> Self {
        self.dag.schedule = Some(Arc::new(schedule));
        self
    }

    /// Set the scheduling attributes.
    pub fn attributes(mut self, attr: Attr) -> Self {
        self.dag.attr = attr;
        self
    }

    /// Finish the DAG.
    pub fn build(self) -> Dag {
        self.dag
    }
}
