//! In-memory storage implementation.
//!
//! Provides a thread-safe in-memory backend for testing and development.

use async_trait::async_trait;
use chrono::{DateTime, SubsecRound, Utc};
use std::collections::HashMap;
use std::sync::RwLock;

use super::{
    Storage, StorageError, StoredDag, StoredDagRun, StoredDagRunTask, StoredDagTask, Table,
    TaskStatusRow, VERSION,
};
use crate::core::types::{DagId, TaskId, format_timestamp};
use crate::scheduler::DagRunTaskStatus;

type DagTaskKey = (DagId, TaskId);
type RunKey = (DagId, DateTime<Utc>);
type TaskKey = (DagId, DateTime<Utc>, TaskId);

fn task_key_str(dag_id: &DagId, at_time: DateTime<Utc>, task_id: &TaskId) -> String {
    format!("dagruntask: {}/{}/{}", dag_id, format_timestamp(at_time), task_id)
}

/// In-memory storage backend.
///
/// Thread-safe storage using RwLock for concurrent access.
/// Data is not persisted across restarts.
pub struct InMemoryStorage {
    dags: RwLock<HashMap<DagId, StoredDag>>,
    /// Versions of each task, oldest first. Only the last one is current.
    dag_tasks: RwLock<HashMap<DagTaskKey, Vec<StoredDagTask>>>,
    runs: RwLock<HashMap<RunKey, StoredDagRun>>,
    tasks: RwLock<HashMap<TaskKey, StoredDagRunTask>>,
}

impl InMemoryStorage {
    /// Create a new empty in-memory storage.
    pub fn new() -> Self {
        Self {
            dags: RwLock::new(HashMap::new()),
            dag_tasks: RwLock::new(HashMap::new()),
            runs: RwLock::new(HashMap::new()),
            tasks: RwLock::new(HashMap::new()),
        }
    }
}

impl Default for InMemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Storage for InMemoryStorage {
    async fn upsert_dag(&self, dag: StoredDag) -> Result<(), StorageError> {
        let mut dags = self.dags.write().map_err(|_| StorageError::LockPoisoned)?;
        let row = match dags.get(&dag.dag_id) {
            Some(current) => current.updated_with(dag),
            None => dag,
        };
        dags.insert(row.dag_id.clone(), row);
        Ok(())
    }

    async fn read_dag(&self, dag_id: &DagId) -> Result<StoredDag, StorageError> {
        let dags = self.dags.read().map_err(|_| StorageError::LockPoisoned)?;
        dags.get(dag_id)
            .cloned()
            .ok_or_else(|| StorageError::NotFound(format!("dag: {}", dag_id)))
    }

    async fn insert_dag_tasks(&self, tasks: Vec<StoredDagTask>) -> Result<usize, StorageError> {
        let mut dag_tasks = self.dag_tasks.write().map_err(|_| StorageError::LockPoisoned)?;
        let mut written = 0;
        for task in tasks {
            let versions = dag_tasks
                .entry((task.dag_id.clone(), task.task_id.clone()))
                .or_default();
            if let Some(current) = versions.last_mut() {
                if current.task_body_hash == task.task_body_hash {
                    continue;
                }
                current.is_current = false;
            }
            versions.push(StoredDagTask {
                is_current: true,
                ..task
            });
            written += 1;
        }
        Ok(written)
    }

    async fn read_dag_task(&self, dag_id: &DagId, task_id: &TaskId) -> Result<StoredDagTask, StorageError> {
        let dag_tasks = self.dag_tasks.read().map_err(|_| StorageError::LockPoisoned)?;
        dag_tasks
            .get(&(dag_id.clone(), task_id.clone()))
            .and_then(|versions| versions.last())
            .cloned()
            .ok_or_else(|| StorageError::NotFound(format!("dagtask: {}/{}", dag_id, task_id)))
    }

    async fn insert_dag_run(&self, dag_id: &DagId, at_time: DateTime<Utc>) -> Result<(), StorageError> {
        let mut runs = self.runs.write().map_err(|_| StorageError::LockPoisoned)?;
        let key = (dag_id.clone(), at_time);
        if runs.contains_key(&key) {
            return Err(StorageError::DuplicateKey(format!(
                "dagrun: {}/{}",
                dag_id,
                format_timestamp(at_time)
            )));
        }
        runs.insert(
            key,
            StoredDagRun {
                dag_id: dag_id.clone(),
                at_time,
                inserted_at: Utc::now(),
            },
        );
        Ok(())
    }

    async fn read_dag_runs(&self, dag_id: &DagId, limit: usize) -> Result<Vec<StoredDagRun>, StorageError> {
        let runs = self.runs.read().map_err(|_| StorageError::LockPoisoned)?;
        let mut result: Vec<_> = runs
            .values()
            .filter(|r| &r.dag_id == dag_id)
            .cloned()
            .collect();
        // Most recent first
        result.sort_by(|a, b| b.at_time.cmp(&a.at_time));
        result.truncate(limit);
        Ok(result)
    }

    async fn insert_dag_run_task(
        &self,
        dag_id: &DagId,
        at_time: DateTime<Utc>,
        task_id: &TaskId,
    ) -> Result<DateTime<Utc>, StorageError> {
        let mut tasks = self.tasks.write().map_err(|_| StorageError::LockPoisoned)?;
        let key = (dag_id.clone(), at_time, task_id.clone());
        if tasks.contains_key(&key) {
            return Err(StorageError::DuplicateKey(task_key_str(dag_id, at_time, task_id)));
        }
        let now = Utc::now().trunc_subsecs(6);
        tasks.insert(
            key,
            StoredDagRunTask {
                dag_id: dag_id.clone(),
                at_time,
                task_id: task_id.clone(),
                inserted_at: now,
                status: DagRunTaskStatus::Scheduled,
                status_updated_at: now,
                version: VERSION.to_string(),
            },
        );
        Ok(now)
    }

    async fn update_dag_run_task_status(
        &self,
        dag_id: &DagId,
        at_time: DateTime<Utc>,
        task_id: &TaskId,
        status: DagRunTaskStatus,
    ) -> Result<(), StorageError> {
        let mut tasks = self.tasks.write().map_err(|_| StorageError::LockPoisoned)?;
        let task = tasks
            .get_mut(&(dag_id.clone(), at_time, task_id.clone()))
            .ok_or_else(|| StorageError::NotFound(task_key_str(dag_id, at_time, task_id)))?;
        task.status = status;
        task.status_updated_at = Utc::now();
        Ok(())
    }

    async fn read_dag_run_task_status(
        &self,
        dag_id: &DagId,
        at_time: DateTime<Utc>,
        task_id: &TaskId,
    ) -> Result<TaskStatusRow, StorageError> {
        let tasks = self.tasks.read().map_err(|_| StorageError::LockPoisoned)?;
        tasks
            .get(&(dag_id.clone(), at_time, task_id.clone()))
            .map(|task| TaskStatusRow {
                status: task.status.to_string(),
                status_updated_at: format_timestamp(task.status_updated_at),
            })
            .ok_or_else(|| StorageError::NotFound(task_key_str(dag_id, at_time, task_id)))
    }

    async fn read_dag_run_tasks(
        &self,
        dag_id: &DagId,
        at_time: DateTime<Utc>,
    ) -> Result<Vec<StoredDagRunTask>, StorageError> {
        let tasks = self.tasks.read().map_err(|_| StorageError::LockPoisoned)?;
        let mut result: Vec<_> = tasks
            .values()
            .filter(|t| &t.dag_id == dag_id && t.at_time == at_time)
            .cloned()
            .collect();
        result.sort_by(|a, b| a.task_id.cmp(&b.task_id));
        Ok(result)
    }

    async fn count(&self, table: Table) -> Result<usize, StorageError> {
        let count = match table {
            Table::Dags => self.dags.read().map_err(|_| StorageError::LockPoisoned)?.len(),
            Table::DagTasks => self
                .dag_tasks
                .read()
                .map_err(|_| StorageError::LockPoisoned)?
                .values()
                .map(Vec::len)
                .sum(),
            Table::DagRuns => self.runs.read().map_err(|_| StorageError::LockPoisoned)?.len(),
            Table::DagRunTasks => self.tasks.read().map_err(|_| StorageError::LockPoisoned)?.len(),
        };
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeDelta, TimeZone};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2023, 10, 5, 12, 0, 0).unwrap()
    }

    fn stored_dag(id: &str, hash_tasks: &str, now: DateTime<Utc>) -> StoredDag {
        StoredDag {
            dag_id: DagId::new(id),
            start_ts: None,
            schedule: None,
            created_at: now,
            updated_at: None,
            create_version: "0.0.1".to_string(),
            update_version: None,
            hash_dag_meta: "meta".to_string(),
            hash_tasks: hash_tasks.to_string(),
            attributes: "{}".to_string(),
        }
    }

    fn dag_task(task_id: &str, hash: &str, now: DateTime<Utc>) -> StoredDagTask {
        StoredDagTask {
            dag_id: DagId::new("dag"),
            task_id: TaskId::new(task_id),
            is_current: true,
            inserted_at: now,
            version: VERSION.to_string(),
            task_type_name: "Shell".to_string(),
            task_body_hash: hash.to_string(),
            task_body_source: String::new(),
        }
    }

    #[tokio::test]
    async fn test_dag_task_versions() {
        let storage = InMemoryStorage::new();
        let dag_id = DagId::new("dag");
        let later = t0() + TimeDelta::hours(1);

        let written = storage
            .insert_dag_tasks(vec![dag_task("a", "h1", t0()), dag_task("b", "h1", t0())])
            .await
            .unwrap();
        assert_eq!(written, 2);

        // unchanged body is not versioned again
        let written = storage
            .insert_dag_tasks(vec![dag_task("a", "h2", later), dag_task("b", "h1", later)])
            .await
            .unwrap();
        assert_eq!(written, 1);
        assert_eq!(storage.count(Table::DagTasks).await.unwrap(), 3);

        let a = storage.read_dag_task(&dag_id, &TaskId::new("a")).await.unwrap();
        assert_eq!(a.task_body_hash, "h2");
        assert_eq!(a.inserted_at, later);
        assert!(a.is_current);

        let b = storage.read_dag_task(&dag_id, &TaskId::new("b")).await.unwrap();
        assert_eq!(b.inserted_at, t0());

        let dag_tasks = storage.dag_tasks.read().unwrap();
        let history = &dag_tasks[&(dag_id.clone(), TaskId::new("a"))];
        assert_eq!(history.iter().filter(|v| v.is_current).count(), 1);
        assert!(!history[0].is_current);
    }

    #[tokio::test]
    async fn test_read_missing_dag_task() {
        let storage = InMemoryStorage::new();
        let result = storage.read_dag_task(&DagId::new("dag"), &TaskId::new("t")).await;
        assert!(matches!(result, Err(StorageError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_insert_and_read_dag_runs() {
        let storage = InMemoryStorage::new();
        let dag_id = DagId::new("dag");

        for h in [1, 3, 2] {
            storage
                .insert_dag_run(&dag_id, t0() + TimeDelta::hours(h))
                .await
                .unwrap();
        }
        storage
            .insert_dag_run(&DagId::new("other"), t0())
            .await
            .unwrap();

        let runs = storage.read_dag_runs(&dag_id, 10).await.unwrap();
        let times: Vec<_> = runs.iter().map(|r| r.at_time).collect();
        assert_eq!(
            times,
            vec![
                t0() + TimeDelta::hours(3),
                t0() + TimeDelta::hours(2),
                t0() + TimeDelta::hours(1)
            ]
        );

        let latest = storage.read_dag_runs(&dag_id, 1).await.unwrap();
        assert_eq!(latest.len(), 1);
        assert_eq!(latest[0].at_time, t0() + TimeDelta::hours(3));
        assert_eq!(storage.count(Table::DagRuns).await.unwrap(), 4);
    }

    #[tokio::test]
    async fn test_duplicate_dag_run_rejected() {
        let storage = InMemoryStorage::new();
        let dag_id = DagId::new("dag");

        storage.insert_dag_run(&dag_id, t0()).await.unwrap();
        let result = storage.insert_dag_run(&dag_id, t0()).await;

        assert!(matches!(result, Err(StorageError::DuplicateKey(_))));
        assert_eq!(storage.count(Table::DagRuns).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_read_runs_for_unknown_dag_is_empty() {
        let storage = InMemoryStorage::new();
        let runs = storage.read_dag_runs(&DagId::new("nope"), 5).await.unwrap();
        assert!(runs.is_empty());
    }

    #[tokio::test]
    async fn test_upsert_dag_keeps_creation_fields() {
        let storage = InMemoryStorage::new();
        storage.upsert_dag(stored_dag("d", "v1", t0())).await.unwrap();

        let later = t0() + TimeDelta::days(1);
        storage.upsert_dag(stored_dag("d", "v2", later)).await.unwrap();

        let row = storage.read_dag(&DagId::new("d")).await.unwrap();
        assert_eq!(row.created_at, t0());
        assert_eq!(row.updated_at, Some(later));
        assert_eq!(row.hash_tasks, "v2");
        assert_eq!(storage.count(Table::Dags).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_read_missing_dag() {
        let storage = InMemoryStorage::new();
        let result = storage.read_dag(&DagId::new("nope")).await;
        assert!(matches!(result, Err(StorageError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_task_status_lifecycle() {
        let storage = InMemoryStorage::new();
        let dag_id = DagId::new("dag");
        let task_id = TaskId::new("extract");

        let inserted_at = storage.insert_dag_run_task(&dag_id, t0(), &task_id).await.unwrap();
        let row = storage
            .read_dag_run_task_status(&dag_id, t0(), &task_id)
            .await
            .unwrap();
        assert_eq!(row.status, "SCHEDULED");
        assert_eq!(row.status_updated_at, format_timestamp(inserted_at));
        assert_eq!(
            storage.read_dag_run_tasks(&dag_id, t0()).await.unwrap()[0].status_updated_at,
            inserted_at
        );

        storage
            .update_dag_run_task_status(&dag_id, t0(), &task_id, DagRunTaskStatus::Running)
            .await
            .unwrap();
        let row = storage
            .read_dag_run_task_status(&dag_id, t0(), &task_id)
            .await
            .unwrap();
        assert_eq!(row.status, "RUNNING");

        let tasks = storage.read_dag_run_tasks(&dag_id, t0()).await.unwrap();
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].status, DagRunTaskStatus::Running);
        assert_eq!(tasks[0].version, VERSION);
    }

    #[tokio::test]
    async fn test_task_status_not_found() {
        let storage = InMemoryStorage::new();
        let dag_id = DagId::new("dag");
        let task_id = TaskId::new("t");

        let read = storage.read_dag_run_task_status(&dag_id, t0(), &task_id).await;
        assert!(matches!(read, Err(StorageError::NotFound(_))));

        let update = storage
            .update_dag_run_task_status(&dag_id, t0(), &task_id, DagRunTaskStatus::Failed)
            .await;
        assert!(matches!(update, Err(StorageError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_duplicate_dag_run_task_rejected() {
        let storage = InMemoryStorage::new();
        let dag_id = DagId::new("dag");
        let task_id = TaskId::new("t");

        storage.insert_dag_run_task(&dag_id, t0(), &task_id).await.unwrap();
        let result = storage.insert_dag_run_task(&dag_id, t0(), &task_id).await;
        assert!(matches!(result, Err(StorageError::DuplicateKey(_))));
        assert_eq!(storage.count(Table::DagRunTasks).await.unwrap(), 1);
    }
}
