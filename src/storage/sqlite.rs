//! SQLite storage implementation.
//!
//! Provides persistent storage using SQLite database. Timestamps are stored
//! as canonical RFC 3339 text, so ordering by the text columns orders by time.

use async_trait::async_trait;
use chrono::{DateTime, SubsecRound, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::path::Path;
use std::str::FromStr;

use super::{
    Storage, StorageError, StoredDag, StoredDagRun, StoredDagRunTask, StoredDagTask, Table,
    TaskStatusRow, VERSION,
};
use crate::core::types::{DagId, TaskId, format_timestamp, parse_timestamp};
use crate::scheduler::DagRunTaskStatus;

/// SQLite storage backend.
///
/// Provides persistent storage with automatic schema migration.
pub struct SqliteStorage {
    pool: SqlitePool,
}

impl SqliteStorage {
    /// Create a new SQLite storage with the given database path.
    ///
    /// Creates the database file if it doesn't exist and runs migrations.
    pub async fn new(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let path_str = path.as_ref().to_string_lossy();
        let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", path_str))
            .map_err(|e| StorageError::Other(e.to_string()))?
            .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .map_err(|e| StorageError::Other(e.to_string()))?;

        let storage = Self { pool };
        storage.run_migrations().await?;
        Ok(storage)
    }

    /// Create an in-memory SQLite database (useful for testing).
    pub async fn in_memory() -> Result<Self, StorageError> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .map_err(|e| StorageError::Other(e.to_string()))?;

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .map_err(|e| StorageError::Other(e.to_string()))?;

        let storage = Self { pool };
        storage.run_migrations().await?;
        Ok(storage)
    }

    /// Run database migrations.
    async fn run_migrations(&self) -> Result<(), StorageError> {
        let schema = include_str!("../../migrations/001_initial_schema.sql");
        sqlx::raw_sql(schema)
            .execute(&self.pool)
            .await
            .map_err(|e| StorageError::Other(format!("migration failed: {}", e)))?;
        Ok(())
    }

    /// Close the database connection pool.
    pub async fn close(&self) {
        self.pool.close().await;
    }
}

fn parse_ts(value: &str) -> Result<DateTime<Utc>, StorageError> {
    parse_timestamp(value).map_err(|e| StorageError::SerializationError(e.to_string()))
}

fn parse_opt_ts(value: Option<String>) -> Result<Option<DateTime<Utc>>, StorageError> {
    value.as_deref().map(parse_ts).transpose()
}

fn parse_status(value: &str) -> Result<DagRunTaskStatus, StorageError> {
    value
        .parse::<DagRunTaskStatus>()
        .map_err(|e| StorageError::SerializationError(e.to_string()))
}

fn task_key_str(dag_id: &DagId, exec_ts: &str, task_id: &TaskId) -> String {
    format!("dagruntask: {}/{}/{}", dag_id, exec_ts, task_id)
}

type DagRow = (
    String,
    Option<String>,
    Option<String>,
    String,
    Option<String>,
    String,
    Option<String>,
    String,
    String,
    String,
);

type DagTaskRow = (String, String, bool, String, String, String, String, String);

type DagRunTaskRow = (String, String, String, String, String, String, String);

fn db_err(e: sqlx::Error) -> StorageError {
    StorageError::Other(e.to_string())
}

#[async_trait]
impl Storage for SqliteStorage {
    async fn upsert_dag(&self, dag: StoredDag) -> Result<(), StorageError> {
        sqlx::query(
            r#"
            INSERT INTO dags (dag_id, start_ts, schedule, create_ts, latest_update_ts,
                              create_version, latest_update_version, hash_dag_meta,
                              hash_tasks, attributes)
            VALUES (?, ?, ?, ?, NULL, ?, NULL, ?, ?, ?)
            ON CONFLICT(dag_id) DO UPDATE SET
                start_ts = excluded.start_ts,
                schedule = excluded.schedule,
                latest_update_ts = excluded.create_ts,
                latest_update_version = excluded.create_version,
                hash_dag_meta = excluded.hash_dag_meta,
                hash_tasks = excluded.hash_tasks,
                attributes = excluded.attributes
            "#,
        )
        .bind(dag.dag_id.as_str())
        .bind(dag.start_ts.map(format_timestamp))
        .bind(&dag.schedule)
        .bind(format_timestamp(dag.created_at))
        .bind(&dag.create_version)
        .bind(&dag.hash_dag_meta)
        .bind(&dag.hash_tasks)
        .bind(&dag.attributes)
        .execute(&self.pool)
        .await
        .map_err(|e| StorageError::Other(e.to_string()))?;

        tracing::debug!(dag_id = %dag.dag_id, hash_tasks = %dag.hash_tasks, "Upserted DAG");
        Ok(())
    }

    async fn read_dag(&self, dag_id: &DagId) -> Result<StoredDag, StorageError> {
        let row: DagRow = sqlx::query_as(
            r#"
            SELECT dag_id, start_ts, schedule, create_ts, latest_update_ts, create_version,
                   latest_update_version, hash_dag_meta, hash_tasks, attributes
            FROM dags WHERE dag_id = ?
            "#,
        )
        .bind(dag_id.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| StorageError::Other(e.to_string()))?
        .ok_or_else(|| StorageError::NotFound(format!("dag: {}", dag_id)))?;

        Ok(StoredDag {
            dag_id: DagId::new(row.0),
            start_ts: parse_opt_ts(row.1)?,
            schedule: row.2,
            created_at: parse_ts(&row.3)?,
            updated_at: parse_opt_ts(row.4)?,
            create_version: row.5,
            update_version: row.6,
            hash_dag_meta: row.7,
            hash_tasks: row.8,
            attributes: row.9,
        })
    }

    async fn insert_dag_tasks(&self, tasks: Vec<StoredDagTask>) -> Result<usize, StorageError> {
        // dropping the transaction on an early return rolls it back
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        let mut written = 0;

        for task in &tasks {
            let current: Option<(String,)> = sqlx::query_as(
                "SELECT task_body_hash FROM dagtasks WHERE dag_id = ? AND task_id = ? AND is_current = 1",
            )
            .bind(task.dag_id.as_str())
            .bind(task.task_id.as_str())
            .fetch_optional(&mut *tx)
            .await
            .map_err(db_err)?;

            if current.is_some_and(|(hash,)| hash == task.task_body_hash) {
                continue;
            }

            sqlx::query("UPDATE dagtasks SET is_current = 0 WHERE dag_id = ? AND task_id = ? AND is_current = 1")
                .bind(task.dag_id.as_str())
                .bind(task.task_id.as_str())
                .execute(&mut *tx)
                .await
                .map_err(db_err)?;

            sqlx::query(
                r#"
                INSERT INTO dagtasks (dag_id, task_id, is_current, insert_ts, version,
                                      task_type_name, task_body_hash, task_body_source)
                VALUES (?, ?, 1, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(task.dag_id.as_str())
            .bind(task.task_id.as_str())
            .bind(format_timestamp(task.inserted_at))
            .bind(&task.version)
            .bind(&task.task_type_name)
            .bind(&task.task_body_hash)
            .bind(&task.task_body_source)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
            written += 1;
        }

        tx.commit().await.map_err(db_err)?;
        tracing::debug!(tasks = tasks.len(), written, "Stored task versions");
        Ok(written)
    }

    async fn read_dag_task(&self, dag_id: &DagId, task_id: &TaskId) -> Result<StoredDagTask, StorageError> {
        let row: DagTaskRow = sqlx::query_as(
            r#"
            SELECT dag_id, task_id, is_current, insert_ts, version, task_type_name,
                   task_body_hash, task_body_source
            FROM dagtasks WHERE dag_id = ? AND task_id = ? AND is_current = 1
            "#,
        )
        .bind(dag_id.as_str())
        .bind(task_id.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?
        .ok_or_else(|| StorageError::NotFound(format!("dagtask: {}/{}", dag_id, task_id)))?;

        Ok(StoredDagTask {
            dag_id: DagId::new(row.0),
            task_id: TaskId::new(row.1),
            is_current: row.2,
            inserted_at: parse_ts(&row.3)?,
            version: row.4,
            task_type_name: row.5,
            task_body_hash: row.6,
            task_body_source: row.7,
        })
    }

    async fn insert_dag_run(&self, dag_id: &DagId, at_time: DateTime<Utc>) -> Result<(), StorageError> {
        let exec_ts = format_timestamp(at_time);
        let result = sqlx::query("INSERT INTO dagruns (dag_id, exec_ts, insert_ts) VALUES (?, ?, ?)")
            .bind(dag_id.as_str())
            .bind(&exec_ts)
            .bind(format_timestamp(Utc::now()))
            .execute(&self.pool)
            .await;

        match result {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(e)) if e.is_unique_violation() => Err(
                StorageError::DuplicateKey(format!("dagrun: {}/{}", dag_id, exec_ts)),
            ),
            Err(e) => Err(StorageError::Other(e.to_string())),
        }
    }

    async fn read_dag_runs(&self, dag_id: &DagId, limit: usize) -> Result<Vec<StoredDagRun>, StorageError> {
        let rows: Vec<(String, String, String)> = sqlx::query_as(
            "SELECT dag_id, exec_ts, insert_ts FROM dagruns WHERE dag_id = ? ORDER BY exec_ts DESC LIMIT ?",
        )
        .bind(dag_id.as_str())
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StorageError::Other(e.to_string()))?;

        rows.into_iter()
            .map(|row| {
                Ok(StoredDagRun {
                    dag_id: DagId::new(row.0),
                    at_time: parse_ts(&row.1)?,
                    inserted_at: parse_ts(&row.2)?,
                })
            })
            .collect()
    }

    async fn insert_dag_run_task(
        &self,
        dag_id: &DagId,
        at_time: DateTime<Utc>,
        task_id: &TaskId,
    ) -> Result<DateTime<Utc>, StorageError> {
        let exec_ts = format_timestamp(at_time);
        let inserted_at = Utc::now().trunc_subsecs(6);
        let now = format_timestamp(inserted_at);
        let result = sqlx::query(
            r#"
            INSERT INTO dagruntasks (dag_id, exec_ts, task_id, insert_ts, status, status_update_ts, version)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(dag_id.as_str())
        .bind(&exec_ts)
        .bind(task_id.as_str())
        .bind(&now)
        .bind(DagRunTaskStatus::Scheduled.as_str())
        .bind(&now)
        .bind(VERSION)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(inserted_at),
            Err(sqlx::Error::Database(e)) if e.is_unique_violation() => Err(
                StorageError::DuplicateKey(task_key_str(dag_id, &exec_ts, task_id)),
            ),
            Err(e) => Err(StorageError::Other(e.to_string())),
        }
    }

    async fn update_dag_run_task_status(
        &self,
        dag_id: &DagId,
        at_time: DateTime<Utc>,
        task_id: &TaskId,
        status: DagRunTaskStatus,
    ) -> Result<(), StorageError> {
        let exec_ts = format_timestamp(at_time);
        let result = sqlx::query(
            r#"
            UPDATE dagruntasks SET status = ?, status_update_ts = ?
            WHERE dag_id = ? AND exec_ts = ? AND task_id = ?
            "#,
        )
        .bind(status.as_str())
        .bind(format_timestamp(Utc::now()))
        .bind(dag_id.as_str())
        .bind(&exec_ts)
        .bind(task_id.as_str())
        .execute(&self.pool)
        .await
        .map_err(|e| StorageError::Other(e.to_string()))?;

        if result.rows_affected() == 0 {
            return Err(StorageError::NotFound(task_key_str(dag_id, &exec_ts, task_id)));
        }
        Ok(())
    }

    async fn read_dag_run_task_status(
        &self,
        dag_id: &DagId,
        at_time: DateTime<Utc>,
        task_id: &TaskId,
    ) -> Result<TaskStatusRow, StorageError> {
        let exec_ts = format_timestamp(at_time);
        let row: (String, String) = sqlx::query_as(
            "SELECT status, status_update_ts FROM dagruntasks WHERE dag_id = ? AND exec_ts = ? AND task_id = ?",
        )
        .bind(dag_id.as_str())
        .bind(&exec_ts)
        .bind(task_id.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| StorageError::Other(e.to_string()))?
        .ok_or_else(|| StorageError::NotFound(task_key_str(dag_id, &exec_ts, task_id)))?;

        Ok(TaskStatusRow {
            status: row.0,
            status_updated_at: row.1,
        })
    }

    async fn read_dag_run_tasks(
        &self,
        dag_id: &DagId,
        at_time: DateTime<Utc>,
    ) -> Result<Vec<StoredDagRunTask>, StorageError> {
        let rows: Vec<DagRunTaskRow> = sqlx::query_as(
            r#"
            SELECT dag_id, exec_ts, task_id, insert_ts, status, status_update_ts, version
            FROM dagruntasks WHERE dag_id = ? AND exec_ts = ?
            ORDER BY task_id
            "#,
        )
        .bind(dag_id.as_str())
        .bind(format_timestamp(at_time))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StorageError::Other(e.to_string()))?;

        rows.into_iter()
            .map(|row| {
                Ok(StoredDagRunTask {
                    dag_id: DagId::new(row.0),
                    at_time: parse_ts(&row.1)?,
                    task_id: TaskId::new(row.2),
                    inserted_at: parse_ts(&row.3)?,
                    status: parse_status(&row.4)?,
                    status_updated_at: parse_ts(&row.5)?,
                    version: row.6,
                })
            })
            .collect()
    }

    async fn count(&self, table: Table) -> Result<usize, StorageError> {
        let query = format!("SELECT COUNT(*) FROM {}", table.as_str());
        let (count,): (i64,) = sqlx::query_as(&query)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| StorageError::Other(e.to_string()))?;
        Ok(count as usize)
    }
}
