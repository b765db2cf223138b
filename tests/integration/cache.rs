//! Task status cache integration tests.

use crate::common::t0;
use dagsched::scheduler::CacheError;
use dagsched::testing::{hourly_schedule, scheduled_chain_dag};
use dagsched::{
    DagId, DagRunTask, DagRunTaskStatus, InMemoryStorage, Scheduler, Storage, StorageError,
    TaskId,
};
use std::sync::Arc;

async fn scheduled_run() -> (Arc<InMemoryStorage>, Scheduler<InMemoryStorage>) {
    let storage = Arc::new(InMemoryStorage::new());
    let mut scheduler = Scheduler::with_storage(Arc::clone(&storage));
    scheduler
        .register(scheduled_chain_dag("etl", &["extract", "load"], hourly_schedule(t0()), false))
        .unwrap();
    scheduler.tick(t0()).await.unwrap();
    (storage, scheduler)
}

/// Test: The cache keeps its value until it is pulled again from storage.
#[tokio::test]
async fn test_pull_refreshes_stale_entry() {
    let (storage, scheduler) = scheduled_run().await;
    let cache = scheduler.task_cache();
    let key = DagRunTask::new("etl", t0(), "load");

    storage
        .update_dag_run_task_status(&DagId::new("etl"), t0(), &TaskId::new("load"), DagRunTaskStatus::Running)
        .await
        .unwrap();
    assert_eq!(cache.get(&key).unwrap().status, DagRunTaskStatus::Scheduled);

    let pulled = cache.pull_from_database(&key, storage.as_ref()).await.unwrap();
    assert_eq!(pulled.status, DagRunTaskStatus::Running);
    assert_eq!(cache.get(&key).unwrap(), pulled);
}

/// Test: A miss is filled from storage by `get_or_pull`.
#[tokio::test]
async fn test_get_or_pull_fills_miss() {
    let (storage, scheduler) = scheduled_run().await;
    let cache = scheduler.task_cache();
    let key = DagRunTask::new("etl", t0(), "extract");

    cache.remove(&key).unwrap();
    assert!(matches!(cache.get(&key), Err(CacheError::KeyNotFound(_))));

    let value = cache.get_or_pull(&key, storage.as_ref()).await.unwrap();
    assert_eq!(value.status, DagRunTaskStatus::Scheduled);
    assert_eq!(cache.len(), 2);
}

/// Test: Keys unknown to storage surface the storage error and are not cached.
#[tokio::test]
async fn test_pull_unknown_key() {
    let (storage, scheduler) = scheduled_run().await;
    let cache = scheduler.task_cache();
    let key = DagRunTask::new("etl", t0(), "missing");

    let result = cache.get_or_pull(&key, storage.as_ref()).await;
    assert!(matches!(
        result,
        Err(CacheError::Storage(StorageError::NotFound(_)))
    ));
    assert_eq!(cache.len(), 2);
}
