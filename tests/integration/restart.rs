//! Restart integration tests.
//!
//! A new scheduler over storage written by an earlier one must pick up from
//! the stored runs instead of starting over.

use crate::common::{drain, hours, t0};
use chrono::TimeDelta;
use dagsched::testing::{hourly_schedule, scheduled_chain_dag};
use dagsched::{DagId, DagRun, InMemoryStorage, Scheduler, Storage, StorageError, Table, TaskId};
use std::sync::Arc;

async fn run_until(storage: &Arc<InMemoryStorage>, catch_up: bool, hours_done: i64) {
    let mut scheduler = Scheduler::with_storage(Arc::clone(storage));
    scheduler
        .register(scheduled_chain_dag("etl", &["a"], hourly_schedule(t0()), catch_up))
        .unwrap();
    for h in 0..hours_done {
        scheduler.tick(t0() + hours(h)).await.unwrap();
    }
}

/// Test: Without catch-up, a restarted scheduler skips straight to the most
/// recent missed occurrence.
#[tokio::test]
async fn test_restart_skips_missed_runs() {
    let storage = Arc::new(InMemoryStorage::new());
    run_until(&storage, false, 3).await;

    let mut scheduler = Scheduler::with_storage(Arc::clone(&storage));
    scheduler
        .register(scheduled_chain_dag("etl", &["a"], hourly_schedule(t0()), false))
        .unwrap();

    let now = t0() + TimeDelta::days(2) + TimeDelta::minutes(20);
    let report = scheduler.tick(now).await.unwrap();
    assert_eq!(report.scheduled, vec![DagRun::new("etl", t0() + TimeDelta::days(2))]);

    let report = scheduler.tick(now).await.unwrap();
    assert!(report.is_empty());
    assert_eq!(storage.count(Table::DagRuns).await.unwrap(), 4);
}

/// Test: With catch-up, a restarted scheduler continues one interval after
/// the last stored run.
#[tokio::test]
async fn test_restart_with_catch_up_resumes_after_last_run() {
    let storage = Arc::new(InMemoryStorage::new());
    run_until(&storage, true, 3).await;

    let mut scheduler = Scheduler::with_storage(Arc::clone(&storage));
    scheduler
        .register(scheduled_chain_dag("etl", &["a"], hourly_schedule(t0()), true))
        .unwrap();

    let now = t0() + hours(5) + TimeDelta::minutes(1);
    let mut runs = Vec::new();
    for _ in 0..5 {
        runs.extend(scheduler.tick(now).await.unwrap().scheduled);
    }

    let times: Vec<_> = runs.iter().map(|r| r.at_time).collect();
    assert_eq!(times, vec![t0() + hours(3), t0() + hours(4), t0() + hours(5)]);
    assert_eq!(drain(&scheduler.queue()), runs);
}

/// Test: Re-registering a changed DAG updates its stored row and keeps the
/// creation fields.
#[tokio::test]
async fn test_restart_updates_stored_dag() {
    let storage = Arc::new(InMemoryStorage::new());

    let mut first = Scheduler::with_storage(Arc::clone(&storage));
    first
        .register(scheduled_chain_dag("etl", &["a"], hourly_schedule(t0()), false))
        .unwrap();
    first.initialize(t0()).await.unwrap();
    let before = storage.read_dag(&DagId::new("etl")).await.unwrap();
    assert!(before.updated_at.is_none());

    let mut second = Scheduler::with_storage(Arc::clone(&storage));
    second
        .register(scheduled_chain_dag("etl", &["a", "b"], hourly_schedule(t0()), false))
        .unwrap();
    second.initialize(t0() + hours(1)).await.unwrap();
    let after = storage.read_dag(&DagId::new("etl")).await.unwrap();

    assert_eq!(after.created_at, before.created_at);
    assert_eq!(after.updated_at, Some(t0() + hours(1)));
    assert_eq!(after.hash_dag_meta, before.hash_dag_meta);
    assert_ne!(after.hash_tasks, before.hash_tasks);
    assert_eq!(storage.count(Table::Dags).await.unwrap(), 1);

    // only the added task gets a version, "a" keeps its first one
    assert_eq!(storage.count(Table::DagTasks).await.unwrap(), 2);
    let a = storage.read_dag_task(&DagId::new("etl"), &TaskId::new("a")).await.unwrap();
    assert_eq!(a.inserted_at, t0());
    let b = storage.read_dag_task(&DagId::new("etl"), &TaskId::new("b")).await.unwrap();
    assert_eq!(b.inserted_at, t0() + hours(1));
}

/// Test: A run already stored by another scheduler is reported as a conflict.
#[tokio::test]
async fn test_concurrent_scheduler_conflict() {
    let storage = Arc::new(InMemoryStorage::new());
    let mut a = Scheduler::with_storage(Arc::clone(&storage));
    let mut b = Scheduler::with_storage(Arc::clone(&storage));
    for scheduler in [&mut a, &mut b] {
        scheduler
            .register(scheduled_chain_dag("etl", &["t"], hourly_schedule(t0()), false))
            .unwrap();
        scheduler.initialize(t0()).await.unwrap();
    }

    let report = a.tick(t0()).await.unwrap();
    assert_eq!(report.scheduled.len(), 1);

    let report = b.tick(t0()).await.unwrap();
    assert!(report.scheduled.is_empty());
    assert!(matches!(
        &report.failures[0].1,
        dagsched::SchedulerError::Storage(StorageError::DuplicateKey(_))
    ));
    assert!(b.queue().is_empty());
}
