//! SQLite persistence integration tests.

use crate::common::{drain, hours, t0};
use chrono::TimeDelta;
use dagsched::testing::{hourly_schedule, scheduled_chain_dag};
use dagsched::{DagId, DagRun, Scheduler, SqliteStorage, Storage, Table};
use std::sync::Arc;

/// Test: Scheduling over SQLite behaves like the in-memory backend.
#[tokio::test]
async fn test_scheduling_with_sqlite() {
    let storage = Arc::new(SqliteStorage::in_memory().await.unwrap());
    let mut scheduler = Scheduler::with_storage(Arc::clone(&storage));
    scheduler
        .register(scheduled_chain_dag("etl", &["extract", "load"], hourly_schedule(t0()), false))
        .unwrap();

    let times = [
        t0() - TimeDelta::minutes(1),
        t0() + TimeDelta::seconds(1),
        t0() + hours(1) - TimeDelta::seconds(1),
        t0() + hours(1) + TimeDelta::minutes(1),
        t0() + hours(2) + TimeDelta::minutes(30),
    ];
    for now in times {
        scheduler.tick(now).await.unwrap();
    }

    let expected: Vec<_> = (0..3).map(|h| DagRun::new("etl", t0() + hours(h))).collect();
    assert_eq!(drain(&scheduler.queue()), expected);
    assert_eq!(storage.count(Table::Dags).await.unwrap(), 1);
    assert_eq!(storage.count(Table::DagTasks).await.unwrap(), 2);
    assert_eq!(storage.count(Table::DagRuns).await.unwrap(), 3);
    assert_eq!(storage.count(Table::DagRunTasks).await.unwrap(), 6);
}

/// Test: Runs survive a restart on the same database file.
#[tokio::test]
async fn test_restart_from_database_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("dagsched.db");

    {
        let storage = Arc::new(SqliteStorage::new(&path).await.unwrap());
        let mut scheduler = Scheduler::with_storage(Arc::clone(&storage));
        scheduler
            .register(scheduled_chain_dag("etl", &["a"], hourly_schedule(t0()), false))
            .unwrap();
        scheduler.tick(t0()).await.unwrap();
        scheduler.tick(t0() + hours(1)).await.unwrap();
        storage.close().await;
    }

    let storage = Arc::new(SqliteStorage::new(&path).await.unwrap());
    let runs = storage.read_dag_runs(&DagId::new("etl"), 10).await.unwrap();
    assert_eq!(runs.len(), 2);
    assert_eq!(runs[0].at_time, t0() + hours(1));

    let mut scheduler = Scheduler::with_storage(Arc::clone(&storage));
    scheduler
        .register(scheduled_chain_dag("etl", &["a"], hourly_schedule(t0()), false))
        .unwrap();
    let report = scheduler.tick(t0() + hours(6) + TimeDelta::minutes(5)).await.unwrap();
    assert_eq!(report.scheduled, vec![DagRun::new("etl", t0() + hours(6))]);

    let row = storage.read_dag(&DagId::new("etl")).await.unwrap();
    assert!(row.updated_at.is_some());
    assert_eq!(row.schedule.as_deref(), Some("@every 1h"));
}
