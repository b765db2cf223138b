//! Scheduling pass integration tests.
//!
//! Drive the scheduler with an explicit clock and check what it stores and
//! queues.

use crate::common::{drain, hours, t0};
use chrono::TimeDelta;
use dagsched::testing::{chain_dag, hourly_schedule, scheduled_chain_dag};
use dagsched::{
    DagId, DagRun, FixedSchedule, InMemoryStorage, Scheduler, Storage, Table, TaskId,
};
use std::sync::Arc;

/// Test: A fresh DAG first fires at its start, then once per pass until it
/// has caught up with the clock.
#[tokio::test]
async fn test_fresh_dag_fires_one_occurrence_per_pass() {
    let storage = Arc::new(InMemoryStorage::new());
    let mut scheduler = Scheduler::with_storage(Arc::clone(&storage));
    scheduler
        .register(scheduled_chain_dag("etl", &["extract", "load"], hourly_schedule(t0()), false))
        .unwrap();

    let now = t0() + hours(3) + TimeDelta::minutes(30);
    let mut scheduled = Vec::new();
    for _ in 0..6 {
        let report = scheduler.tick(now).await.unwrap();
        assert!(report.failures.is_empty());
        scheduled.extend(report.scheduled);
    }

    let expected: Vec<_> = (0..4).map(|h| DagRun::new("etl", t0() + hours(h))).collect();
    assert_eq!(scheduled, expected);
    assert_eq!(drain(&scheduler.queue()), expected);
    assert_eq!(storage.count(Table::DagRuns).await.unwrap(), 4);
    assert_eq!(storage.count(Table::DagRunTasks).await.unwrap(), 8);
}

/// Test: Nothing fires before the schedule starts.
#[tokio::test]
async fn test_nothing_scheduled_before_start() {
    let mut scheduler = Scheduler::new(InMemoryStorage::new());
    scheduler
        .register(scheduled_chain_dag("later", &["a"], hourly_schedule(t0()), false))
        .unwrap();

    let report = scheduler.tick(t0() - TimeDelta::seconds(1)).await.unwrap();
    assert!(report.is_empty());

    let report = scheduler.tick(t0()).await.unwrap();
    assert_eq!(report.scheduled, vec![DagRun::new("later", t0())]);
}

/// Test: Unscheduled DAGs are stored but never queued.
#[tokio::test]
async fn test_unscheduled_dag_never_fires() {
    let storage = Arc::new(InMemoryStorage::new());
    let mut scheduler = Scheduler::with_storage(Arc::clone(&storage));
    scheduler.register(chain_dag("manual", &["a", "b"])).unwrap();

    for day in 0..3 {
        let report = scheduler.tick(t0() + TimeDelta::days(day)).await.unwrap();
        assert!(report.is_empty());
    }

    assert!(scheduler.queue().is_empty());
    assert_eq!(storage.count(Table::Dags).await.unwrap(), 1);
    assert_eq!(storage.count(Table::DagRuns).await.unwrap(), 0);
}

/// Test: DAGs with different intervals advance independently, each in
/// strictly increasing time order.
#[tokio::test]
async fn test_many_dags_interleave() {
    let mut scheduler = Scheduler::new(InMemoryStorage::new());
    scheduler
        .register(scheduled_chain_dag("hourly", &["a"], hourly_schedule(t0()), false))
        .unwrap();
    scheduler
        .register(scheduled_chain_dag(
            "quarter",
            &["a"],
            FixedSchedule::new(t0(), TimeDelta::minutes(15)).unwrap(),
            false,
        ))
        .unwrap();

    let mut now = t0();
    while now <= t0() + hours(1) {
        scheduler.tick(now).await.unwrap();
        now += TimeDelta::minutes(5);
    }

    let runs = drain(&scheduler.queue());
    let hourly: Vec<_> = runs
        .iter()
        .filter(|r| r.dag_id.as_str() == "hourly")
        .map(|r| r.at_time)
        .collect();
    let quarter: Vec<_> = runs
        .iter()
        .filter(|r| r.dag_id.as_str() == "quarter")
        .map(|r| r.at_time)
        .collect();

    assert_eq!(hourly, vec![t0(), t0() + hours(1)]);
    assert_eq!(quarter.len(), 5);
    assert!(quarter.windows(2).all(|w| w[1] - w[0] == TimeDelta::minutes(15)));
}

/// Test: Each new run records all of its tasks as scheduled.
#[tokio::test]
async fn test_run_tasks_recorded() {
    let storage = Arc::new(InMemoryStorage::new());
    let mut scheduler = Scheduler::with_storage(Arc::clone(&storage));
    scheduler
        .register(scheduled_chain_dag(
            "etl",
            &["extract", "transform", "load"],
            hourly_schedule(t0()),
            false,
        ))
        .unwrap();

    scheduler.tick(t0()).await.unwrap();

    let tasks = storage.read_dag_run_tasks(&DagId::new("etl"), t0()).await.unwrap();
    let ids: Vec<_> = tasks.iter().map(|t| t.task_id.clone()).collect();
    assert_eq!(
        ids,
        vec![TaskId::new("extract"), TaskId::new("load"), TaskId::new("transform")]
    );
    assert!(tasks.iter().all(|t| t.status.as_str() == "SCHEDULED"));
    assert_eq!(scheduler.task_cache().len(), 3);
}

/// Test: A run that finds the queue full stays stored with its tasks and
/// reaches the queue once a worker makes room.
#[tokio::test]
async fn test_full_queue_holds_run_until_drained() {
    let storage = Arc::new(InMemoryStorage::new());
    let mut scheduler = Scheduler::with_storage(Arc::clone(&storage)).with_queue_capacity(1);
    scheduler
        .register(scheduled_chain_dag("a", &["t"], hourly_schedule(t0()), false))
        .unwrap();
    scheduler
        .register(scheduled_chain_dag("b", &["t"], hourly_schedule(t0()), false))
        .unwrap();

    let report = scheduler.tick(t0()).await.unwrap();
    assert_eq!(report.scheduled, vec![DagRun::new("a", t0())]);
    assert_eq!(report.deferred, vec![DagRun::new("b", t0())]);
    assert!(report.failures.is_empty());
    assert_eq!(storage.count(Table::DagRuns).await.unwrap(), 2);
    assert_eq!(storage.count(Table::DagRunTasks).await.unwrap(), 2);

    assert_eq!(drain(&scheduler.queue()), vec![DagRun::new("a", t0())]);
    let report = scheduler.tick(t0() + TimeDelta::minutes(30)).await.unwrap();
    assert_eq!(report.scheduled, vec![DagRun::new("b", t0())]);
    assert_eq!(drain(&scheduler.queue()), vec![DagRun::new("b", t0())]);
    assert_eq!(
        scheduler.next_schedules().unwrap()[&DagId::new("b")],
        Some(t0() + hours(1))
    );
}
