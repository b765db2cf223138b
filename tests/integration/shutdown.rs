//! Background loop integration tests.
//!
//! Tests that verify the started scheduler schedules on its own, obeys pause
//! and resume, and stops on shutdown.

use crate::common::{drain, wait_for_queue_size};
use chrono::{TimeDelta, Utc};
use dagsched::testing::{chain_dag, hourly_schedule, scheduled_chain_dag};
use dagsched::{InMemoryStorage, Scheduler, SchedulerState};
use std::time::Duration;

/// Test: A started scheduler queues a due run without being told to.
#[tokio::test]
async fn test_started_scheduler_queues_due_run() {
    let start = Utc::now() - TimeDelta::minutes(10);
    let mut scheduler =
        Scheduler::new(InMemoryStorage::new()).with_tick_interval(Duration::from_millis(10));
    scheduler
        .register(scheduled_chain_dag("etl", &["a"], hourly_schedule(start), false))
        .unwrap();
    let queue = scheduler.queue();

    let (handle, task) = scheduler.start().await;
    wait_for_queue_size(&queue, 1, Duration::from_secs(5)).await;

    handle.shutdown().await.unwrap();
    task.await.unwrap();

    let runs = drain(&queue);
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].at_time, start);
}

/// Test: While paused, only explicit ticks schedule.
#[tokio::test]
async fn test_paused_scheduler_only_ticks_on_request() {
    let start = Utc::now() - TimeDelta::minutes(10);
    let mut scheduler =
        Scheduler::new(InMemoryStorage::new()).with_tick_interval(Duration::from_secs(3600));
    scheduler
        .register(scheduled_chain_dag("etl", &["a"], hourly_schedule(start), false))
        .unwrap();
    scheduler.register(chain_dag("manual", &["b"])).unwrap();
    let queue = scheduler.queue();

    let (handle, task) = scheduler.start().await;
    // the first interval tick fires immediately
    wait_for_queue_size(&queue, 1, Duration::from_secs(5)).await;
    drain(&queue);

    handle.pause().await.unwrap();
    assert_eq!(handle.state().await, SchedulerState::Paused);

    let report = handle.tick_now().await.unwrap();
    assert!(report.is_empty());

    handle.resume().await.unwrap();
    assert!(handle.is_running().await);

    handle.shutdown().await.unwrap();
    task.await.unwrap();
    assert!(queue.is_empty());
}

/// Test: Commands after shutdown fail with a channel error.
#[tokio::test]
async fn test_commands_after_shutdown_fail() {
    let scheduler = Scheduler::new(InMemoryStorage::new());
    let (handle, task) = scheduler.start().await;

    handle.shutdown().await.unwrap();
    task.await.unwrap();

    assert_eq!(handle.state().await, SchedulerState::Stopped);
    assert!(matches!(
        handle.tick_now().await,
        Err(dagsched::SchedulerError::ChannelError(_))
    ));
}
