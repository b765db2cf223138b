//! Common test utilities shared across integration tests.

use chrono::{DateTime, TimeDelta, TimeZone, Utc};
use dagsched::{DagRun, RunQueue};
use std::time::Duration;

/// Fixed reference time used as schedule start.
pub fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2023, 10, 5, 12, 0, 0).unwrap()
}

pub fn hours(n: i64) -> TimeDelta {
    TimeDelta::hours(n)
}

/// Pop every queued run, oldest first.
pub fn drain(queue: &RunQueue<DagRun>) -> Vec<DagRun> {
    let mut runs = Vec::new();
    while let Ok(run) = queue.pop() {
        runs.push(run);
    }
    runs
}

/// Wait until the queue holds at least `expected` runs, polling every 10ms.
///
/// # Panics
///
/// Panics if the timeout is reached first.
pub async fn wait_for_queue_size(queue: &RunQueue<DagRun>, expected: usize, timeout: Duration) {
    let start = tokio::time::Instant::now();
    loop {
        if queue.size() >= expected {
            return;
        }
        if start.elapsed() > timeout {
            panic!(
                "Timeout waiting for {} queued run(s), current size: {}",
                expected,
                queue.size()
            );
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
