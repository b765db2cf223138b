//! Scheduler engine implementation.
//!
//! The scheduler is responsible for:
//! - Deciding, per DAG, when the next run is due
//! - Persisting new runs and queueing them for workers
//! - Holding persisted runs back while the queue is full
//! - Recording task versions and the tasks of each new run
//! - Pause, resume and shutdown of the background loop
//!
//! The decision logic lives in free functions so it can be driven with an
//! explicit clock. [`Scheduler`] wraps them in a tokio interval loop.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{RwLock, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::core::dag::Dag;
use crate::core::types::{DagId, TaskId, format_timestamp};
use crate::storage::{Storage, StoredDag, StoredDagTask};

use super::cache::StateCache;
use super::handle::{COMMAND_CHANNEL_BUFFER, SchedulerHandle};
use super::queue::{QueueError, RunQueue};
use super::types::{
    DagRun, DagRunTask, DagRunTaskState, DagRunTaskStatus, SchedulerCommand, SchedulerError,
    SchedulerState, TickReport,
};

/// Default capacity of the run queue.
pub const DEFAULT_QUEUE_CAPACITY: usize = 1000;

/// Next due time per DAG. `None` means the DAG is never scheduled.
pub type NextSchedules = HashMap<DagId, Option<DateTime<Utc>>>;

/// Next due time for a single DAG, based on its latest stored run.
async fn next_schedule_for_dag<S>(
    dag: &Dag,
    current_time: DateTime<Utc>,
    storage: &S,
) -> Result<Option<DateTime<Utc>>, SchedulerError>
where
    S: Storage + ?Sized,
{
    let Some(schedule) = dag.schedule() else {
        return Ok(None);
    };

    let runs = storage.read_dag_runs(dag.id(), 1).await?;
    let Some(last_run) = runs.first().map(|run| run.at_time) else {
        return Ok(Some(schedule.start_time()));
    };

    if dag.attr().catch_up {
        return Ok(Some(schedule.next(last_run)));
    }

    // Skip everything missed except the most recent occurrence.
    match schedule.last_at_or_before(current_time) {
        Some(latest) if latest > last_run => Ok(Some(latest)),
        _ => Ok(Some(schedule.next(last_run))),
    }
}

/// Compute the next due time of every DAG.
///
/// DAGs without a schedule map to `None`. A DAG that never ran is due at its
/// schedule's start. Otherwise catch-up DAGs are due one interval after their
/// latest run, while the others jump to the latest occurrence at or before
/// `current_time` if that is newer than their latest run.
pub async fn next_schedule_for_dag_runs<S>(
    dags: &[Dag],
    current_time: DateTime<Utc>,
    storage: &S,
) -> Result<NextSchedules, SchedulerError>
where
    S: Storage + ?Sized,
{
    let mut next_schedules = NextSchedules::with_capacity(dags.len());
    for dag in dags {
        let next = next_schedule_for_dag(dag, current_time, storage).await?;
        let shown = next.map(format_timestamp).unwrap_or_else(|| "never".to_string());
        debug!(dag_id = %dag.id(), next = %shown, "Computed next schedule");
        next_schedules.insert(dag.id().clone(), next);
    }
    Ok(next_schedules)
}

/// Decide whether `dag` fires at `current_time`.
///
/// Returns the due time when the DAG has a due time and `current_time` has
/// reached it. The map entry then advances by exactly one occurrence.
pub fn should_be_scheduled(
    dag: &Dag,
    next_schedules: &mut NextSchedules,
    current_time: DateTime<Utc>,
) -> Option<DateTime<Utc>> {
    let due = (*next_schedules.get(dag.id())?)?;
    if current_time < due {
        return None;
    }
    let following = dag.schedule().map(|schedule| schedule.next(due));
    next_schedules.insert(dag.id().clone(), following);
    Some(due)
}

/// Schedule a run of `dag` if it is due: persist it, then queue it.
///
/// The map entry has already advanced when storage or the queue fail, so the
/// failed occurrence is not retried.
pub async fn try_schedule_dag<S>(
    dag: &Dag,
    current_time: DateTime<Utc>,
    queue: &RunQueue<DagRun>,
    next_schedules: &mut NextSchedules,
    storage: &S,
) -> Result<Option<DagRun>, SchedulerError>
where
    S: Storage + ?Sized,
{
    let Some(run) = persist_due_run(dag, current_time, next_schedules, storage).await? else {
        return Ok(None);
    };
    queue.push(run.clone())?;

    info!(dag_id = %dag.id(), at_time = %format_timestamp(run.at_time), "Scheduled new DAG run");
    Ok(Some(run))
}

/// Store the run of `dag` due at `current_time`, if any.
async fn persist_due_run<S>(
    dag: &Dag,
    current_time: DateTime<Utc>,
    next_schedules: &mut NextSchedules,
    storage: &S,
) -> Result<Option<DagRun>, SchedulerError>
where
    S: Storage + ?Sized,
{
    let Some(due) = should_be_scheduled(dag, next_schedules, current_time) else {
        return Ok(None);
    };
    storage.insert_dag_run(dag.id(), due).await?;
    Ok(Some(DagRun::new(dag.id().clone(), due)))
}

/// Main scheduler for DAG runs.
pub struct Scheduler<S: Storage> {
    /// Registered DAGs, in registration order.
    dags: Vec<Dag>,
    /// Storage backend.
    storage: Arc<S>,
    /// Runs waiting for a worker.
    queue: Arc<RunQueue<DagRun>>,
    /// Latest known task statuses.
    task_cache: Arc<StateCache<DagRunTask, DagRunTaskState>>,
    /// Tick interval for checking schedules.
    tick_interval: Duration,
    /// Next due time per DAG, computed on first use.
    next_schedules: Option<NextSchedules>,
    /// Stored runs that did not fit in the queue, oldest first.
    pending: VecDeque<DagRun>,
}

impl<S: Storage + 'static> Scheduler<S> {
    /// Create a new scheduler with the given storage.
    pub fn new(storage: S) -> Self {
        Self::with_storage(Arc::new(storage))
    }

    /// Create a new scheduler with shared storage.
    pub fn with_storage(storage: Arc<S>) -> Self {
        Self {
            dags: Vec::new(),
            storage,
            queue: Arc::new(RunQueue::new(DEFAULT_QUEUE_CAPACITY)),
            task_cache: Arc::new(StateCache::new()),
            tick_interval: Duration::from_secs(1),
            next_schedules: None,
            pending: VecDeque::new(),
        }
    }

    /// Set the tick interval.
    pub fn with_tick_interval(mut self, interval: Duration) -> Self {
        self.tick_interval = interval;
        self
    }

    /// Replace the run queue with an empty one of the given capacity.
    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue = Arc::new(RunQueue::new(capacity));
        self
    }

    /// Register a DAG.
    ///
    /// Invalid DAGs and DAG ids already registered are rejected.
    pub fn register(&mut self, dag: Dag) -> Result<(), SchedulerError> {
        if let Err(source) = dag.validate() {
            return Err(SchedulerError::InvalidDag {
                dag_id: dag.id().clone(),
                source,
            });
        }
        if self.dags.iter().any(|d| d.id() == dag.id()) {
            return Err(SchedulerError::DuplicateDag(dag.id().clone()));
        }
        debug!(dag_id = %dag.id(), "Registered DAG");
        self.dags.push(dag);
        // New DAG needs a due time.
        self.next_schedules = None;
        Ok(())
    }

    /// Get a registered DAG by ID.
    pub fn get_dag(&self, id: &DagId) -> Option<&Dag> {
        self.dags.iter().find(|d| d.id() == id)
    }

    /// List all registered DAGs.
    pub fn dags(&self) -> &[Dag] {
        &self.dags
    }

    pub fn storage(&self) -> &Arc<S> {
        &self.storage
    }

    /// Shared run queue. Workers pop runs from here.
    pub fn queue(&self) -> Arc<RunQueue<DagRun>> {
        Arc::clone(&self.queue)
    }

    /// Shared task status cache.
    pub fn task_cache(&self) -> Arc<StateCache<DagRunTask, DagRunTaskState>> {
        Arc::clone(&self.task_cache)
    }

    /// Current next due times, once computed.
    pub fn next_schedules(&self) -> Option<&NextSchedules> {
        self.next_schedules.as_ref()
    }

    /// Stored runs waiting for room in the queue, oldest first.
    pub fn pending_runs(&self) -> &VecDeque<DagRun> {
        &self.pending
    }

    /// Store every registered DAG and the versions of its tasks, then
    /// compute the next due times.
    pub async fn initialize(&mut self, now: DateTime<Utc>) -> Result<(), SchedulerError> {
        for dag in &self.dags {
            let row = StoredDag::from_dag(dag, now)?;
            info!(
                dag_id = %dag.id(),
                hash_dag_meta = %row.hash_dag_meta,
                hash_tasks = %row.hash_tasks,
                "Syncing DAG to storage"
            );
            self.storage.upsert_dag(row).await?;

            let written = self
                .storage
                .insert_dag_tasks(StoredDagTask::from_dag(dag, now))
                .await?;
            if written > 0 {
                info!(dag_id = %dag.id(), tasks = written, "Stored new task versions");
            }
        }
        let next = next_schedule_for_dag_runs(&self.dags, now, self.storage.as_ref()).await?;
        self.next_schedules = Some(next);
        Ok(())
    }

    /// Run one scheduling pass at `now`.
    ///
    /// Initializes first if needed. Runs held back by an earlier pass are
    /// queued before any new run. A new run is stored, its tasks are
    /// recorded, and then it is queued, or held back while the queue is
    /// full. Failures of individual DAGs are logged and reported without
    /// stopping the pass.
    pub async fn tick(&mut self, now: DateTime<Utc>) -> Result<TickReport, SchedulerError> {
        if self.next_schedules.is_none() {
            self.initialize(now).await?;
        }
        let mut report = TickReport::default();
        self.flush_pending(&mut report);

        let Some(next_schedules) = self.next_schedules.as_mut() else {
            return Ok(report);
        };

        for dag in &self.dags {
            let run = match persist_due_run(dag, now, next_schedules, self.storage.as_ref()).await {
                Ok(Some(run)) => run,
                Ok(None) => continue,
                Err(e) => {
                    warn!(dag_id = %dag.id(), error = %e, "Failed to schedule DAG");
                    report.failures.push((dag.id().clone(), e));
                    continue;
                }
            };

            let at_time = format_timestamp(run.at_time);
            if let Err(e) = record_run_tasks(dag, &run, self.storage.as_ref(), &self.task_cache).await {
                warn!(dag_id = %dag.id(), at_time = %at_time, error = %e, "Failed to record tasks of DAG run");
                report.failures.push((dag.id().clone(), e));
            }

            if !self.pending.is_empty() {
                report.deferred.push(run.clone());
                self.pending.push_back(run);
                continue;
            }
            match self.queue.push(run.clone()) {
                Ok(()) => {
                    info!(dag_id = %dag.id(), at_time = %at_time, "Scheduled new DAG run");
                    report.scheduled.push(run);
                }
                Err(QueueError::Full(capacity)) => {
                    warn!(dag_id = %dag.id(), at_time = %at_time, capacity, "Run queue full, holding DAG run back");
                    report.deferred.push(run.clone());
                    self.pending.push_back(run);
                }
                Err(e) => {
                    warn!(dag_id = %dag.id(), at_time = %at_time, error = %e, "Failed to queue DAG run");
                    report.failures.push((dag.id().clone(), e.into()));
                    self.pending.push_back(run);
                }
            }
        }
        Ok(report)
    }

    /// Queue held back runs in order until the queue is full again.
    fn flush_pending(&mut self, report: &mut TickReport) {
        while let Some(run) = self.pending.front() {
            match self.queue.push(run.clone()) {
                Ok(()) => {}
                Err(QueueError::Full(_)) => break,
                Err(e) => {
                    warn!(dag_id = %run.dag_id, error = %e, "Failed to queue held back DAG run");
                    report.failures.push((run.dag_id.clone(), e.into()));
                    break;
                }
            }
            if let Some(run) = self.pending.pop_front() {
                let at_time = format_timestamp(run.at_time);
                debug!(dag_id = %run.dag_id, at_time = %at_time, "Queued held back DAG run");
                report.scheduled.push(run);
            }
        }
    }

    /// Start the scheduler and return a handle for controlling it.
    pub async fn start(mut self) -> (SchedulerHandle, JoinHandle<()>) {
        if let Err(e) = self.initialize(Utc::now()).await {
            warn!(error = %e, "Initialization failed, retrying on next tick");
        }

        let (command_tx, command_rx) = mpsc::channel(COMMAND_CHANNEL_BUFFER);
        let state = Arc::new(RwLock::new(SchedulerState::Running));

        let handle = SchedulerHandle {
            command_tx,
            state: Arc::clone(&state),
        };

        let scheduler_task = tokio::spawn(async move {
            self.run(command_rx, state).await;
        });

        (handle, scheduler_task)
    }

    /// One pass of the background loop, with logging.
    async fn scheduling_pass(&mut self) -> Result<TickReport, SchedulerError> {
        let report = self.tick(Utc::now()).await;
        match &report {
            Ok(report) if !report.is_empty() => debug!(
                scheduled = report.scheduled.len(),
                failed = report.failures.len(),
                "Scheduling pass finished"
            ),
            Ok(_) => {}
            Err(e) => warn!(error = %e, "Scheduling pass failed"),
        }
        report
    }

    /// Main scheduler loop.
    async fn run(
        mut self,
        mut command_rx: mpsc::Receiver<SchedulerCommand>,
        state: Arc<RwLock<SchedulerState>>,
    ) {
        let mut interval = tokio::time::interval(self.tick_interval);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if *state.read().await == SchedulerState::Running {
                        let _ = self.scheduling_pass().await;
                    }
                }

                Some(command) = command_rx.recv() => {
                    match command {
                        SchedulerCommand::Tick { response } => {
                            let _ = response.send(self.scheduling_pass().await);
                        }
                        SchedulerCommand::Pause { response } => {
                            *state.write().await = SchedulerState::Paused;
                            info!("Scheduler paused");
                            let _ = response.send(());
                        }
                        SchedulerCommand::Resume { response } => {
                            *state.write().await = SchedulerState::Running;
                            // Recompute due times so skip-ahead DAGs drop what was missed.
                            self.next_schedules = None;
                            info!("Scheduler resumed");
                            let _ = response.send(());
                        }
                        SchedulerCommand::Shutdown { response } => {
                            *state.write().await = SchedulerState::Stopped;
                            info!("Scheduler stopped");
                            let _ = response.send(());
                            break;
                        }
                    }
                }
            }
        }
    }
}

/// Record every task of a new run as scheduled, in storage and in the cache.
async fn record_run_tasks<S>(
    dag: &Dag,
    run: &DagRun,
    storage: &S,
    cache: &StateCache<DagRunTask, DagRunTaskState>,
) -> Result<(), SchedulerError>
where
    S: Storage + ?Sized,
{
    for task in dag.flatten() {
        let task_id = TaskId::new(task.id());
        let status_updated_at = storage
            .insert_dag_run_task(&run.dag_id, run.at_time, &task_id)
            .await?;
        let key = DagRunTask::new(run.dag_id.clone(), run.at_time, task_id);
        let state = DagRunTaskState {
            status: DagRunTaskStatus::Scheduled,
            status_updated_at,
        };
        // Replaces anything left over from an earlier run with the same key.
        cache.remove(&key)?;
        cache.add(key, state)?;
    }
    Ok(())
}
