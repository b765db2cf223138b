//! Handle for controlling a started scheduler.
//!
//! The scheduler loop owns its DAGs and schedule state. Everything else talks
//! to it through [`SchedulerHandle`], which sends commands over a channel and
//! waits for the loop to acknowledge them.

use std::sync::Arc;

use tokio::sync::{RwLock, mpsc, oneshot};

use super::types::{SchedulerCommand, SchedulerError, SchedulerState, TickReport};

/// Buffer size for the command channel between SchedulerHandle and Scheduler.
pub(crate) const COMMAND_CHANNEL_BUFFER: usize = 32;

/// Cloneable handle to a running scheduler loop.
#[derive(Clone)]
pub struct SchedulerHandle {
    pub(crate) command_tx: mpsc::Sender<SchedulerCommand>,
    pub(crate) state: Arc<RwLock<SchedulerState>>,
}

impl SchedulerHandle {
    /// Send a command built around a reply channel and wait for the reply.
    async fn request<T>(
        &self,
        build_command: impl FnOnce(oneshot::Sender<T>) -> SchedulerCommand,
        operation: &str,
    ) -> Result<T, SchedulerError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.command_tx
            .send(build_command(reply_tx))
            .await
            .map_err(|_| SchedulerError::ChannelError(format!("scheduler gone, cannot {}", operation)))?;

        reply_rx
            .await
            .map_err(|_| SchedulerError::ChannelError(format!("no reply to {}", operation)))
    }

    /// Run a scheduling pass now, without waiting for the next tick.
    ///
    /// Works while paused.
    pub async fn tick_now(&self) -> Result<TickReport, SchedulerError> {
        self.request(|response| SchedulerCommand::Tick { response }, "tick")
            .await?
    }

    /// Stop scheduling on ticks until resumed.
    pub async fn pause(&self) -> Result<(), SchedulerError> {
        self.request(|response| SchedulerCommand::Pause { response }, "pause")
            .await
    }

    /// Resume after a pause.
    ///
    /// Next schedules are recomputed, so DAGs without catch-up skip the
    /// occurrences missed while paused.
    pub async fn resume(&self) -> Result<(), SchedulerError> {
        self.request(|response| SchedulerCommand::Resume { response }, "resume")
            .await
    }

    /// Stop the loop. Returns once the loop has acknowledged.
    pub async fn shutdown(&self) -> Result<(), SchedulerError> {
        self.request(|response| SchedulerCommand::Shutdown { response }, "shutdown")
            .await
    }

    pub async fn state(&self) -> SchedulerState {
        *self.state.read().await
    }

    pub async fn is_running(&self) -> bool {
        self.state().await == SchedulerState::Running
    }

    pub async fn is_paused(&self) -> bool {
        self.state().await == SchedulerState::Paused
    }
}
