//! Task trait and error types.
//!
//! The `Task` trait is the unit of work placed in a DAG node. Besides running,
//! every task declares a content fingerprint so that changes to its behaviour
//! change the DAG's task hash without any manual version bump.

use async_trait::async_trait;
use thiserror::Error;

/// Errors that can occur during task execution.
#[derive(Debug, Error)]
pub enum TaskError {
    /// Task execution failed with a message.
    #[error("execution failed: {0}")]
    ExecutionFailed(String),
}

/// The core trait for defining executable tasks.
///
/// # Example
///
/// ```ignore
/// use dagsched::{Task, TaskError};
/// use async_trait::async_trait;
///
/// struct Extract {
///     table: String,
/// }
///
/// #[async_trait]
/// impl Task for Extract {
///     fn id(&self) -> &str {
///         "extract"
///     }
///
///     async fn execute(&self) -> Result<(), TaskError> {
///         Ok(())
///     }
///
///     fn fingerprint(&self) -> Vec<u8> {
///         format!("extract:v1:{}", self.table).into_bytes()
///     }
/// }
/// ```
#[async_trait]
pub trait Task: Send + Sync {
    /// Identifier of the task, unique within its DAG.
    fn id(&self) -> &str;

    /// Run the task.
    async fn execute(&self) -> Result<(), TaskError>;

    /// Stable bytes describing what the task does.
    ///
    /// Two tasks with the same fingerprint are treated as the same
    /// definition when hashing a DAG. Include everything that changes the
    /// task's behaviour (command, parameters, a version tag, ...).
    fn fingerprint(&self) -> Vec<u8>;

    /// Optional description for display/logging purposes.
    fn description(&self) -> Option<&str> {
        None
    }

    /// Name of the implementing type, recorded with each task version.
    fn type_name(&self) -> &'static str {
        std::any::type_name::<Self>()
    }
}
