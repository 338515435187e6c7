use cadence_core::types::ExecutionStatus;
use cadence_core::ErrorKind;
use cadence_store::StoreError;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum SchedulerError {
    /// The dispatcher queue stayed full for the whole enqueue timeout.
    #[error("Execution queue is full, please try again")]
    QueueFull,

    #[error("Scheduler is shutting down")]
    ShuttingDown,

    #[error("Execution {id} is {status} and cannot be retried")]
    NotRetryable { id: Uuid, status: ExecutionStatus },

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl SchedulerError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SchedulerError::QueueFull | SchedulerError::ShuttingDown => ErrorKind::Unavailable,
            SchedulerError::NotRetryable { .. } => ErrorKind::Conflict,
            SchedulerError::Store(e) => e.kind(),
        }
    }
}

pub type Result<T> = std::result::Result<T, SchedulerError>;
