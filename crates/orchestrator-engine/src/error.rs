//! Crate-wide error type. Each taxonomy row from the error handling design
//! maps to one variant here; `#[from]` conversions let component errors
//! (store, resource pool) cross into the orchestration boundary the way
//! `durable::engine::executor::ExecutorError` wraps `StoreError`.

use orchestrator_contracts::{ErrorKind, OrchestratorErrorRecord};

use crate::persistence::StoreError;
use crate::resources::ResourceError;

#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error("invalid workflow definition: {0}")]
    ConfigInvalid(String),

    #[error("resource request denied: {0}")]
    ResourceDenied(String),

    #[error("step failed: {0}")]
    StepFailed(String),

    #[error("checkpoint corrupted: {0}")]
    CheckpointCorrupted(String),

    #[error("human task rejected")]
    HumanRejected,

    #[error("human task timed out")]
    HumanTimeout,

    #[error("nested operator cancelled")]
    OperatorCancelled,

    #[error("persistence store unavailable: {0}")]
    StoreUnavailable(#[from] StoreError),

    #[error("execution cancelled")]
    Cancelled,

    #[error("execution not found: {0}")]
    ExecutionNotFound(String),

    #[error("human task not found: {0}")]
    HumanTaskNotFound(String),
}

impl From<ResourceError> for OrchestratorError {
    fn from(err: ResourceError) -> Self {
        OrchestratorError::ResourceDenied(err.to_string())
    }
}

impl OrchestratorError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            OrchestratorError::ConfigInvalid(_) => ErrorKind::ConfigInvalid,
            OrchestratorError::ResourceDenied(_) => ErrorKind::ResourceDenied,
            OrchestratorError::StepFailed(_) => ErrorKind::StepFailed,
            OrchestratorError::CheckpointCorrupted(_) => ErrorKind::CheckpointCorrupted,
            OrchestratorError::HumanRejected => ErrorKind::HumanRejected,
            OrchestratorError::HumanTimeout => ErrorKind::HumanTimeout,
            OrchestratorError::OperatorCancelled => ErrorKind::OperatorCancelled,
            OrchestratorError::StoreUnavailable(_) => ErrorKind::StoreUnavailable,
            OrchestratorError::Cancelled => ErrorKind::Cancelled,
            OrchestratorError::ExecutionNotFound(_) | OrchestratorError::HumanTaskNotFound(_) => {
                ErrorKind::ConfigInvalid
            }
        }
    }

    /// §7: whether this error belongs on the retryable path vs. a direct
    /// transition to `recovery`/`failed`.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            OrchestratorError::StepFailed(_) | OrchestratorError::StoreUnavailable(_)
        )
    }

    pub fn to_record(&self) -> OrchestratorErrorRecord {
        if self.is_retryable() {
            OrchestratorErrorRecord::retryable(self.kind(), self.to_string())
        } else {
            OrchestratorErrorRecord::new(self.kind(), self.to_string())
        }
    }
}
