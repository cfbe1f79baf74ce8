//! Coordinator error types.

use crate::kv::KvError;
use thiserror::Error;
use types::workflow::WorkflowError;
use types::{ErrorKind, WorkflowId};

#[derive(Debug, Error)]
pub enum CoordinatorError {
    #[error("workflow {id} is already starting")]
    AlreadyStarting { id: WorkflowId },

    #[error("workflow {id} is already stopping")]
    AlreadyStopping { id: WorkflowId },

    #[error("workflow {id} is already active")]
    AlreadyActive { id: WorkflowId },

    #[error("workflow {id} not found")]
    WorkflowNotFound { id: WorkflowId },

    #[error("rate limited, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    #[error(transparent)]
    Kv(#[from] KvError),

    #[error(transparent)]
    Workflow(#[from] WorkflowError),

    #[error("serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("backend unavailable after {attempts} attempts: {reason}")]
    BackendUnavailable { attempts: u32, reason: String },

    #[error("backend rejected request: {kind}: {message}")]
    BackendRejected { kind: String, message: String },
}

impl CoordinatorError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            CoordinatorError::AlreadyStarting { .. }
            | CoordinatorError::AlreadyStopping { .. } => ErrorKind::LockHeld,
            CoordinatorError::AlreadyActive { .. } => ErrorKind::Validation,
            CoordinatorError::WorkflowNotFound { .. } => ErrorKind::NotFound,
            CoordinatorError::RateLimited { .. } => ErrorKind::RateLimited,
            CoordinatorError::Kv(KvError::ValueTooLarge { .. }) => ErrorKind::Validation,
            CoordinatorError::Kv(_) => ErrorKind::KvUnavailable,
            CoordinatorError::Workflow(_) => ErrorKind::Validation,
            CoordinatorError::Serialization(_) => ErrorKind::Internal,
            CoordinatorError::BackendUnavailable { .. } => ErrorKind::BackendUnavailable,
            CoordinatorError::BackendRejected { .. } => ErrorKind::Validation,
        }
    }
}
