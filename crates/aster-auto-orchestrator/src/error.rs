/*
[INPUT]:  Validation failures, store errors, supervisor failures
[OUTPUT]: OrchestratorError with a coarse ErrorKind for callers
[POS]:    Error handling layer - the error surface of start/stop/create
[UPDATE]: When adding new failure modes to the orchestrator or task service
*/

use aster_auto_core::types::{StrategyId, TaskId, UserId, WalletId, WalletType};
use thiserror::Error;

use crate::state_machine::StateError;
use crate::supervisor::SupervisorError;

/// Rejections raised before any resource is allocated.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("wallet type {wallet_type} is not supported by strategy {strategy}")]
    WalletStrategyMismatch {
        wallet_type: WalletType,
        strategy: String,
    },

    #[error("strategy type {0} is not registered")]
    StrategyNotRegistered(String),

    #[error("user {0} is inactive")]
    InactiveUser(UserId),

    #[error("wallet {0} is inactive")]
    InactiveWallet(WalletId),

    #[error("strategy {0} is inactive")]
    InactiveStrategy(StrategyId),

    #[error("wallet {wallet_id} does not belong to user {user_id}")]
    WalletNotOwned { wallet_id: WalletId, user_id: UserId },

    #[error("invalid {field}: {reason}")]
    InvalidParameter { field: &'static str, reason: String },

    #[error("task name {0} is already used")]
    DuplicateName(String),

    #[error("task {0} is running")]
    TaskRunning(TaskId),
}

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("task {task_id} already has a live process (pid {pid})")]
    AlreadyRunning { task_id: TaskId, pid: u32 },

    #[error("user {user_id} already runs {running} of {max_tasks} allowed tasks")]
    QuotaExceeded {
        user_id: UserId,
        running: u32,
        max_tasks: u32,
    },

    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: i64 },

    #[error("cannot allocate resources for task {task_id}: {reason}")]
    ResourceAllocation { task_id: TaskId, reason: String },

    #[error("process failure for task {task_id}: {source}")]
    ProcessFailure {
        task_id: TaskId,
        #[source]
        source: SupervisorError,
    },

    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    ResourceAllocation,
    ProcessFailure,
    Store,
}

impl OrchestratorError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            OrchestratorError::Validation(_)
            | OrchestratorError::AlreadyRunning { .. }
            | OrchestratorError::QuotaExceeded { .. }
            | OrchestratorError::NotFound { .. } => ErrorKind::Validation,
            OrchestratorError::ResourceAllocation { .. } => ErrorKind::ResourceAllocation,
            OrchestratorError::ProcessFailure { .. } => ErrorKind::ProcessFailure,
            OrchestratorError::Store(_) => ErrorKind::Store,
        }
    }

    pub(crate) fn not_found(entity: &'static str, id: i64) -> Self {
        OrchestratorError::NotFound { entity, id }
    }
}

// An illegal transition means the row changed under a held lock.
impl From<StateError> for OrchestratorError {
    fn from(err: StateError) -> Self {
        OrchestratorError::Store(anyhow::Error::new(err))
    }
}

pub type OrchestratorResult<T> = Result<T, OrchestratorError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_groups_rejections() {
        let quota = OrchestratorError::QuotaExceeded {
            user_id: 1,
            running: 2,
            max_tasks: 2,
        };
        assert_eq!(quota.kind(), ErrorKind::Validation);

        let mismatch = OrchestratorError::from(ValidationError::WalletStrategyMismatch {
            wallet_type: WalletType::Futures,
            strategy: "spot-grid".to_string(),
        });
        assert_eq!(mismatch.kind(), ErrorKind::Validation);
        assert_eq!(
            mismatch.to_string(),
            "wallet type futures is not supported by strategy spot-grid"
        );

        let store = OrchestratorError::from(anyhow::anyhow!("disk full"));
        assert_eq!(store.kind(), ErrorKind::Store);
    }

    #[test]
    fn test_resource_allocation_kind() {
        let err = OrchestratorError::ResourceAllocation {
            task_id: 3,
            reason: "invalid key or ciphertext".to_string(),
        };
        assert_eq!(err.kind(), ErrorKind::ResourceAllocation);
        assert!(err.to_string().contains("task 3"));
    }
}
