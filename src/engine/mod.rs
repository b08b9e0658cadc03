//! The Action Execution Engine: lifecycle rules, approvals, dispatch,
//! execution and workflow composition on top of the Action Store.

pub mod approval;
pub mod coordinator;
pub mod policy;
pub mod recommendation;
pub mod scheduler;
pub mod service;
pub mod state_machine;
#[cfg(test)]
pub(crate) mod testkit;
pub mod workflow;

use uuid::Uuid;

use crate::cloud::ProviderError;
use crate::db::StoreError;
use crate::models::ActionStatus;

pub use approval::ApprovalManager;
pub use coordinator::ExecutionCoordinator;
pub use policy::{PolicyDecision, PolicyTable};
pub use scheduler::{Dispatcher, Reaper, Scheduler};
pub use service::ActionService;
pub use workflow::WorkflowEngine;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("Validation failed: {0}")]
    Validation(String),
    #[error("Approval denied: {0}")]
    ApprovalDenied(String),
    #[error("{0}")]
    InvalidState(String),
    #[error("Invalid transition from {from} to {to}")]
    InvalidTransition {
        from: ActionStatus,
        to: ActionStatus,
    },
    #[error("Approver {0} has already voted on this action")]
    DuplicateVote(Uuid),
    #[error("The creator of an action cannot vote on it")]
    SelfApproval,
    #[error("User {0} is not a required approver for this action")]
    NotAnApprover(Uuid),
    #[error("{0} not found")]
    NotFound(String),
    #[error("Unsupported operation: {0}")]
    UnsupportedOperation(String),
    #[error(transparent)]
    Provider(#[from] ProviderError),
    #[error("Verification failed: {0}")]
    VerificationFailed(String),
    #[error("Rollback failed: {0}")]
    RollbackFailed(String),
    #[error("Execution pool is saturated, try again later")]
    Saturated,
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl EngineError {
    pub fn action_not_found(id: Uuid) -> Self {
        EngineError::NotFound(format!("Action {id}"))
    }
}
