//! Error taxonomy of the orchestration engine.

use thiserror::Error;

use crate::domain::InvalidTransition;

use super::registry::CatalogError;
use super::store::StoreError;

/// Errors surfaced by the orchestrator and executor
#[derive(Debug, Error)]
pub enum PipelineError {
    /// Run, step instance or approval marker does not exist
    #[error("{0} not found")]
    NotFound(String),

    /// Step name has no catalog entry or no handler
    #[error("unknown step: {0}")]
    UnknownStep(String),

    /// A handler failed (simulated failure modes, collaborator failures, ...)
    #[error("step '{step}' failed: {message}")]
    StepExecution { step: String, message: String },

    /// Request is not valid in the current state; nothing was mutated
    #[error("precondition failed: {0}")]
    Precondition(String),

    #[error(transparent)]
    Transition(#[from] InvalidTransition),

    #[error(transparent)]
    Catalog(#[from] CatalogError),

    #[error(transparent)]
    Store(#[from] StoreError),

    /// A run's execution task panicked
    #[error("execution task for run {run_id} aborted: {reason}")]
    TaskFailed { run_id: String, reason: String },
}

impl PipelineError {
    /// Errors that the orchestrator records on the step and converts into
    /// a failed run
    pub fn is_step_level(&self) -> bool {
        matches!(
            self,
            PipelineError::StepExecution { .. } | PipelineError::UnknownStep(_)
        )
    }
}
