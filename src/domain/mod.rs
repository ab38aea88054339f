//! Domain types for the pipeline orchestrator.
//!
//! This module contains the core data structures:
//! - Run: Pipeline execution state and stage progression
//! - Step: Per-step status and checked transitions
//! - Events: Messages fanned out to subscribers
//! - Deployment: Deployment records and registry entries

pub mod deployment;
pub mod events;
pub mod run;
pub mod step;

use thiserror::Error;

// Re-export commonly used types
pub use deployment::{Deployment, DeploymentStatus, Environment, ModelVersion, RollbackOutcome};
pub use events::{LogLevel, Message};
pub use run::{Run, RunStatus, Stage, RUN_SEED};
pub use step::{InvalidTransition, StepOutput, StepRecord, StepStatus};

/// A string did not name a known variant
#[derive(Debug, Clone, Error)]
#[error("unknown {kind}: '{value}'")]
pub struct ParseEnumError {
    pub kind: &'static str,
    pub value: String,
}

impl ParseEnumError {
    pub fn new(kind: &'static str, value: &str) -> Self {
        Self {
            kind,
            value: value.to_string(),
        }
    }
}
