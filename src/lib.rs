//! mlpipe - CI/CD orchestrator for machine-learning model promotion
//!
//! Drives a model through three stages (CI, CD, deploy) as a sequence of
//! named steps, persisting every state change to SQLite and fanning live
//! events out to per-run subscribers.
//!
//! # Architecture
//!
//! - Every step and run transition is stored first, then broadcast
//! - Each run's stage flow is an independent tokio task
//! - A run parks at the approval gate until approved or rejected
//! - Failure modes can be toggled to inject deterministic failures
//!
//! # Modules
//!
//! - `adapters`: Experiment tracking (MLflow, in-memory)
//! - `core`: Orchestration logic (Broadcaster, Registry, Executor, Store, Orchestrator)
//! - `domain`: Data structures (Run, StepRecord, Message, Deployment)
//! - `steps`: Built-in step handlers
//! - `cli`: Command-line interface
//!
//! # Usage
//!
//! ```bash
//! # Run CI, then continue through CD and deploy, approving the gate
//! mlpipe run --through --approve
//!
//! # Inject a failure
//! mlpipe run --fail schema_validation
//!
//! # Check run status
//! mlpipe status <run-id>
//!
//! # Roll production back
//! mlpipe rollback
//! ```

pub mod adapters;
pub mod cli;
pub mod config;
pub mod core;
pub mod domain;
pub mod steps;

// Re-export main types at crate root for convenience
pub use adapters::{ExperimentTracker, InMemoryTracker, MlflowTracker};
pub use core::{
    Broadcaster, FailureMode, Orchestrator, PipelineError, PipelineStore, SqliteStore,
    StepExecutor, StepRegistry,
};
pub use domain::{Message, Run, RunStatus, Stage, StepRecord, StepStatus};
