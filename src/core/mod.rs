//! Core orchestration logic.
//!
//! This module contains:
//! - Broadcaster: Channel-keyed fan-out of messages
//! - Registry: Step catalog and stage sequences
//! - Executor: Step dispatch and failure modes
//! - Store: Persistent run, step and deployment state
//! - Orchestrator: Run lifecycle and approval gate

pub mod broadcaster;
pub mod error;
pub mod executor;
pub mod failure;
pub mod orchestrator;
pub mod registry;
pub mod store;

// Re-export commonly used types
pub use broadcaster::{
    Broadcaster, ChannelSubscriber, DeliveryError, Subscriber, SubscriberId, CLAIMS_STREAM,
};
pub use error::PipelineError;
pub use executor::{ExecutorSettings, StepContext, StepExecutor, StepHandler};
pub use failure::{FailureMode, FailureModeSet, FailureModes};
pub use orchestrator::{
    generate_commit_sha, generate_run_id, ApprovalDecision, Orchestrator, PendingApproval,
    RunStatusView, RunSummary, StartedRun,
};
pub use registry::{CatalogError, StageSequences, StepDefinition, StepRegistry, MANUAL_APPROVAL};
pub use store::{rollback_deployment, PipelineStore, SqliteStore, StoreError};
